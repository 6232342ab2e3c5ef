//! Unit tests for backend argument construction.

use agent_relay::backend::args::{build_args, Invocation};

fn tools(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}

#[test]
fn fresh_invocation_passes_prompt_and_stream_flags() {
    let args = build_args("list files", &Invocation::Fresh, 10, &tools(&["Read", "Bash"]));
    assert_eq!(
        args,
        vec![
            "-p",
            "list files",
            "--output-format",
            "stream-json",
            "--verbose",
            "--max-turns",
            "10",
            "--allowedTools",
            "Read,Bash",
        ]
    );
}

#[test]
fn resume_passes_session_then_prompt() {
    let invocation = Invocation::Resume {
        session_id: "abc123".into(),
    };
    let args = build_args("next step", &invocation, 5, &[]);
    assert_eq!(&args[..4], &["--resume", "abc123", "-p", "next step"]);
    assert!(!args.iter().any(|a| a == "--allowedTools"));
}

#[test]
fn continue_without_prompt_omits_prompt_flag() {
    let invocation = Invocation::Continue {
        resume_id: Some("abc123".into()),
    };
    let args = build_args("", &invocation, 3, &[]);
    assert_eq!(&args[..3], &["--continue", "--resume", "abc123"]);
    assert!(!args.iter().any(|a| a == "-p"));
}

#[test]
fn continue_without_id() {
    let args = build_args("", &Invocation::Continue { resume_id: None }, 3, &[]);
    assert_eq!(args[0], "--continue");
    assert_eq!(args[1], "--output-format");
}

#[test]
fn build_args_is_deterministic() {
    let allowed = tools(&["Read"]);
    let invocation = Invocation::Resume {
        session_id: "s".into(),
    };
    assert_eq!(
        build_args("p", &invocation, 7, &allowed),
        build_args("p", &invocation, 7, &allowed)
    );
}

#[test]
fn select_uses_confirmed_id_only() {
    assert_eq!(Invocation::select("hi", None), Invocation::Fresh);
    assert_eq!(
        Invocation::select("hi", Some("abc")),
        Invocation::Resume {
            session_id: "abc".into()
        }
    );
    assert_eq!(
        Invocation::select("", Some("abc")),
        Invocation::Continue {
            resume_id: Some("abc".into())
        }
    );
    assert_eq!(
        Invocation::select("", None),
        Invocation::Continue { resume_id: None }
    );
}

#[test]
fn resume_id_and_continuation_flags() {
    assert!(!Invocation::Fresh.is_continuation());
    assert_eq!(Invocation::Fresh.resume_id(), None);
    let resume = Invocation::Resume {
        session_id: "x".into(),
    };
    assert!(resume.is_continuation());
    assert_eq!(resume.resume_id(), Some("x"));
}
