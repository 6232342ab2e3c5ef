//! Argument vector construction for the backend executable.
//!
//! [`build_args`] is a pure function of its inputs: the same
//! (prompt, invocation, max-turns, allow-list) always yields the same
//! vector.

/// Non-interactive prompt flag.
pub const FLAG_PROMPT: &str = "-p";
/// Resume a conversation by id.
pub const FLAG_RESUME: &str = "--resume";
/// Continue the most recent conversation without new input.
pub const FLAG_CONTINUE: &str = "--continue";
/// Output format selector.
pub const FLAG_OUTPUT_FORMAT: &str = "--output-format";
/// Streaming structured output: one JSON object per line.
pub const OUTPUT_FORMAT_STREAM_JSON: &str = "stream-json";
/// Required alongside [`OUTPUT_FORMAT_STREAM_JSON`] in non-interactive mode.
pub const FLAG_VERBOSE: &str = "--verbose";
/// Turn cap.
pub const FLAG_MAX_TURNS: &str = "--max-turns";
/// Comma-separated capability allow-list.
pub const FLAG_ALLOWED_TOOLS: &str = "--allowedTools";

/// How a request relates to prior conversation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// New conversation with a prompt.
    Fresh,
    /// Continue without new input, optionally pinned to a session id.
    Continue {
        /// Session to resume, when known.
        resume_id: Option<String>,
    },
    /// Resume a confirmed session with a new prompt.
    Resume {
        /// Confirmed session id.
        session_id: String,
    },
}

impl Invocation {
    /// Choose the invocation from whether a confirmed session exists.
    ///
    /// An empty prompt always continues; a non-empty prompt resumes the
    /// confirmed session or starts fresh.
    #[must_use]
    pub fn select(prompt: &str, confirmed_session_id: Option<&str>) -> Self {
        match (prompt.is_empty(), confirmed_session_id) {
            (true, id) => Self::Continue {
                resume_id: id.map(str::to_owned),
            },
            (false, Some(id)) => Self::Resume {
                session_id: id.to_owned(),
            },
            (false, None) => Self::Fresh,
        }
    }

    /// Session id this invocation resumes, if any.
    #[must_use]
    pub fn resume_id(&self) -> Option<&str> {
        match self {
            Self::Fresh => None,
            Self::Continue { resume_id } => resume_id.as_deref(),
            Self::Resume { session_id } => Some(session_id),
        }
    }

    /// Whether this continues prior conversation state.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

/// Build the argument vector for one backend call.
#[must_use]
pub fn build_args(
    prompt: &str,
    invocation: &Invocation,
    max_turns: u32,
    allowed_tools: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match invocation {
        Invocation::Fresh => {
            args.extend([FLAG_PROMPT.to_owned(), prompt.to_owned()]);
        }
        Invocation::Continue { resume_id } => {
            args.push(FLAG_CONTINUE.to_owned());
            if let Some(id) = resume_id {
                args.extend([FLAG_RESUME.to_owned(), id.clone()]);
            }
        }
        Invocation::Resume { session_id } => {
            args.extend([
                FLAG_RESUME.to_owned(),
                session_id.clone(),
                FLAG_PROMPT.to_owned(),
                prompt.to_owned(),
            ]);
        }
    }

    args.extend([
        FLAG_OUTPUT_FORMAT.to_owned(),
        OUTPUT_FORMAT_STREAM_JSON.to_owned(),
        FLAG_VERBOSE.to_owned(),
        FLAG_MAX_TURNS.to_owned(),
        max_turns.to_string(),
    ]);

    if !allowed_tools.is_empty() {
        args.extend([FLAG_ALLOWED_TOOLS.to_owned(), allowed_tools.join(",")]);
    }

    args
}
