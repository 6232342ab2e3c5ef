//! Host lookup for the backend executable.
//!
//! Searches the inherited `PATH` first, then a prioritized list of
//! well-known install locations. A hit outside `PATH` has its directory
//! prepended to the process-wide `PATH` so child processes spawned by the
//! client resolve the same binary.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

/// Default executable name.
pub const EXECUTABLE_NAME: &str = "claude";

/// Well-known install locations, in priority order.
///
/// Relative entries are resolved against the user's home directory.
pub const WELL_KNOWN_LOCATIONS: &[&str] = &[
    ".claude/local/claude",
    ".npm-global/bin/claude",
    ".local/bin/claude",
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
    "/usr/bin/claude",
];

/// Remediation text attached to executable-not-found failures.
pub const NOT_FOUND_REMEDIATION: &str = "The coding backend CLI was not found. Install it with \
`npm install -g @anthropic-ai/claude-code`, make sure it is on PATH, or set \
`backend.cli_path` in the configuration file.";

/// Expand [`WELL_KNOWN_LOCATIONS`] against `home`.
///
/// Home-relative entries are skipped when `home` is `None`.
#[must_use]
pub fn candidate_paths(home: Option<&Path>) -> Vec<PathBuf> {
    WELL_KNOWN_LOCATIONS
        .iter()
        .filter_map(|entry| {
            if entry.starts_with('/') {
                Some(PathBuf::from(entry))
            } else {
                home.map(|h| h.join(entry))
            }
        })
        .collect()
}

/// Locate `name` on `PATH`, then in the well-known locations.
#[must_use]
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(name) {
        debug!(path = %path.display(), "backend executable found on PATH");
        return Some(path);
    }

    candidate_paths(dirs::home_dir().as_deref())
        .into_iter()
        .find(|candidate| candidate.is_file())
}

/// Prepend the executable's directory to the process `PATH` if absent.
///
/// Returns `true` when `PATH` was changed.
pub fn ensure_on_path(executable: &Path) -> bool {
    let Some(dir) = executable.parent() else {
        return false;
    };
    let current = env::var_os("PATH").unwrap_or_default();
    if env::split_paths(&current).any(|entry| entry == dir) {
        return false;
    }

    let mut entries = vec![dir.to_path_buf()];
    entries.extend(env::split_paths(&current));
    match env::join_paths(entries) {
        Ok(joined) => {
            set_path(&joined);
            info!(dir = %dir.display(), "extended PATH with backend executable directory");
            true
        }
        Err(err) => {
            debug!(%err, "could not extend PATH");
            false
        }
    }
}

fn set_path(value: &OsString) {
    env::set_var("PATH", value);
}
