//! Path confinement and symlink-escape detection.
//!
//! Capability calls that name a file must stay under the approved root.
//! Relative paths resolve against the call's working directory, `..`
//! segments are folded lexically, and existing paths (or their nearest
//! existing ancestor) are canonicalized to catch symlink escapes.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Check that a capability's target path stays inside an approved root.
pub trait PathConfinement: Send + Sync {
    /// Resolve `path` (relative to `working_directory`) and confirm it is
    /// confined.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::PathViolation`] when the path escapes.
    fn confine(&self, path: &str, working_directory: &Path) -> Result<PathBuf>;
}

/// Default confinement: everything under one approved directory.
#[derive(Debug, Clone)]
pub struct WorkspaceConfinement {
    root: PathBuf,
}

impl WorkspaceConfinement {
    /// Confine to `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The approved root as configured.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathConfinement for WorkspaceConfinement {
    fn confine(&self, path: &str, working_directory: &Path) -> Result<PathBuf> {
        validate_path(&self.root, working_directory, path)
    }
}

/// Validate that `candidate` resolves inside `root`.
///
/// Relative candidates are joined onto `base` first. Returns the resolved
/// absolute path on success.
///
/// # Errors
///
/// Returns [`AppError::PathViolation`] if:
/// - `root` cannot be canonicalized,
/// - `..` segments climb above the filesystem root,
/// - the resolved path is outside `root`,
/// - a symlink on the path points outside `root`.
pub fn validate_path(root: &Path, base: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("approved root invalid: {err}")))?;

    let candidate = candidate.as_ref();
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
        base.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() || normalized.as_os_str().is_empty() {
                    return Err(AppError::PathViolation(
                        "path climbs above the filesystem root".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                normalized.push(component);
            }
        }
    }

    let resolved = resolve_existing_prefix(&normalized)?;
    if !resolved.starts_with(&root) {
        return Err(AppError::PathViolation(format!(
            "{} is outside the approved directory",
            candidate.display()
        )));
    }
    Ok(resolved)
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}
