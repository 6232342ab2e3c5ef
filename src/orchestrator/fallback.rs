//! Two-step backend strategy: primary first, one retry on a retryable
//! client failure.

use tracing::{error, info, warn};

use crate::backend::{AgentBackend, BackendRequest, UpdateCallback};
use crate::errors::SdkError;
use crate::models::execution::ExecutionResult;
use crate::{AppError, Result};

/// Whether a client error qualifies for the subprocess retry.
///
/// Malformed-stream and grouped failures qualify, as do client failures
/// whose message carries one of
/// [`RETRYABLE_MESSAGE_MARKERS`](crate::errors::RETRYABLE_MESSAGE_MARKERS).
#[must_use]
pub fn is_retryable_sdk_error(err: &SdkError) -> bool {
    err.is_retryable()
}

/// Whether an execution error qualifies for the subprocess retry.
///
/// Only client errors can qualify; timeouts, process failures, usage
/// limits and validation aborts never do.
#[must_use]
pub fn is_retryable(err: &AppError) -> bool {
    matches!(err, AppError::Sdk(inner) if is_retryable_sdk_error(inner))
}

/// Run `primary`, retrying once on `fallback` for retryable failures.
///
/// `on_attempt` is called once per backend call and supplies that call's
/// stream callback, so per-attempt state starts clean on the retry.
///
/// When the retry fails too, its error is logged and the primary's
/// original error is returned.
///
/// # Errors
///
/// Returns the primary backend's error when it is not retryable, when no
/// fallback is configured, or when the fallback also fails.
pub async fn execute_with_fallback<F>(
    primary: &dyn AgentBackend,
    fallback: Option<&dyn AgentBackend>,
    request: &BackendRequest,
    mut on_attempt: F,
) -> Result<ExecutionResult>
where
    F: FnMut(&dyn AgentBackend) -> Option<UpdateCallback>,
{
    let original = match primary.execute(request, on_attempt(primary)).await {
        Ok(result) => return Ok(result),
        Err(err) => err,
    };

    let Some(fallback) = fallback.filter(|_| is_retryable(&original)) else {
        return Err(original);
    };

    warn!(
        primary = primary.name(),
        fallback = fallback.name(),
        err = %original,
        "primary backend failed with a retryable error, retrying"
    );

    match fallback.execute(request, on_attempt(fallback)).await {
        Ok(result) => {
            info!(fallback = fallback.name(), "fallback backend succeeded");
            Ok(result)
        }
        Err(fallback_err) => {
            error!(
                fallback_err = %fallback_err,
                original = %original,
                "fallback backend also failed, returning original error"
            );
            Err(original)
        }
    }
}
