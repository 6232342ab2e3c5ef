//! Backend abstraction shared by the subprocess and in-process clients.
//!
//! The [`AgentBackend`] trait decouples the Execution Gateway from how the
//! coding backend is reached. Both implementations consume the same
//! streaming contract and emit the same [`StreamUpdate`] shape, so the
//! gateway is backend-agnostic.

pub mod args;
pub mod locator;
pub mod sdk;
pub mod subprocess;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::execution::ExecutionResult;
use crate::models::stream::StreamUpdate;
use crate::Result;

pub use args::Invocation;

/// Boxed future returned by stream callbacks.
pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Caller-supplied stream callback.
///
/// Returning an error whose [`AppError::aborts_stream`](crate::AppError::aborts_stream)
/// is `true` stops the execution; any other error is logged and the stream
/// continues.
pub type UpdateCallback = Arc<dyn Fn(StreamUpdate) -> CallbackFuture + Send + Sync>;

/// Everything a backend needs to run once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    /// Prompt text; empty when continuing without new input.
    pub prompt: String,
    /// Directory the backend runs in.
    pub working_directory: PathBuf,
    /// Fresh, continue or resume.
    pub invocation: Invocation,
}

/// Uniform interface over the subprocess and in-process backends.
pub trait AgentBackend: Send + Sync {
    /// Short name for logging (`subprocess`, `sdk`).
    fn name(&self) -> &'static str;

    /// Run one request, delivering updates in backend order, and return the
    /// terminal result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Timeout`](crate::AppError::Timeout) when the
    /// wall-clock budget is exceeded, [`AppError::Process`](crate::AppError::Process)
    /// or [`AppError::Sdk`](crate::AppError::Sdk) on transport failure,
    /// [`AppError::Parsing`](crate::AppError::Parsing) when no terminal
    /// message arrives, and any stream-aborting callback error unchanged.
    fn execute<'a>(
        &'a self,
        request: &'a BackendRequest,
        on_update: Option<UpdateCallback>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult>> + Send + 'a>>;

    /// Terminate every in-flight call. Returns how many were signalled.
    fn shutdown(&self) -> usize;
}

/// Deliver one update to the callback.
///
/// Callback failures are logged and swallowed unless they abort the stream.
///
/// # Errors
///
/// Returns the callback's error when it aborts the stream.
pub async fn deliver(on_update: Option<&UpdateCallback>, update: StreamUpdate) -> Result<()> {
    let Some(callback) = on_update else {
        return Ok(());
    };
    let kind = update.kind_name().to_owned();
    match callback(update).await {
        Ok(()) => Ok(()),
        Err(err) if err.aborts_stream() => Err(err),
        Err(err) => {
            warn!(%err, kind, "stream callback failed, continuing");
            Ok(())
        }
    }
}

/// Table of in-flight calls keyed by per-call correlation id.
///
/// Owned by one backend; each entry is removed by the call that inserted it.
/// [`InFlightCalls::cancel_all`] lets a global shutdown terminate every
/// outstanding call deterministically.
#[derive(Debug, Clone, Default)]
pub struct InFlightCalls {
    calls: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl InFlightCalls {
    /// Register a call and return its cancellation token.
    #[must_use]
    pub fn register(&self, correlation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_owned(), token.clone());
        token
    }

    /// Remove a finished call.
    pub fn deregister(&self, correlation_id: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
    }

    /// Number of calls currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no calls are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every in-flight call. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let guard = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        for (correlation_id, token) in guard.iter() {
            debug!(correlation_id, "cancelling in-flight call");
            token.cancel();
        }
        guard.len()
    }
}
