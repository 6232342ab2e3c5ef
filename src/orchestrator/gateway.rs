//! Execution gateway: the top-level `execute` / `continue_session` contract.
//!
//! Per call the gateway:
//! 1. resolves or creates the session through the [`SessionRegistry`],
//! 2. picks fresh / continue / resume from whether the session is confirmed,
//! 3. wraps the caller's callback, once per backend attempt, in a
//!    [`ToolGuard`] that validates every capability call before forwarding it,
//! 4. runs the primary backend with one fallback retry,
//! 5. promotes the placeholder id and records usage.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, info_span, warn, Instrument};

use super::fallback::execute_with_fallback;
use super::session_registry::SessionRegistry;
use crate::backend::{AgentBackend, BackendRequest, CallbackFuture, Invocation, UpdateCallback};
use crate::errors::tool_remediation;
use crate::models::execution::{ExecutionRequest, ExecutionResult, ResultErrorKind};
use crate::models::stream::StreamUpdate;
use crate::models::validation::RejectionReason;
use crate::policy::validator::{attempt, ToolValidator};
use crate::{AppError, Result};

/// Capability names whose rejection aborts the run immediately.
pub const DEFAULT_CRITICAL_TOOLS: &[&str] = &["Task", "Read", "Write", "Edit", "MultiEdit"];

/// Top-level execution entry point.
pub struct ExecutionGateway {
    primary: Arc<dyn AgentBackend>,
    fallback: Option<Arc<dyn AgentBackend>>,
    registry: Arc<SessionRegistry>,
    validator: Arc<ToolValidator>,
    critical_tools: Arc<[String]>,
}

impl std::fmt::Debug for ExecutionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGateway")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|b| b.name()))
            .field("critical_tools", &self.critical_tools)
            .finish_non_exhaustive()
    }
}

impl ExecutionGateway {
    /// Create a gateway over one backend.
    #[must_use]
    pub fn new(
        primary: Arc<dyn AgentBackend>,
        registry: Arc<SessionRegistry>,
        validator: Arc<ToolValidator>,
    ) -> Self {
        Self {
            primary,
            fallback: None,
            registry,
            validator,
            critical_tools: DEFAULT_CRITICAL_TOOLS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// Retry retryable primary failures once on `fallback`.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn AgentBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Replace the critical capability set.
    #[must_use]
    pub fn with_critical_tools(mut self, critical: Vec<String>) -> Self {
        self.critical_tools = critical.into();
        self
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The tool validator.
    #[must_use]
    pub fn validator(&self) -> &Arc<ToolValidator> {
        &self.validator
    }

    /// Run one prompt for `user_id` in `working_directory`.
    ///
    /// # Errors
    ///
    /// - `AppError::ToolValidation` when a critical capability is blocked.
    /// - `AppError::Timeout`, `AppError::Process`, `AppError::UsageLimit`,
    ///   `AppError::Parsing` or `AppError::Sdk` from the backend.
    /// - `AppError::Unauthorized` when `session_id` belongs to another user.
    pub async fn execute(
        &self,
        prompt: &str,
        working_directory: &Path,
        user_id: &str,
        session_id: Option<&str>,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let request = ExecutionRequest {
            prompt: prompt.to_owned(),
            working_directory: working_directory.to_path_buf(),
            session_id: session_id.map(str::to_owned),
            continue_session: false,
        };
        self.execute_request(&request, user_id, on_update).await
    }

    /// Continue the user's most recent confirmed session in a directory.
    ///
    /// Returns `Ok(None)` when there is nothing to continue. An absent
    /// prompt continues without new input.
    ///
    /// # Errors
    ///
    /// Same as [`ExecutionGateway::execute`].
    pub async fn continue_session(
        &self,
        user_id: &str,
        working_directory: &Path,
        prompt: Option<&str>,
        on_update: Option<UpdateCallback>,
    ) -> Result<Option<ExecutionResult>> {
        let Some(session) = self
            .registry
            .find_latest_confirmed(user_id, working_directory)
            .await?
        else {
            info!(user_id, "no confirmed session to continue");
            return Ok(None);
        };

        let request = ExecutionRequest {
            prompt: prompt.unwrap_or_default().to_owned(),
            working_directory: working_directory.to_path_buf(),
            session_id: Some(session.id),
            continue_session: true,
        };
        self.execute_request(&request, user_id, on_update)
            .await
            .map(Some)
    }

    /// Run one [`ExecutionRequest`].
    ///
    /// # Errors
    ///
    /// Same as [`ExecutionGateway::execute`].
    pub async fn execute_request(
        &self,
        request: &ExecutionRequest,
        user_id: &str,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let span = info_span!(
            "execute",
            user_id,
            cwd = %request.working_directory.display(),
            session_id = tracing::field::Empty,
        );
        self.run(request, user_id, on_update).instrument(span).await
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        user_id: &str,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let session = self
            .registry
            .get_or_create(user_id, &request.working_directory, request.session_id.as_deref())
            .await?;
        tracing::Span::current().record("session_id", session.id.as_str());

        let confirmed = (!session.is_temporary()).then_some(session.id.as_str());
        let invocation = Invocation::select(&request.prompt, confirmed);
        info!(
            ?invocation,
            continue_session = request.continue_session,
            "dispatching execution"
        );

        let backend_request = BackendRequest {
            prompt: request.prompt.clone(),
            working_directory: request.working_directory.clone(),
            invocation,
        };
        // One guard per attempt; the last one built belongs to the result.
        let mut guard: Option<Arc<ToolGuard>> = None;
        let outcome = execute_with_fallback(
            self.primary.as_ref(),
            self.fallback.as_deref(),
            &backend_request,
            |backend| {
                debug!(backend = backend.name(), "arming tool guard");
                let fresh = Arc::new(ToolGuard {
                    validator: Arc::clone(&self.validator),
                    critical: Arc::clone(&self.critical_tools),
                    user_id: user_id.to_owned(),
                    working_directory: request.working_directory.clone(),
                    blocked: Mutex::new(Vec::new()),
                    downstream: on_update.clone(),
                });
                let callback = ToolGuard::callback(&fresh);
                guard = Some(fresh);
                Some(callback)
            },
        )
        .await;

        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                error!(%err, "execution failed");
                if session.is_temporary() {
                    self.registry.discard_placeholder(&session.id).await;
                }
                return Err(err);
            }
        };

        if let Some(guard) = &guard {
            guard.apply(&mut result);
        }

        let mut session_id = session.id.clone();
        if session.is_temporary() && !result.session_id.is_empty() {
            match self.registry.promote(&session.id, &result.session_id).await {
                Ok(promoted) => session_id = promoted.id,
                Err(err) => warn!(%err, "session promotion failed"),
            }
        }
        if let Err(err) = self.registry.record_usage(&session_id, &result).await {
            warn!(%err, session_id, "failed to record session usage");
        }

        result.session_id = session_id;
        info!(
            session_id = %result.session_id,
            cost = result.cost,
            num_turns = result.num_turns,
            is_error = result.is_error,
            "execution completed"
        );
        Ok(result)
    }

    /// Terminate every in-flight backend call. Returns how many were signalled.
    pub fn shutdown(&self) -> usize {
        let mut count = self.primary.shutdown();
        if let Some(fallback) = &self.fallback {
            count += fallback.shutdown();
        }
        info!(count, "gateway shutdown");
        count
    }
}

/// Validating wrapper around the caller's stream callback.
struct ToolGuard {
    validator: Arc<ToolValidator>,
    critical: Arc<[String]>,
    user_id: String,
    working_directory: std::path::PathBuf,
    blocked: Mutex<Vec<String>>,
    downstream: Option<UpdateCallback>,
}

impl ToolGuard {
    fn callback(guard: &Arc<Self>) -> UpdateCallback {
        let guard = Arc::clone(guard);
        Arc::new(move |update| -> CallbackFuture {
            let guard = Arc::clone(&guard);
            Box::pin(async move { guard.inspect(update).await })
        })
    }

    async fn inspect(&self, update: StreamUpdate) -> Result<()> {
        for call in update.tool_calls() {
            let outcome = self.validator.validate(&attempt(
                &call.name,
                &call.input,
                &self.working_directory,
                &self.user_id,
            ));
            if outcome.allowed {
                continue;
            }

            let outcome = outcome.with_blocked(self.block(&call.name));
            if self.critical.iter().any(|c| *c == call.name) {
                error!(tool_name = %call.name, blocked = ?outcome.blocked, "critical tool blocked, aborting");
                return Err(AppError::ToolValidation {
                    blocked: outcome.blocked,
                    allowed: self.validator.allowed_tools().to_vec(),
                });
            }
            warn!(
                tool_name = %call.name,
                reason = outcome.reason.as_ref().map(RejectionReason::code),
                blocked = ?outcome.blocked,
                "tool blocked, continuing"
            );
        }

        match &self.downstream {
            Some(callback) => callback(update).await,
            None => Ok(()),
        }
    }

    /// Record a blocked name and return every name blocked so far.
    fn block(&self, name: &str) -> Vec<String> {
        let mut blocked = self.blocked.lock().unwrap_or_else(PoisonError::into_inner);
        if !blocked.iter().any(|b| b == name) {
            blocked.push(name.to_owned());
        }
        blocked.clone()
    }

    /// Mark a completed result as errored when anything was blocked.
    fn apply(&self, result: &mut ExecutionResult) {
        let blocked = self
            .blocked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if blocked.is_empty() {
            return;
        }
        warn!(
            ?blocked,
            original_content = %result.content,
            "execution completed with blocked tools"
        );
        result.content = tool_remediation(&blocked, self.validator.allowed_tools());
        result.is_error = true;
        result.error_kind = Some(ResultErrorKind::ToolValidation { blocked });
    }
}
