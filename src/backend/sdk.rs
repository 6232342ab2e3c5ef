//! SDK backend: drives a typed client that yields native message objects.
//!
//! The [`AgentClient`] seam hides how messages are produced. The default
//! [`CliAgentClient`] runs the located backend executable and decodes its
//! output into [`SdkMessage`] values. The decoding is strict: an unknown
//! message type or undecodable line surfaces as
//! [`SdkError::MalformedStream`], which the gateway treats as retryable.
//!
//! [`SdkBackend`] normalizes every [`SdkMessage`] into the same
//! [`StreamUpdate`](crate::models::stream::StreamUpdate) shape the
//! subprocess backend emits.

use std::collections::VecDeque;
use std::future::Future;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::args::{build_args, Invocation};
use super::locator::{ensure_on_path, locate_executable, EXECUTABLE_NAME, NOT_FOUND_REMEDIATION};
use super::subprocess::{read_capped, MAX_STDERR_BYTES};
use super::{deliver, AgentBackend, BackendRequest, InFlightCalls, UpdateCallback};
use crate::errors::SdkError;
use crate::models::execution::{ExecutionResult, ToolUsage};
use crate::models::stream::StreamUpdate;
use crate::stream::codec::StreamCodec;
use crate::stream::parser::{
    assistant_kind, system_kind, user_kind, MessageBody, ParsedLine, ResultMessage,
};
use crate::stream::summary::summarize;
use crate::{AppError, Result};

/// Result alias for client-level operations.
pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Stream of typed messages produced by one client query.
pub type SdkMessageStream = Pin<Box<dyn Stream<Item = SdkResult<SdkMessage>> + Send>>;

// ── Typed message model ──────────────────────────────────────────────────────

/// An `assistant` or `user` message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ConversationMessage {
    /// Backend session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Message body.
    #[serde(default)]
    pub message: MessageBody,
}

/// A `system` message.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SystemMessage {
    /// Subtype (e.g. `init`).
    #[serde(default)]
    pub subtype: Option<String>,
    /// Backend session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Every other field.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Native message objects produced by an [`AgentClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum SdkMessage {
    /// Model output.
    Assistant(ConversationMessage),
    /// User echo or capability results.
    User(ConversationMessage),
    /// System information.
    System(SystemMessage),
    /// Terminal result.
    Result(ResultMessage),
}

impl SdkMessage {
    /// Decode one line of client output.
    ///
    /// # Errors
    ///
    /// Returns [`SdkError::MalformedStream`] when the line is not JSON, has
    /// an unknown `type`, or does not match the typed shape.
    pub fn parse(line: &str) -> SdkResult<Self> {
        let value: Value = serde_json::from_str(line).map_err(decode_error)?;
        Self::from_value(value)
    }

    /// Decode one already-parsed JSON object.
    ///
    /// # Errors
    ///
    /// See [`SdkMessage::parse`].
    pub fn from_value(value: Value) -> SdkResult<Self> {
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("assistant") => serde_json::from_value(value)
                .map(Self::Assistant)
                .map_err(decode_error),
            Some("user") => serde_json::from_value(value)
                .map(Self::User)
                .map_err(decode_error),
            Some("system") => serde_json::from_value(value)
                .map(Self::System)
                .map_err(decode_error),
            Some("result") => serde_json::from_value(value)
                .map(Self::Result)
                .map_err(decode_error),
            Some(other) => Err(SdkError::MalformedStream(format!(
                "Unknown message type: {other}"
            ))),
            None => Err(SdkError::MalformedStream(
                "Unknown message type: missing type field".into(),
            )),
        }
    }

    /// Normalize into the shared update shape.
    #[must_use]
    pub fn normalize(self) -> ParsedLine {
        match self {
            Self::Assistant(msg) => ParsedLine::Update(StreamUpdate::new(
                assistant_kind(&msg.message.content),
                msg.session_id,
            )),
            Self::User(msg) => ParsedLine::Update(StreamUpdate::new(
                user_kind(&msg.message.content),
                msg.session_id,
            )),
            Self::System(msg) => ParsedLine::Update(StreamUpdate::new(
                system_kind(msg.subtype, &msg.data),
                msg.session_id,
            )),
            Self::Result(msg) => ParsedLine::Result(msg.into_result()),
        }
    }

    /// Raw JSON form used for post-hoc summarization.
    fn audit_value(&self) -> Option<Value> {
        match self {
            Self::Assistant(msg) => Some(json!({
                "type": "assistant",
                "message": { "content": msg.message.content },
            })),
            Self::User(msg) => Some(json!({
                "type": "user",
                "message": { "content": msg.message.content },
            })),
            Self::System(_) | Self::Result(_) => None,
        }
    }
}

fn decode_error(err: serde_json::Error) -> SdkError {
    SdkError::MalformedStream(format!("Failed to decode JSON: {err}"))
}

// ── Client seam ──────────────────────────────────────────────────────────────

/// Parameters for one client query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Prompt text.
    pub prompt: String,
    /// Working directory.
    pub working_directory: PathBuf,
    /// Fresh, continue or resume.
    pub invocation: Invocation,
    /// Turn cap.
    pub max_turns: u32,
    /// Capability allow-list.
    pub allowed_tools: Vec<String>,
}

/// An in-process client producing typed messages.
pub trait AgentClient: Send + Sync {
    /// Start one query and return its message stream.
    ///
    /// # Errors
    ///
    /// Returns an [`SdkError`] when the query cannot be started.
    fn query<'a>(
        &'a self,
        options: &'a QueryOptions,
    ) -> Pin<Box<dyn Future<Output = SdkResult<SdkMessageStream>> + Send + 'a>>;
}

/// Default client: runs the located backend executable.
#[derive(Debug, Clone)]
pub struct CliAgentClient {
    executable: PathBuf,
    envs: Vec<(String, String)>,
    max_line_bytes: usize,
    read_chunk_bytes: usize,
}

impl CliAgentClient {
    /// Client for an explicit executable.
    #[must_use]
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            envs: Vec::new(),
            max_line_bytes: crate::stream::codec::MAX_LINE_BYTES,
            read_chunk_bytes: 8192,
        }
    }

    /// Locate the executable on the host.
    ///
    /// An explicit path wins. Otherwise `PATH` and the well-known install
    /// locations are searched; a hit has its directory added to `PATH`. A
    /// miss is logged and the bare name is kept so the failure surfaces as
    /// [`SdkError::ExecutableNotFound`] on first use.
    #[must_use]
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        if let Some(path) = explicit {
            return Self::new(path);
        }
        match locate_executable(EXECUTABLE_NAME) {
            Some(path) => {
                ensure_on_path(&path);
                info!(path = %path.display(), "backend executable located");
                Self::new(path)
            }
            None => {
                warn!(
                    name = EXECUTABLE_NAME,
                    "backend executable not found on PATH or in well-known locations"
                );
                Self::new(PathBuf::from(EXECUTABLE_NAME))
            }
        }
    }

    /// Extra environment for the child.
    #[must_use]
    pub fn with_envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs = envs;
        self
    }

    /// Output framing limits.
    #[must_use]
    pub fn with_limits(mut self, max_line_bytes: usize, read_chunk_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self.read_chunk_bytes = read_chunk_bytes;
        self
    }

    /// The executable this client runs.
    #[must_use]
    pub fn executable(&self) -> &std::path::Path {
        &self.executable
    }

    fn spawn(&self, options: &QueryOptions) -> SdkResult<SdkMessageStream> {
        let args = build_args(
            &options.prompt,
            &options.invocation,
            options.max_turns,
            &options.allowed_tools,
        );
        let mut child = Command::new(&self.executable)
            .args(&args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&options.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => SdkError::ExecutableNotFound {
                    remediation: NOT_FOUND_REMEDIATION.to_owned(),
                },
                _ => SdkError::Connection(format!("failed to start backend: {err}")),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SdkError::Connection("backend stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, MAX_STDERR_BYTES)));
        debug!(pid = child.id().unwrap_or(0), "client process started");

        let state = ClientStream {
            lines: FramedRead::with_capacity(
                stdout,
                StreamCodec::with_max_line_bytes(self.max_line_bytes),
                self.read_chunk_bytes,
            ),
            child,
            stderr,
            finished: false,
            resume_after_error: false,
        };
        Ok(Box::pin(stream::unfold(state, ClientStream::next_item)))
    }
}

impl AgentClient for CliAgentClient {
    fn query<'a>(
        &'a self,
        options: &'a QueryOptions,
    ) -> Pin<Box<dyn Future<Output = SdkResult<SdkMessageStream>> + Send + 'a>> {
        Box::pin(async move { self.spawn(options) })
    }
}

/// Unfold state for [`CliAgentClient`] output. Dropping it kills the child.
struct ClientStream {
    lines: FramedRead<ChildStdout, StreamCodec>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
    resume_after_error: bool,
}

impl ClientStream {
    async fn next_item(mut self) -> Option<(SdkResult<SdkMessage>, Self)> {
        if self.finished {
            return None;
        }
        loop {
            match self.lines.next().await {
                Some(Ok(line)) if line.trim().is_empty() => {}
                Some(Ok(line)) => {
                    self.resume_after_error = false;
                    return Some((SdkMessage::parse(&line), self));
                }
                Some(Err(AppError::Parsing(msg))) => {
                    self.resume_after_error = true;
                    return Some((Err(SdkError::MalformedStream(msg)), self));
                }
                // FramedRead ends the stream once after a decode error, then resumes.
                None if self.resume_after_error => self.resume_after_error = false,
                Some(Err(err)) => {
                    self.finished = true;
                    return Some((Err(SdkError::Connection(err.to_string())), self));
                }
                None => {
                    self.finished = true;
                    let failure = self.exit_failure().await?;
                    return Some((Err(failure), self));
                }
            }
        }
    }

    async fn exit_failure(&mut self) -> Option<SdkError> {
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(err) => return Some(SdkError::Connection(format!("wait failed: {err}"))),
        };
        if status.success() {
            return None;
        }
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        Some(SdkError::Process {
            exit_code: status.code(),
            stderr: stderr.trim().to_owned(),
        })
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

/// Per-call limits for the SDK backend.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    /// Turn cap.
    pub max_turns: u32,
    /// Capability allow-list.
    pub allowed_tools: Vec<String>,
    /// Wall-clock budget for one call.
    pub timeout: Duration,
    /// Messages retained for summarization.
    pub max_buffered_messages: usize,
}

/// Backend that consumes an [`AgentClient`].
pub struct SdkBackend {
    client: Arc<dyn AgentClient>,
    config: SdkConfig,
    in_flight: InFlightCalls,
}

impl std::fmt::Debug for SdkBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkBackend")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl SdkBackend {
    /// Create a backend over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn AgentClient>, config: SdkConfig) -> Self {
        Self {
            client,
            config,
            in_flight: InFlightCalls::default(),
        }
    }

    async fn run(
        &self,
        request: &BackendRequest,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "sdk_execute",
            correlation_id = %correlation_id,
            cwd = %request.working_directory.display(),
        );

        self.run_tracked(&correlation_id, request, on_update)
            .instrument(span)
            .await
    }

    async fn run_tracked(
        &self,
        correlation_id: &str,
        request: &BackendRequest,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let cancel = self.in_flight.register(correlation_id);
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AppError::Process {
                exit_code: None,
                stderr: "terminated by shutdown".into(),
            }),
            res = tokio::time::timeout(self.config.timeout, self.consume(request, on_update.as_ref())) => {
                res.unwrap_or_else(|_elapsed| {
                    warn!(timeout = ?self.config.timeout, "client call timed out, abandoning");
                    Err(AppError::Timeout { seconds: self.config.timeout.as_secs() })
                })
            }
        };
        self.in_flight.deregister(correlation_id);

        let mut result = outcome?;
        if result.duration_ms == 0 {
            result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
        info!(session_id = %result.session_id, num_turns = result.num_turns, "client call completed");
        Ok(result)
    }

    async fn consume(
        &self,
        request: &BackendRequest,
        on_update: Option<&UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let options = QueryOptions {
            prompt: request.prompt.clone(),
            working_directory: request.working_directory.clone(),
            invocation: request.invocation.clone(),
            max_turns: self.config.max_turns,
            allowed_tools: self.config.allowed_tools.clone(),
        };
        let mut messages = self.client.query(&options).await?;

        let capacity = self.config.max_buffered_messages;
        let mut raw: VecDeque<Value> = VecDeque::new();
        let mut tools_used = Vec::new();
        let mut result = None;
        let mut failures: Vec<SdkError> = Vec::new();

        while let Some(item) = messages.next().await {
            let message = match item {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "client stream failure");
                    failures.push(err);
                    continue;
                }
            };
            // After a failure only further causes are collected.
            if !failures.is_empty() {
                continue;
            }
            if let Some(value) = message.audit_value().filter(|_| capacity > 0) {
                if raw.len() == capacity {
                    raw.pop_front();
                }
                raw.push_back(value);
            }
            match message.normalize() {
                ParsedLine::Update(update) => {
                    tools_used.extend(update.tool_calls().iter().map(|call| ToolUsage {
                        name: call.name.clone(),
                        timestamp: update.timestamp,
                        input: call.input.clone(),
                    }));
                    deliver(on_update, update).await?;
                }
                ParsedLine::Result(done) => result = Some(done),
                ParsedLine::Empty => {}
            }
        }

        match failures.len() {
            0 => {}
            1 => {
                let err = failures.remove(0);
                return Err(AppError::Sdk(err));
            }
            _ => {
                let grouped = SdkError::Grouped(failures);
                warn!(primary = %grouped.most_relevant(), "client raised grouped failures");
                return Err(AppError::Sdk(grouped));
            }
        }

        let mut result = result.ok_or_else(|| {
            AppError::Parsing("client stream ended without a result message".into())
        })?;
        let raw: Vec<Value> = raw.into_iter().collect();
        result.tools_used = tools_used;
        result.summary = Some(summarize(&raw));
        Ok(result)
    }
}

impl AgentBackend for SdkBackend {
    fn name(&self) -> &'static str {
        "sdk"
    }

    fn execute<'a>(
        &'a self,
        request: &'a BackendRequest,
        on_update: Option<UpdateCallback>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionResult>> + Send + 'a>> {
        Box::pin(self.run(request, on_update))
    }

    fn shutdown(&self) -> usize {
        let count = self.in_flight.cancel_all();
        info!(count, "sdk backend shutdown requested");
        count
    }
}
