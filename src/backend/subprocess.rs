//! Subprocess backend: spawns the backend executable per call.
//!
//! Each call:
//! - builds the argument vector with [`build_args`],
//! - spawns the executable in the working directory with
//!   `kill_on_drop(true)` and piped stdout/stderr,
//! - reads stdout in bounded chunks through [`StreamCodec`], parsing every
//!   complete line independently (malformed lines are counted and skipped),
//! - keeps only the most recent raw messages for post-hoc summarization,
//! - bounds the whole call with one wall-clock timeout; on expiry the
//!   process is force-killed and [`AppError::Timeout`] is returned.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::args::build_args;
use super::{deliver, AgentBackend, BackendRequest, InFlightCalls, UpdateCallback};
use crate::models::execution::{ExecutionResult, ToolUsage};
use crate::stream::codec::StreamCodec;
use crate::stream::parser::{parse_line, ParsedLine};
use crate::stream::summary::summarize;
use crate::{AppError, Result};

/// Phrase in failure output that identifies provider throttling.
pub const USAGE_LIMIT_PHRASE: &str = "usage limit reached";

/// Upper bound on captured stderr; the rest is drained and dropped.
pub(super) const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Grace period between SIGTERM and SIGKILL on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for the subprocess backend.
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    /// Backend executable.
    pub executable: PathBuf,
    /// Turn cap passed to every call.
    pub max_turns: u32,
    /// Capability allow-list passed to every call.
    pub allowed_tools: Vec<String>,
    /// Wall-clock budget for one call.
    pub timeout: Duration,
    /// Raw messages retained for summarization.
    pub max_buffered_messages: usize,
    /// Read buffer size for stdout.
    pub read_chunk_bytes: usize,
    /// Longest accepted output line.
    pub max_line_bytes: usize,
    /// Extra environment for the child (e.g. API credentials).
    pub envs: Vec<(String, String)>,
}

/// Backend that runs the executable as a child process per call.
#[derive(Debug)]
pub struct SubprocessBackend {
    config: SubprocessConfig,
    in_flight: InFlightCalls,
}

impl SubprocessBackend {
    /// Create a backend with the given configuration.
    #[must_use]
    pub fn new(config: SubprocessConfig) -> Self {
        Self {
            config,
            in_flight: InFlightCalls::default(),
        }
    }

    /// Calls currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn run(
        &self,
        request: &BackendRequest,
        on_update: Option<UpdateCallback>,
    ) -> Result<ExecutionResult> {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "subprocess_execute",
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
        let args = build_args(
            &request.prompt,
            &request.invocation,
            self.config.max_turns,
            &self.config.allowed_tools,
        );
        let started = Instant::now();

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&args)
            .envs(self.config.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&request.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| AppError::Process {
            exit_code: None,
            stderr: format!("failed to spawn backend: {err}"),
        })?;
        info!(pid = child.id().unwrap_or(0), "backend process spawned");

        let cancel = self.in_flight.register(correlation_id);
        let outcome = tokio::time::timeout(
            self.config.timeout,
            self.drive(&mut child, on_update.as_ref(), &cancel),
        )
        .await;
        self.in_flight.deregister(correlation_id);

        let mut result = match outcome {
            Err(_elapsed) => {
                warn!(timeout = ?self.config.timeout, "backend call timed out, killing process");
                terminate(&mut child, Duration::ZERO).await;
                return Err(AppError::Timeout {
                    seconds: self.config.timeout.as_secs(),
                });
            }
            Ok(Err(err)) => {
                let grace = if cancel.is_cancelled() {
                    SHUTDOWN_GRACE
                } else {
                    Duration::ZERO
                };
                terminate(&mut child, grace).await;
                return Err(err);
            }
            Ok(Ok(result)) => result,
        };

        if result.duration_ms == 0 {
            result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        }
        info!(
            session_id = %result.session_id,
            num_turns = result.num_turns,
            is_error = result.is_error,
            "backend call completed"
        );
        Ok(result)
    }

    async fn drive(
        &self,
        child: &mut Child,
        on_update: Option<&UpdateCallback>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let stdout = child.stdout.take().ok_or_else(|| AppError::Process {
            exit_code: None,
            stderr: "failed to capture backend stdout".into(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| AppError::Process {
            exit_code: None,
            stderr: "failed to capture backend stderr".into(),
        })?;
        let stderr_task = tokio::spawn(read_capped(stderr, MAX_STDERR_BYTES));

        let codec = StreamCodec::with_max_line_bytes(self.config.max_line_bytes);
        let mut lines = FramedRead::with_capacity(stdout, codec, self.config.read_chunk_bytes);
        let mut collector = StreamCollector::new(self.config.max_buffered_messages);
        // FramedRead ends the stream once after a decode error, then resumes.
        let mut resume_after_error = false;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    info!("backend call cancelled by shutdown");
                    return Err(AppError::Process {
                        exit_code: None,
                        stderr: "terminated by shutdown".into(),
                    });
                }

                item = lines.next() => match item {
                    None if resume_after_error => resume_after_error = false,
                    None => break,
                    Some(Ok(line)) => {
                        resume_after_error = false;
                        collector.ingest(&line, on_update).await?;
                    }
                    Some(Err(AppError::Io(msg))) => {
                        warn!(error = %msg, "backend stdout read failed, stopping");
                        break;
                    }
                    Some(Err(err)) => {
                        resume_after_error = true;
                        collector.malformed += 1;
                        warn!(%err, "backend output framing error, skipping");
                    }
                },
            }
        }
        // Release stdout so a child still writing gets EPIPE instead of blocking.
        drop(lines);

        let status = child.wait().await.map_err(|err| AppError::Process {
            exit_code: None,
            stderr: format!("failed waiting for backend: {err}"),
        })?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!(exit_code = ?status.code(), "backend process exited with failure");
            return Err(classify_exit(status.code(), &stderr_text));
        }

        collector.finish()
    }
}

impl AgentBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
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
        info!(count, "subprocess backend shutdown requested");
        count
    }
}

// ── Stream collection ────────────────────────────────────────────────────────

/// Per-call stream state: raw ring buffer, observed tool usage, terminal result.
#[derive(Debug)]
struct StreamCollector {
    raw: VecDeque<Value>,
    capacity: usize,
    tools_used: Vec<ToolUsage>,
    result: Option<ExecutionResult>,
    malformed: usize,
}

impl StreamCollector {
    fn new(capacity: usize) -> Self {
        Self {
            raw: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            tools_used: Vec::new(),
            result: None,
            malformed: 0,
        }
    }

    async fn ingest(&mut self, line: &str, on_update: Option<&UpdateCallback>) -> Result<()> {
        match parse_line(line) {
            Ok(ParsedLine::Empty) => {}
            Ok(ParsedLine::Update(update)) => {
                self.retain(line);
                self.tools_used.extend(update.tool_calls().iter().map(|call| ToolUsage {
                    name: call.name.clone(),
                    timestamp: update.timestamp,
                    input: call.input.clone(),
                }));
                deliver(on_update, update).await?;
            }
            Ok(ParsedLine::Result(result)) => {
                self.retain(line);
                self.result = Some(result);
            }
            Err(err) => {
                self.malformed += 1;
                debug!(%err, raw_line = %line, "skipping malformed backend line");
            }
        }
        Ok(())
    }

    fn retain(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if self.raw.len() == self.capacity {
                self.raw.pop_front();
            }
            self.raw.push_back(value);
        }
    }

    fn finish(self) -> Result<ExecutionResult> {
        if self.malformed > 0 {
            warn!(malformed = self.malformed, "backend stream contained malformed lines");
        }
        let mut result = self.result.ok_or_else(|| {
            AppError::Parsing(format!(
                "backend exited without a result message ({} malformed lines)",
                self.malformed
            ))
        })?;
        let raw: Vec<Value> = self.raw.into_iter().collect();
        result.tools_used = self.tools_used;
        result.summary = Some(summarize(&raw));
        Ok(result)
    }
}

// ── Failure classification ───────────────────────────────────────────────────

/// Translate a non-zero exit into the error taxonomy.
///
/// Usage-limit output becomes [`AppError::UsageLimit`]; anything else is a
/// generic [`AppError::Process`] carrying the exit code and captured text.
#[must_use]
pub fn classify_exit(exit_code: Option<i32>, stderr: &str) -> AppError {
    detect_usage_limit(stderr).unwrap_or_else(|| AppError::Process {
        exit_code,
        stderr: stderr.trim().to_owned(),
    })
}

/// Recognize provider throttling in failure output.
#[must_use]
pub fn detect_usage_limit(text: &str) -> Option<AppError> {
    if !text.to_lowercase().contains(USAGE_LIMIT_PHRASE) {
        return None;
    }
    let reset_at = reset_time_token(text);
    let message = match &reset_at {
        Some(token) => format!(
            "Usage limit reached. Your limit resets at {token}. Please try again after that."
        ),
        None => "Usage limit reached. Please wait for the limit to reset and try again."
            .to_owned(),
    };
    Some(AppError::UsageLimit { reset_at, message })
}

/// Extract a human reset-time token such as `2pm` or `10:30 am`.
#[must_use]
pub fn reset_time_token(text: &str) -> Option<String> {
    static RESET_RE: OnceLock<Option<Regex>> = OnceLock::new();
    RESET_RE
        .get_or_init(|| {
            Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2}(?::\d{2})?\s?[ap]\.?m\.?)").ok()
        })
        .as_ref()?
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

// ── Process helpers ──────────────────────────────────────────────────────────

/// Read `reader` to the end, keeping at most `cap` bytes, lossily decoded.
pub(super) async fn read_capped<R>(mut reader: R, cap: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Stop a child: SIGTERM and wait up to `grace` (unix), then force-kill.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if !grace.is_zero() {
        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            let pid = nix::unistd::Pid::from_raw(pid);
            if let Err(err) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!(%err, "SIGTERM delivery failed");
            }
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                debug!(?status, "backend process exited after SIGTERM");
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        debug!(%err, "backend process kill failed (already exited?)");
    }
}
