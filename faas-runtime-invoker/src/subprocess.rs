//! Subprocess handler execution
//!
//! Each invocation spawns the function binary with the payload on stdin and
//! the invocation context in its environment. The wire protocol:
//!
//! - exit 0: stdout is the response body
//! - non-zero exit with an error JSON object as the last stderr line: an
//!   application error carrying the handler's `errorType`
//! - any other exit, or death by signal: a crash
//!
//! The child is killed if it is still running at the deadline, or as soon
//! as stdout grows past the response size limit. Completion is the child's
//! exit, not EOF on its pipes: descendants that keep the pipes open get a
//! short drain window and are then ignored.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use faas_runtime_core::{
    ErrorResponse, HandlerFailure, InitError, InitializationResult, InvocationContext,
    InvocationOutcome, RawFailure,
};

use crate::response::{timeout_outcome, validate_response};
use crate::{HandlerInvoker, InvokerConfig};

/// How long pipes are still read after the handler process has exited
pub const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Longest stderr line kept; the rest of the line is dropped
pub const MAX_STDERR_LINE_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Runs the function binary as a child process per invocation
#[derive(Debug, Clone)]
pub struct SubprocessInvoker {
    task_root: PathBuf,
    handler: Option<String>,
    config: InvokerConfig,
}

/// What a finished child left behind
#[derive(Debug)]
enum ChildRun {
    Exited {
        status: ExitStatus,
        stdout: Vec<u8>,
        last_line: Option<String>,
    },
    Oversized {
        last_line: Option<String>,
    },
}

enum Collected {
    Complete,
    Oversized,
}

impl SubprocessInvoker {
    /// `handler` is resolved against `task_root` unless it is absolute
    pub fn new(task_root: impl Into<PathBuf>, handler: Option<String>, config: InvokerConfig) -> Self {
        Self {
            task_root: task_root.into(),
            handler,
            config,
        }
    }

    /// Locate the handler executable
    pub fn resolve_executable(&self) -> Result<PathBuf, InitError> {
        let handler = self
            .handler
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| InitError::new("Runtime.MissingHandler", "_HANDLER is not set"))?;

        let path = if Path::new(handler).is_absolute() {
            PathBuf::from(handler)
        } else {
            self.task_root.join(handler)
        };

        let metadata = std::fs::metadata(&path).map_err(|e| {
            InitError::new(
                "Runtime.HandlerNotFound",
                format!("handler '{}' not found: {e}", path.display()),
            )
        })?;
        if !metadata.is_file() || !is_executable(&metadata) {
            return Err(InitError::new(
                "Runtime.HandlerNotFound",
                format!("handler '{}' is not an executable file", path.display()),
            ));
        }

        Ok(path)
    }

    async fn run_child(&self, executable: &Path, input: Bytes, context: &InvocationContext) -> io::Result<ChildRun> {
        let mut child = Command::new(executable)
            .current_dir(&self.task_root)
            .envs(context.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin separately so a child that never reads it cannot stall us
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(error = %e, "Handler closed stdin early");
                }
            });
        }

        let mut stdout = Vec::new();
        let mut stderr = StderrForwarder::new(&context.request_id);
        let finished = {
            let collecting = collect_output(
                child.stdout.take(),
                child.stderr.take(),
                self.config.max_response_bytes,
                &mut stdout,
                &mut stderr,
            );
            tokio::pin!(collecting);

            tokio::select! {
                collected = &mut collecting => match collected? {
                    Collected::Oversized => None,
                    Collected::Complete => Some(child.wait().await?),
                },
                status = child.wait() => {
                    let status = status?;
                    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut collecting).await {
                        Ok(Ok(Collected::Oversized)) => None,
                        Ok(Err(e)) => return Err(e),
                        Ok(Ok(Collected::Complete)) => Some(status),
                        Err(_) => {
                            debug!(request_id = %context.request_id, "Handler exited with its output pipes still open");
                            Some(status)
                        }
                    }
                }
            }
        };

        let last_line = stderr.finish();
        match finished {
            Some(status) => Ok(ChildRun::Exited {
                status,
                stdout,
                last_line,
            }),
            None => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Oversized handler already gone");
                }
                Ok(ChildRun::Oversized { last_line })
            }
        }
    }

    fn classify(&self, run: ChildRun, context: &InvocationContext) -> InvocationOutcome {
        let (status, stdout, last_line) = match run {
            ChildRun::Oversized { last_line } => {
                forward_logs(last_line.as_deref(), context);
                warn!(request_id = %context.request_id, limit = self.config.max_response_bytes, "Handler output over the size limit, child killed");
                return self.config.reporter.classify(RawFailure::MalformedResponse {
                    detail: format!(
                        "response exceeds the limit of {} bytes",
                        self.config.max_response_bytes
                    ),
                });
            }
            ChildRun::Exited {
                status,
                stdout,
                last_line,
            } => (status, stdout, last_line),
        };

        if status.success() {
            forward_logs(last_line.as_deref(), context);
            return validate_response(Bytes::from(stdout), &self.config);
        }

        let structured = last_line
            .as_deref()
            .and_then(|last| serde_json::from_str::<ErrorResponse>(last.trim()).ok());
        if let Some(error) = structured {
            return self.config.reporter.classify(HandlerFailure::from(error).into_raw());
        }

        forward_logs(last_line.as_deref(), context);
        let mut detail = describe_exit(status);
        if let Some(last) = &last_line {
            detail.push_str(": ");
            detail.push_str(last.trim());
        }
        self.config.reporter.classify(RawFailure::HandlerCrashed { detail })
    }
}

#[async_trait]
impl HandlerInvoker for SubprocessInvoker {
    async fn init(&self) -> InitializationResult {
        match self.resolve_executable() {
            Ok(path) => {
                info!(handler = %path.display(), "Resolved subprocess handler");
                InitializationResult::Ready
            }
            Err(err) => InitializationResult::InitError(err),
        }
    }

    async fn invoke(&self, input: Bytes, context: &InvocationContext) -> InvocationOutcome {
        let budget = context.remaining_time();
        if budget.is_zero() {
            warn!(request_id = %context.request_id, "Invocation arrived past its deadline");
            return timeout_outcome(context, budget, &self.config);
        }

        let executable = match self.resolve_executable() {
            Ok(path) => path,
            Err(err) => {
                return self.config.reporter.classify(RawFailure::HandlerCrashed {
                    detail: format!("handler unavailable: {}", err.error_message),
                });
            }
        };

        let started = Instant::now();
        match tokio::time::timeout(budget, self.run_child(&executable, input, context)).await {
            // Dropping the run future drops the child, which kills it
            Err(_) => {
                warn!(request_id = %context.request_id, ?budget, "Handler timed out, child killed");
                timeout_outcome(context, budget, &self.config)
            }
            Ok(Err(e)) => self.config.reporter.classify(RawFailure::HandlerCrashed {
                detail: format!("failed to run handler '{}': {e}", executable.display()),
            }),
            Ok(Ok(run)) => {
                debug!(
                    request_id = %context.request_id,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Handler process finished"
                );
                self.classify(run, context)
            }
        }
    }
}

/// Read both pipes until EOF, stopping once stdout passes `limit`
async fn collect_output(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    limit: usize,
    out: &mut Vec<u8>,
    forwarder: &mut StderrForwarder,
) -> io::Result<Collected> {
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                match read? {
                    0 => stdout = None,
                    n => {
                        out.extend_from_slice(&out_buf[..n]);
                        if out.len() > limit {
                            return Ok(Collected::Oversized);
                        }
                    }
                }
            }
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                match read? {
                    0 => stderr = None,
                    n => forwarder.push(&err_buf[..n]),
                }
            }
            else => return Ok(Collected::Complete),
        }
    }
}

async fn read_some<R: AsyncRead + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => Ok(0),
    }
}

/// Logs handler stderr as it arrives, holding back the latest line
///
/// The latest non-blank line may be the structured error report, so it is
/// only logged once the exit status says it is not.
struct StderrForwarder {
    request_id: String,
    partial: Vec<u8>,
    held: Option<String>,
}

impl StderrForwarder {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            partial: Vec::new(),
            held: None,
        }
    }

    fn push(&mut self, mut chunk: &[u8]) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            self.append(&chunk[..pos]);
            self.end_line();
            chunk = &chunk[pos + 1..];
        }
        self.append(chunk);
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = MAX_STDERR_LINE_BYTES.saturating_sub(self.partial.len());
        self.partial.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn end_line(&mut self) {
        let line = String::from_utf8_lossy(&self.partial).trim_end().to_string();
        self.partial.clear();
        if line.trim().is_empty() {
            return;
        }
        if let Some(previous) = self.held.replace(line) {
            info!(target: "handler", request_id = %self.request_id, "{previous}");
        }
    }

    /// Flush the unterminated tail and return the latest line
    fn finish(&mut self) -> Option<String> {
        self.end_line();
        self.held.take()
    }
}

/// Re-emit a held-back stderr line through the runtime's log
fn forward_logs(line: Option<&str>, context: &InvocationContext) {
    if let Some(line) = line {
        info!(target: "handler", request_id = %context.request_id, "{line}");
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("handler exited with status {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("handler terminated by signal {signal}");
        }
    }

    "handler terminated abnormally".to_string()
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
