//! External obfuscator invocation
//!
//! Launches the obfuscator as a child process, captures stdout/stderr up to
//! a fixed cap and races completion against a wall-clock timeout.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Default cap for each captured stream (10 MB)
pub const DEFAULT_CAPTURE_LIMIT: usize = 10 * 1024 * 1024;

/// Which output stream of the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// How a single obfuscator run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// Process exited on its own. `exit_code` is `None` when it died from a signal.
    Completed {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// Timeout elapsed first; the process was killed
    TimedOut { after: Duration },
    /// Executable could not be started
    LaunchFailed { reason: String },
    /// A stream exceeded the capture cap; the process was killed
    CaptureExceeded { stream: Stream, limit: usize },
    /// Process started but reading its output or exit status failed; it was killed
    CollectFailed { reason: String },
}

impl InvocationOutcome {
    /// Completed with exit code zero
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Completed { exit_code: Some(0), .. })
    }
}

/// Something that can run the obfuscator with a given argument list
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn run(&self, args: Vec<OsString>, timeout: Duration) -> InvocationOutcome;
}

/// Runs a real executable, optionally with leading arguments
/// (e.g. `lua` + `src/cli.lua`)
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    executable: PathBuf,
    leading_args: Vec<OsString>,
    capture_limit: usize,
}

impl ProcessInvoker {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            leading_args: Vec::new(),
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    /// Arguments placed before the per-request ones
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capture_limit(mut self, limit: usize) -> Self {
        self.capture_limit = limit;
        self
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    pub fn leading_args(&self) -> &[OsString] {
        &self.leading_args
    }
}

enum CaptureError {
    Io(std::io::Error),
    Exceeded(Stream),
}

/// Read a whole stream, failing once it grows past `limit` bytes
async fn read_capped<R>(reader: Option<R>, stream: Stream, limit: usize) -> Result<Vec<u8>, CaptureError>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };

    let mut buf = Vec::new();
    reader
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut buf)
        .await
        .map_err(CaptureError::Io)?;

    if buf.len() > limit {
        Err(CaptureError::Exceeded(stream))
    } else {
        Ok(buf)
    }
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn run(&self, args: Vec<OsString>, timeout: Duration) -> InvocationOutcome {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to launch {}: {}", self.executable.display(), e);
                return InvocationOutcome::LaunchFailed {
                    reason: format!("{}: {}", self.executable.display(), e),
                };
            }
        };

        let pid = child.id();
        tracing::debug!("Spawned obfuscator (pid {:?})", pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.capture_limit;

        let finished = tokio::time::timeout(timeout, async {
            let (out, err) = tokio::try_join!(
                read_capped(stdout, Stream::Stdout, limit),
                read_capped(stderr, Stream::Stderr, limit),
            )?;
            let status = child.wait().await.map_err(CaptureError::Io)?;
            Ok::<_, CaptureError>((status, out, err))
        })
        .await;

        match finished {
            Ok(Ok((status, out, err))) => {
                tracing::debug!("Obfuscator (pid {:?}) exited with {}", pid, status);
                InvocationOutcome::Completed {
                    exit_code: status.code(),
                    stdout: String::from_utf8_lossy(&out).into_owned(),
                    stderr: String::from_utf8_lossy(&err).into_owned(),
                }
            }
            Ok(Err(CaptureError::Exceeded(stream))) => {
                tracing::warn!("Obfuscator (pid {:?}) exceeded {} byte {} cap", pid, limit, stream);
                kill_child(&mut child).await;
                InvocationOutcome::CaptureExceeded { stream, limit }
            }
            Ok(Err(CaptureError::Io(e))) => {
                tracing::warn!("Lost contact with obfuscator (pid {:?}): {}", pid, e);
                kill_child(&mut child).await;
                InvocationOutcome::CollectFailed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                tracing::warn!("Obfuscator (pid {:?}) timed out after {:?}", pid, timeout);
                kill_child(&mut child).await;
                InvocationOutcome::TimedOut { after: timeout }
            }
        }
    }
}

/// Kill and reap, so no zombie outlives the request
async fn kill_child(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill obfuscator: {}", e);
    }
}
