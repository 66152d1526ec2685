//! Command execution.
//!
//! [`CommandRunner`] is the seam to the outside world. The production
//! [`ShellRunner`] spawns real processes; tests substitute fakes. Every other
//! module that shells out (probes, actuation, the watchdog) goes through it.

use async_trait::async_trait;
use bridge_proto::CommandResult;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::denylist::DenyList;

/// Bytes kept per output stream. The rest is read and dropped so the child
/// never blocks on a full pipe.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// How long output may keep flowing after the shell has exited, for
/// background jobs still holding the pipes. After that the group is killed.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Passed to `sh -c`.
    Shell(String),
    /// Program and arguments, no shell.
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(parts.into_iter().map(Into::into).collect())
    }

    /// Human-readable form for logs.
    pub fn display(&self) -> String {
        match self {
            Self::Shell(cmd) => cmd.clone(),
            Self::Argv(parts) => parts.join(" "),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion or until `timeout`. Never fails; errors are
    /// encoded in the returned [`CommandResult`].
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> CommandResult;
}

// ─── ShellRunner ──────────────────────────────────────────────────────────────

/// Spawns real child processes, each in its own process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl ShellRunner {
    fn command(spec: &CommandSpec) -> Option<Command> {
        let mut cmd = match spec {
            CommandSpec::Shell(line) => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(line);
                c
            }
            CommandSpec::Argv(parts) => {
                let (program, args) = parts.split_first()?;
                let mut c = Command::new(program);
                c.args(args);
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        Some(cmd)
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> CommandResult {
        let Some(mut cmd) = Self::command(spec) else {
            return CommandResult::internal("empty command");
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %spec.display(), error = %e, "spawn failed");
                return CommandResult::internal(e);
            }
        };

        // The group id equals the leader's pid and outlives the leader while
        // any member is alive. `child.id()` is gone once the child is reaped.
        let pgid = child.id();
        let deadline = Instant::now() + timeout;
        let mut stdout = OutputPipe::spawn(child.stdout.take());
        let mut stderr = OutputPipe::spawn(child.stderr.take());

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                let grace = (Instant::now() + EXIT_DRAIN_GRACE).min(deadline);
                if !drain(&mut stdout, &mut stderr, grace).await {
                    debug!(
                        command = %spec.display(),
                        "background jobs hold the output pipes, killing process group"
                    );
                    signal_group(pgid);
                    drain(&mut stdout, &mut stderr, Instant::now() + EXIT_DRAIN_GRACE).await;
                }
                let code = exit_code(status);
                CommandResult::completed(stdout.into_text(), stderr.into_text(), code)
            }
            Ok(Err(e)) => {
                warn!(command = %spec.display(), error = %e, "wait failed");
                stdout.abort();
                stderr.abort();
                CommandResult::internal(e)
            }
            Err(_) => {
                warn!(
                    command = %spec.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "command timed out, killing process group"
                );
                signal_group(pgid);
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "child already exited");
                }
                stdout.abort();
                stderr.abort();
                CommandResult::timed_out(timeout.as_secs_f64())
            }
        }
    }
}

/// One output stream, read to EOF by its own task.
struct OutputPipe {
    reader: Option<JoinHandle<String>>,
    text: Option<String>,
}

impl OutputPipe {
    fn spawn<R: AsyncRead + Unpin + Send + 'static>(reader: Option<R>) -> Self {
        Self {
            reader: reader.map(|r| tokio::spawn(read_capped(r))),
            text: None,
        }
    }

    /// Wait for EOF. Cancel-safe: the text is stored in the same poll that
    /// completes the reader.
    async fn finish(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            self.text = Some(reader.await.unwrap_or_default());
            self.reader = None;
        }
    }

    fn abort(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }

    /// Whatever was captured. A reader still running is aborted.
    fn into_text(self) -> String {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        self.text.unwrap_or_default()
    }
}

/// Finish both pipes before `until`. Returns false if either is still open.
async fn drain(stdout: &mut OutputPipe, stderr: &mut OutputPipe, until: Instant) -> bool {
    tokio::time::timeout_at(until, async {
        stdout.finish().await;
        stderr.finish().await;
    })
    .await
    .is_ok()
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(kept.len()).min(n);
                kept.extend_from_slice(&chunk[..room]);
                dropped += n - room;
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if dropped > 0 {
        text.push_str(&format!("\n[output truncated: {dropped} bytes dropped]\n"));
    }
    text
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(CommandResult::INTERNAL)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(CommandResult::INTERNAL)
}

/// SIGKILL the whole process group led by `pgid`.
#[cfg(unix)]
fn signal_group(pgid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(pgid, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>) {}

// ─── CommandExecutor ──────────────────────────────────────────────────────────

/// Deny-list check plus timeout policy in front of a [`CommandRunner`].
#[derive(Clone)]
pub struct CommandExecutor {
    runner: Arc<dyn CommandRunner>,
    deny: DenyList,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        deny: DenyList,
        default_timeout: Duration,
        max_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            deny,
            default_timeout,
            max_timeout: max_timeout.max(default_timeout),
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    /// Requested timeout clamped to the configured maximum.
    pub fn effective_timeout(&self, requested_secs: Option<f64>) -> Duration {
        match requested_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => {
                Duration::from_secs_f64(secs.min(self.max_timeout.as_secs_f64()))
            }
            _ => self.default_timeout,
        }
    }

    /// Run `command` through `sh -c`. Denied commands are never spawned.
    pub async fn exec(&self, command: &str, timeout_secs: Option<f64>) -> CommandResult {
        if let Some(pattern) = self.deny.check(command) {
            warn!(command, pattern, "command denied");
            return CommandResult::denied(pattern);
        }
        let timeout = self.effective_timeout(timeout_secs);
        debug!(command, timeout_secs = timeout.as_secs_f64(), "exec");
        self.runner
            .run(&CommandSpec::Shell(command.to_string()), timeout)
            .await
    }
}
