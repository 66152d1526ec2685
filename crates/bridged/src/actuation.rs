//! Device actuation: thin argv wrappers around the termux API binaries.

use bridge_proto::CommandResult;
use chrono::Utc;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::executor::{CommandRunner, CommandSpec};

const ACTUATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest vibration accepted, in milliseconds.
pub const MAX_VIBRATE_MS: u64 = 10_000;

/// Longest recording accepted, in seconds.
pub const MAX_LISTEN_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("path {0} is outside the writable root")]
    OutsideRoot(String),

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Actuator {
    runner: Arc<dyn CommandRunner>,
    record_dir: PathBuf,
    write_root: PathBuf,
}

impl Actuator {
    pub fn new(runner: Arc<dyn CommandRunner>, record_dir: PathBuf, write_root: PathBuf) -> Self {
        Self {
            runner,
            record_dir,
            write_root: normalize(&write_root),
        }
    }

    /// Where `requested` lands, or `None` if it escapes the writable root.
    ///
    /// `~/` expands to `$HOME`; relative paths are taken from the root.
    pub fn resolve_write_path(&self, requested: &str) -> Option<PathBuf> {
        let expanded = match requested.strip_prefix("~/") {
            Some(rest) => std::env::var_os("HOME").map(PathBuf::from)?.join(rest),
            None => PathBuf::from(requested),
        };
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            self.write_root.join(expanded)
        };
        let resolved = normalize(&absolute);
        (resolved.starts_with(&self.write_root) && resolved != self.write_root).then_some(resolved)
    }

    /// Write `content` to `requested`, creating parent directories.
    /// Returns the resolved path and the number of bytes written.
    pub async fn write_file(
        &self,
        requested: &str,
        content: &str,
    ) -> Result<(PathBuf, u64), WriteError> {
        let path = self
            .resolve_write_path(requested)
            .ok_or_else(|| WriteError::OutsideRoot(requested.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content.as_bytes()).await?;
        info!(path = %path.display(), bytes = content.len(), "file written");
        Ok((path, content.len() as u64))
    }

    pub async fn toast(&self, text: &str) -> CommandResult {
        self.run(["termux-toast", text]).await
    }

    pub async fn speak(&self, text: &str) -> CommandResult {
        self.run(["termux-tts-speak", text]).await
    }

    pub async fn vibrate(&self, duration_ms: u64) -> CommandResult {
        let ms = duration_ms.clamp(1, MAX_VIBRATE_MS).to_string();
        self.run(["termux-vibrate", "-d", ms.as_str()]).await
    }

    /// Start a microphone recording. Returns the file path alongside the result.
    pub async fn listen(&self, duration_secs: u64) -> (PathBuf, CommandResult) {
        if let Err(e) = tokio::fs::create_dir_all(&self.record_dir).await {
            return (self.record_dir.clone(), CommandResult::internal(e));
        }
        let path = self
            .record_dir
            .join(format!("listen_{}.m4a", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let secs = duration_secs.clamp(1, MAX_LISTEN_SECS).to_string();
        let file = path.to_string_lossy().to_string();
        let result = self
            .run(["termux-microphone-record", "-f", file.as_str(), "-l", secs.as_str()])
            .await;
        (path, result)
    }

    async fn run<const N: usize>(&self, argv: [&str; N]) -> CommandResult {
        let spec = CommandSpec::argv(argv);
        let result = self.runner.run(&spec, ACTUATION_TIMEOUT).await;
        info!(action = argv[0], returncode = result.returncode, "actuation");
        result
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
