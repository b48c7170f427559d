//! Session backends.
//!
//! A backend owns exactly one OS resource: a spawned process on a
//! pseudo-terminal, or an attached pane of an external multiplexer. All
//! variants sit behind [`SessionBackend`] and are picked at creation time
//! from the shape of the [`SessionSpec`](super::model::SessionSpec).

mod pane;
pub mod pty;
pub mod tmux;
pub mod zellij;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot};

use super::model::{
    BackendKind, Geometry, MultiplexerKind, MultiplexerTarget, SessionError, SpecialKey,
};

pub use pty::LocalPty;
pub use tmux::TmuxPane;
pub use zellij::ZellijPane;

/// Capacity of the raw output channel between a backend and its session task.
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Exit notification: the process exit code, or `None` when unknown.
pub type ExitReceiver = oneshot::Receiver<Option<i32>>;

/// Streams handed to the session task by [`SessionBackend::start`].
///
/// `output` yields raw bytes until it closes; `exit` then resolves exactly once.
pub struct BackendStream {
    pub output: mpsc::Receiver<Bytes>,
    pub exit: ExitReceiver,
}

/// Capability contract shared by every backend variant.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Acquire the OS resource and begin streaming output.
    ///
    /// Failures here are creation errors; no session is registered.
    async fn start(&mut self, geometry: Geometry) -> Result<BackendStream, SessionError>;

    /// Forward input bytes verbatim.
    async fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Send a named key. Defaults to writing the key's escape sequence.
    async fn send_key(&self, key: SpecialKey) -> Result<(), SessionError> {
        self.write(key.escape_sequence()).await
    }

    /// Change the terminal geometry. May return [`SessionError::Unsupported`].
    async fn resize(&self, geometry: Geometry) -> Result<(), SessionError>;

    /// Request termination. Confirmation arrives on the exit channel.
    async fn kill(&self, signal: Signal) -> Result<(), SessionError>;

    /// Process id for local sessions.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Build the backend that attaches to `target`.
pub fn for_target(target: &MultiplexerTarget, poll_interval: Duration) -> Box<dyn SessionBackend> {
    match target.kind {
        MultiplexerKind::Tmux => Box::new(TmuxPane::new(target.clone(), poll_interval)),
        MultiplexerKind::Zellij => Box::new(ZellijPane::new(target.clone(), poll_interval)),
    }
}

/// Run a multiplexer CLI command and return its stdout.
///
/// A missing binary and a non-zero exit are both backend errors; the latter
/// carries the command's stderr.
pub(crate) async fn run_multiplexer(binary: &str, args: &[&str]) -> Result<String, SessionError> {
    let output = tokio::process::Command::new(binary)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| SessionError::BackendError(format!("failed to run {}: {}", binary, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SessionError::BackendError(format!(
            "{} {} failed: {}",
            binary,
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse a signal given as a name (`TERM`, `SIGTERM`) or a number.
pub fn parse_signal(signal: &str) -> Result<Signal, SessionError> {
    let trimmed = signal.trim();
    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num)
            .map_err(|_| SessionError::InvalidRequest(format!("invalid signal number: {}", num)));
    }

    let upper = trimmed.to_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    name.parse::<Signal>()
        .map_err(|_| SessionError::InvalidRequest(format!("unknown signal: {}", signal)))
}
