//! Attach to an existing tmux pane.
//!
//! The target is resolved once to a stable pane id (`%N`). Output is the
//! pane's visible screen captured with escapes (`capture-pane -p -e`), input
//! goes through `send-keys -H` so arbitrary bytes survive, named keys use
//! tmux's own key names, and resize maps to `resize-pane`. Killing the session only detaches: the pane belongs to tmux.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;

use super::pane::{spawn_poller, PaneControl, PaneState};
use super::{run_multiplexer, BackendStream, SessionBackend};
use crate::session::model::{BackendKind, Geometry, MultiplexerTarget, SessionError, SpecialKey};

const TMUX: &str = "tmux";

/// Bytes per `send-keys` invocation, keeping argv small.
const SEND_KEYS_CHUNK: usize = 256;

/// A tmux pane attached as a session backend.
pub struct TmuxPane {
    target: MultiplexerTarget,
    poll_interval: Duration,
    pane_id: Option<String>,
    cancel: CancellationToken,
}

impl TmuxPane {
    pub fn new(target: MultiplexerTarget, poll_interval: Duration) -> Self {
        Self {
            target,
            poll_interval,
            pane_id: None,
            cancel: CancellationToken::new(),
        }
    }

    fn pane_id(&self) -> Result<&str, SessionError> {
        self.pane_id
            .as_deref()
            .ok_or_else(|| SessionError::BackendError("tmux pane not attached".to_string()))
    }
}

/// Build the tmux target string for `session[:window[.pane]]`.
pub fn target_spec(target: &MultiplexerTarget) -> String {
    let mut spec = format!("={}", target.session);
    match (target.window, target.pane) {
        (Some(window), Some(pane)) => spec.push_str(&format!(":{}.{}", window, pane)),
        (Some(window), None) => spec.push_str(&format!(":{}", window)),
        (None, Some(pane)) => spec.push_str(&format!(":.{}", pane)),
        (None, None) => {}
    }
    spec
}

/// Parse `#{pane_dead} #{pane_dead_status}` output.
fn parse_dead_status(line: &str) -> Option<Option<i32>> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("1") => Some(parts.next().and_then(|s| s.parse().ok())),
        _ => None,
    }
}

/// Hex-encode input for `send-keys -H`, one argument per byte.
fn hex_keys(data: &[u8]) -> Vec<String> {
    data.iter().map(|b| hex::encode([*b])).collect()
}

struct TmuxCapture {
    pane_id: String,
    label: String,
}

#[async_trait]
impl PaneControl for TmuxCapture {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn capture(&self) -> Result<PaneState, SessionError> {
        let status = match run_multiplexer(
            TMUX,
            &[
                "display-message",
                "-p",
                "-t",
                &self.pane_id,
                "#{pane_dead} #{pane_dead_status}",
            ],
        )
        .await
        {
            Ok(status) => status,
            // The pane, its session or the tmux server is gone.
            Err(_) => return Ok(PaneState::Gone(None)),
        };

        if let Some(code) = parse_dead_status(status.trim()) {
            return Ok(PaneState::Gone(code));
        }

        let screen = run_multiplexer(TMUX, &["capture-pane", "-p", "-e", "-t", &self.pane_id]).await?;
        Ok(PaneState::Alive(screen))
    }
}

#[async_trait]
impl SessionBackend for TmuxPane {
    fn kind(&self) -> BackendKind {
        BackendKind::Tmux
    }

    async fn start(&mut self, _geometry: Geometry) -> Result<BackendStream, SessionError> {
        let spec = target_spec(&self.target);
        let pane_id = run_multiplexer(TMUX, &["display-message", "-p", "-t", &spec, "#{pane_id}"])
            .await
            .map_err(|e| {
                SessionError::BackendError(format!("tmux target {} not found: {}", self.target.label(), e))
            })?
            .trim()
            .to_string();

        if pane_id.is_empty() {
            return Err(SessionError::BackendError(format!(
                "tmux target {} resolved to no pane",
                self.target.label()
            )));
        }

        tracing::info!(target_label = %self.target.label(), pane_id = %pane_id, "Attached to tmux pane");

        let control = Arc::new(TmuxCapture {
            pane_id: pane_id.clone(),
            label: self.target.label(),
        });
        self.pane_id = Some(pane_id);
        Ok(spawn_poller(control, self.poll_interval, self.cancel.clone()))
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let pane_id = self.pane_id()?;
        for chunk in data.chunks(SEND_KEYS_CHUNK) {
            let keys = hex_keys(chunk);
            let mut args = vec!["send-keys", "-t", pane_id, "-H"];
            args.extend(keys.iter().map(String::as_str));
            run_multiplexer(TMUX, &args).await?;
        }
        Ok(())
    }

    async fn send_key(&self, key: SpecialKey) -> Result<(), SessionError> {
        let pane_id = self.pane_id()?;
        run_multiplexer(TMUX, &["send-keys", "-t", pane_id, key.tmux_name()]).await?;
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), SessionError> {
        let pane_id = self.pane_id()?;
        let cols = geometry.cols().to_string();
        let rows = geometry.rows().to_string();
        run_multiplexer(TMUX, &["resize-pane", "-t", pane_id, "-x", &cols, "-y", &rows]).await?;
        Ok(())
    }

    async fn kill(&self, _signal: Signal) -> Result<(), SessionError> {
        tracing::info!(target_label = %self.target.label(), "Detaching from tmux pane");
        self.cancel.cancel();
        Ok(())
    }
}
