//! Attach to an existing zellij session.
//!
//! zellij's CLI acts on the focused pane of a session, so a target may name
//! a session and optionally a tab (1-based, as `go-to-tab` expects) but not
//! a pane. The screen is read with `dump-screen` into a scratch file, input
//! is sent with `action write` as decimal bytes, and resize is not offered
//! by the CLI at all.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pane::{spawn_poller, PaneControl, PaneState};
use super::{run_multiplexer, BackendStream, SessionBackend};
use crate::session::model::{BackendKind, Geometry, MultiplexerTarget, SessionError};

const ZELLIJ: &str = "zellij";

/// A zellij session (focused pane) attached as a session backend.
pub struct ZellijPane {
    target: MultiplexerTarget,
    poll_interval: Duration,
    attached: bool,
    cancel: CancellationToken,
}

impl ZellijPane {
    pub fn new(target: MultiplexerTarget, poll_interval: Duration) -> Self {
        Self {
            target,
            poll_interval,
            attached: false,
            cancel: CancellationToken::new(),
        }
    }

    async fn action(&self, args: &[&str]) -> Result<String, SessionError> {
        let mut full = vec!["--session", self.target.session.as_str(), "action"];
        full.extend_from_slice(args);
        run_multiplexer(ZELLIJ, &full).await
    }
}

/// Parse `zellij list-sessions --short --no-formatting`.
pub fn parse_session_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| l.split_whitespace().next().unwrap_or(l).to_string())
        .collect()
}

/// Whether a zellij session with this name is running.
pub async fn session_exists(session: &str) -> Result<bool, SessionError> {
    match run_multiplexer(ZELLIJ, &["list-sessions", "--short", "--no-formatting"]).await {
        Ok(out) => Ok(parse_session_names(&out).iter().any(|s| s == session)),
        // zellij exits non-zero when there are no sessions at all.
        Err(SessionError::BackendError(msg)) if msg.contains("No active") => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_args(data: &[u8]) -> Vec<String> {
    data.iter().map(|b| b.to_string()).collect()
}

struct ZellijCapture {
    session: String,
    label: String,
    scratch: PathBuf,
}

#[async_trait]
impl PaneControl for ZellijCapture {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn capture(&self) -> Result<PaneState, SessionError> {
        if !session_exists(&self.session).await.unwrap_or(false) {
            return Ok(PaneState::Gone(None));
        }

        let scratch = self.scratch.to_string_lossy().into_owned();
        run_multiplexer(
            ZELLIJ,
            &["--session", &self.session, "action", "dump-screen", &scratch],
        )
        .await?;

        let screen = tokio::fs::read_to_string(&self.scratch).await?;
        let _ = tokio::fs::remove_file(&self.scratch).await;
        Ok(PaneState::Alive(screen))
    }
}

#[async_trait]
impl SessionBackend for ZellijPane {
    fn kind(&self) -> BackendKind {
        BackendKind::Zellij
    }

    async fn start(&mut self, _geometry: Geometry) -> Result<BackendStream, SessionError> {
        if self.target.pane.is_some() {
            return Err(SessionError::InvalidRequest(
                "zellij targets cannot address a pane index".to_string(),
            ));
        }

        if !session_exists(&self.target.session).await? {
            return Err(SessionError::BackendError(format!(
                "zellij session {} not found",
                self.target.session
            )));
        }

        if let Some(tab) = self.target.window {
            self.action(&["go-to-tab", &tab.to_string()]).await?;
        }

        tracing::info!(target_label = %self.target.label(), "Attached to zellij session");

        let control = Arc::new(ZellijCapture {
            session: self.target.session.clone(),
            label: self.target.label(),
            scratch: std::env::temp_dir().join(format!("termhub-zellij-{}.dump", Uuid::new_v4())),
        });
        self.attached = true;
        Ok(spawn_poller(control, self.poll_interval, self.cancel.clone()))
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.attached {
            return Err(SessionError::BackendError("zellij session not attached".to_string()));
        }
        let bytes = write_args(data);
        let mut args = vec!["write"];
        args.extend(bytes.iter().map(String::as_str));
        self.action(&args).await?;
        Ok(())
    }

    async fn resize(&self, _geometry: Geometry) -> Result<(), SessionError> {
        Err(SessionError::Unsupported(
            "zellij panes cannot be resized from outside".to_string(),
        ))
    }

    async fn kill(&self, _signal: Signal) -> Result<(), SessionError> {
        tracing::info!(target_label = %self.target.label(), "Detaching from zellij session");
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::MultiplexerKind;

    #[test]
    fn test_parse_session_names() {
        let out = "main\ndev [Created 2h ago]\n\n  scratch  \n";
        assert_eq!(parse_session_names(out), vec!["main", "dev", "scratch"]);
        assert!(parse_session_names("").is_empty());
    }

    #[test]
    fn test_write_args_are_decimal() {
        assert_eq!(write_args(b"a\r"), vec!["97", "13"]);
    }

    #[tokio::test]
    async fn test_pane_index_rejected() {
        let mut pane = ZellijPane::new(
            MultiplexerTarget::new(MultiplexerKind::Zellij, "dev").with_pane(1),
            Duration::from_millis(50),
        );
        assert!(matches!(
            pane.start(Geometry::default()).await,
            Err(SessionError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_resize_is_unsupported() {
        let pane = ZellijPane::new(
            MultiplexerTarget::new(MultiplexerKind::Zellij, "dev"),
            Duration::from_millis(50),
        );
        assert!(matches!(
            pane.resize(Geometry::default()).await,
            Err(SessionError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_write_before_attach_fails() {
        let pane = ZellijPane::new(
            MultiplexerTarget::new(MultiplexerKind::Zellij, "dev"),
            Duration::from_millis(50),
        );
        assert!(pane.write(b"x").await.is_err());
    }
}
