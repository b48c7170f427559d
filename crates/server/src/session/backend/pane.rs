//! Polling driver shared by the multiplexer pane backends.
//!
//! Multiplexers expose pane contents as screen dumps rather than a byte
//! stream, so each poll captures the visible screen and, when it changed,
//! emits a home+clear sequence followed by the new contents. A target that
//! disappears ends the stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{BackendStream, OUTPUT_CHANNEL_CAPACITY};
use crate::session::model::SessionError;

/// Cursor home plus clear screen, prepended to every redraw.
const REDRAW_PREFIX: &[u8] = b"\x1b[H\x1b[2J";

/// Consecutive capture failures tolerated before the target counts as gone.
const MAX_CAPTURE_FAILURES: u32 = 3;

/// Result of one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum PaneState {
    /// Target exists; visible screen contents.
    Alive(String),
    /// Target no longer exists, with an exit code if the multiplexer kept one.
    Gone(Option<i32>),
}

#[async_trait]
pub(super) trait PaneControl: Send + Sync + 'static {
    /// Label for logs.
    fn label(&self) -> String;

    async fn capture(&self) -> Result<PaneState, SessionError>;
}

/// Convert a screen dump to the bytes a viewer should receive.
pub(super) fn redraw(screen: &str) -> Bytes {
    let body = screen.trim_end_matches('\n').replace('\n', "\r\n");
    let mut out = Vec::with_capacity(REDRAW_PREFIX.len() + body.len());
    out.extend_from_slice(REDRAW_PREFIX);
    out.extend_from_slice(body.as_bytes());
    Bytes::from(out)
}

/// Start polling `control` every `interval` until the target is gone or
/// `cancel` fires. Cancellation reports an unknown exit code.
pub(super) fn spawn_poller(
    control: Arc<dyn PaneControl>,
    interval: Duration,
    cancel: CancellationToken,
) -> BackendStream {
    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    tokio::spawn(async move {
        let label = control.label();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_screen: Option<String> = None;
        let mut failures = 0u32;

        let code = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(pane = %label, "Pane poller cancelled");
                    break None;
                }
                _ = ticker.tick() => {}
            }

            match control.capture().await {
                Ok(PaneState::Alive(screen)) => {
                    failures = 0;
                    if last_screen.as_deref() == Some(screen.as_str()) {
                        continue;
                    }
                    if output_tx.send(redraw(&screen)).await.is_err() {
                        break None;
                    }
                    last_screen = Some(screen);
                }
                Ok(PaneState::Gone(code)) => {
                    tracing::info!(pane = %label, code = ?code, "Multiplexer target is gone");
                    break code;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(pane = %label, error = %e, failures, "Pane capture failed");
                    if failures >= MAX_CAPTURE_FAILURES {
                        break None;
                    }
                }
            }
        };

        drop(output_tx);
        let _ = exit_tx.send(code);
    });

    BackendStream {
        output: output_rx,
        exit: exit_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        states: Mutex<VecDeque<Result<PaneState, SessionError>>>,
    }

    #[async_trait]
    impl PaneControl for Scripted {
        fn label(&self) -> String {
            "scripted".to_string()
        }

        async fn capture(&self) -> Result<PaneState, SessionError> {
            self.states
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PaneState::Alive("idle".to_string())))
        }
    }

    fn scripted(states: Vec<Result<PaneState, SessionError>>) -> Arc<dyn PaneControl> {
        Arc::new(Scripted {
            states: Mutex::new(states.into()),
        })
    }

    async fn collect(stream: BackendStream) -> (Vec<Bytes>, Option<i32>) {
        let BackendStream { mut output, exit } = stream;
        let mut chunks = Vec::new();
        while let Some(chunk) = output.recv().await {
            chunks.push(chunk);
        }
        (chunks, exit.await.unwrap())
    }

    #[test]
    fn test_redraw_translates_newlines() {
        let out = redraw("a\nb\n");
        assert_eq!(out.as_ref(), b"\x1b[H\x1b[2Ja\r\nb");
    }

    #[tokio::test]
    async fn test_unchanged_screen_is_not_resent() {
        let control = scripted(vec![
            Ok(PaneState::Alive("one".to_string())),
            Ok(PaneState::Alive("one".to_string())),
            Ok(PaneState::Alive("two".to_string())),
            Ok(PaneState::Gone(Some(2))),
        ]);
        let stream = spawn_poller(control, Duration::from_millis(1), CancellationToken::new());

        let (chunks, code) = collect(stream).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].ends_with(b"two"));
        assert_eq!(code, Some(2));
    }

    #[tokio::test]
    async fn test_repeated_failures_end_stream_with_unknown_code() {
        let control = scripted(vec![
            Err(SessionError::BackendError("x".into())),
            Err(SessionError::BackendError("x".into())),
            Err(SessionError::BackendError("x".into())),
        ]);
        let stream = spawn_poller(control, Duration::from_millis(1), CancellationToken::new());

        let (chunks, code) = collect(stream).await;
        assert!(chunks.is_empty());
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let cancel = CancellationToken::new();
        let stream = spawn_poller(scripted(vec![]), Duration::from_millis(5), cancel.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let (chunks, code) = collect(stream).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(code, None);
    }
}
