//! Server side of the control socket.
//!
//! One logical peer at a time: a new connection supersedes the previous
//! one, whose in-flight requests fail with `ConnectionLost`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use super::router::ControlRouter;
use super::ControlError;

pub struct ControlSocketServer {
    listener: UnixListener,
    path: PathBuf,
    router: ControlRouter,
    request_timeout: Duration,
    current: Mutex<Option<Arc<Connection>>>,
}

impl ControlSocketServer {
    /// Bind the server to `path`.
    ///
    /// Creates missing parent directories and removes a stale socket file.
    pub async fn bind(
        path: &Path,
        router: ControlRouter,
        request_timeout: Duration,
    ) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "Control socket listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            router,
            request_timeout,
            current: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn router(&self) -> &ControlRouter {
        &self.router
    }

    /// Accept peers until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _addr)) => {
                    let connection = Connection::spawn(stream, self.router.clone());
                    let previous = self.slot().replace(connection);
                    if let Some(previous) = previous {
                        tracing::info!("New control peer supersedes the previous connection");
                        previous.close();
                    } else {
                        tracing::info!("Control peer connected");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept control connection");
                }
            }
        }

        if let Some(connection) = self.slot().take() {
            connection.close();
        }
        tracing::debug!("Control socket accept loop stopped");
    }

    /// Whether a live peer is connected.
    pub fn is_connected(&self) -> bool {
        self.slot().as_ref().is_some_and(|c| !c.is_closed())
    }

    /// Send a request to the peer with the configured timeout.
    pub async fn request(&self, category: &str, action: &str, payload: Value) -> Result<Value, ControlError> {
        self.request_with_timeout(category, action, payload, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        category: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        let connection = self.connection()?;
        connection.request(category, action, payload, timeout).await
    }

    /// Send a notification to the peer.
    pub async fn notify(&self, category: &str, action: &str, payload: Value) -> Result<(), ControlError> {
        let connection = self.connection()?;
        connection.notify(category, action, payload).await
    }

    fn connection(&self) -> Result<Arc<Connection>, ControlError> {
        match self.slot().as_ref() {
            Some(c) if !c.is_closed() => Ok(Arc::clone(c)),
            _ => Err(ControlError::NotConnected),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Connection>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ControlSocketServer {
    fn drop(&mut self) {
        if let Some(connection) = self.slot().take() {
            connection.close();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "Could not remove control socket");
            }
        }
    }
}
