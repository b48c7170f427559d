//! Peer side of the control socket, used by the host supervisor and the CLI.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::UnixStream;

use super::connection::Connection;
use super::router::{ControlRouter, NotificationSubscription};
use super::{ControlError, DEFAULT_REQUEST_TIMEOUT};

/// Default time allowed for connecting to the socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlClient {
    connection: Arc<Connection>,
    router: ControlRouter,
    request_timeout: Duration,
}

impl ControlClient {
    /// Connect to the server at `path`. Requests the server sends are routed
    /// through `router`.
    pub async fn connect(path: &Path, router: ControlRouter) -> Result<Self, ControlError> {
        Self::connect_with_timeout(path, router, CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        path: &Path,
        router: ControlRouter,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ControlError::Timeout(timeout))??;
        tracing::debug!(path = %path.display(), "Connected to control socket");

        Ok(Self {
            connection: Connection::spawn(stream, router.clone()),
            router,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Override the default per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn request(&self, category: &str, action: &str, payload: Value) -> Result<Value, ControlError> {
        self.connection
            .request(category, action, payload, self.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        category: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        self.connection.request(category, action, payload, timeout).await
    }

    pub async fn notify(&self, category: &str, action: &str, payload: Value) -> Result<(), ControlError> {
        self.connection.notify(category, action, payload).await
    }

    /// Listen for notifications of `category` sent by the server.
    pub fn subscribe(&self, category: &str) -> NotificationSubscription {
        self.router.subscribe(category)
    }

    pub fn router(&self) -> &ControlRouter {
        &self.router
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Resolves once the server side has gone away.
    pub async fn closed(&self) {
        self.connection.closed().await
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}
