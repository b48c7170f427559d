//! One live control-socket connection.
//!
//! Both ends of the socket use the same machinery: a reader task decodes
//! frames and routes them, a writer task serialises outbound messages, and a
//! pending table correlates our requests with the peer's responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use protocol::{
    ControlCodec, ControlMessage, Decoded, MessageKind, ProtocolError, LENGTH_PREFIX_SIZE,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::router::ControlRouter;
use super::ControlError;

/// Outbound queue depth.
const OUTBOUND_CAPACITY: usize = 256;

const READ_CHUNK: usize = 8 * 1024;

type Pending = HashMap<String, oneshot::Sender<ControlMessage>>;

/// A correlated, bidirectional message channel over a Unix stream.
pub struct Connection {
    outbound: mpsc::Sender<ControlMessage>,
    pending: Arc<Mutex<Pending>>,
    closed: CancellationToken,
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    /// Start the reader and writer tasks for `stream`.
    pub fn spawn(stream: UnixStream, router: ControlRouter) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let connection = Arc::new(Self {
            outbound: outbound_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(write_half, outbound_rx, connection.closed.clone()));
        tokio::spawn(read_loop(read_half, Arc::clone(&connection), router));

        connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close the connection. In-flight requests fail with `ConnectionLost`.
    pub fn close(&self) {
        self.closed.cancel();
        self.fail_pending();
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send a request and wait for the peer's response.
    ///
    /// Exactly one of: the response payload, the remote error, `Timeout` or
    /// `ConnectionLost`. A response arriving after the timeout is discarded.
    pub async fn request(
        &self,
        category: &str,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        if self.is_closed() {
            return Err(ControlError::ConnectionLost);
        }

        let message = ControlMessage::request(category, action, payload);
        let id = message.id.clone();
        let rx = self.register_pending(&id)?;

        if self.outbound.send(message).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(ControlError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(ControlError::Remote(error)),
                None => Ok(response.payload),
            },
            Ok(Err(_)) => Err(ControlError::ConnectionLost),
            Err(_) => {
                lock(&self.pending).remove(&id);
                tracing::debug!(id = %id, category, action, "Control request timed out");
                Err(ControlError::Timeout(timeout))
            }
        }
    }

    /// Add a pending slot for `id`. `close()` may drain the table between
    /// the caller's closed check and this insert, so check again after it.
    fn register_pending(
        &self,
        id: &str,
    ) -> Result<oneshot::Receiver<ControlMessage>, ControlError> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.to_string(), tx);
        if self.is_closed() {
            lock(&self.pending).remove(id);
            return Err(ControlError::ConnectionLost);
        }
        Ok(rx)
    }

    /// Send a notification; no reply is expected.
    pub async fn notify(&self, category: &str, action: &str, payload: Value) -> Result<(), ControlError> {
        self.send(ControlMessage::notification(category, action, payload))
            .await
    }

    async fn send(&self, message: ControlMessage) -> Result<(), ControlError> {
        if self.is_closed() {
            return Err(ControlError::ConnectionLost);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ControlError::ConnectionLost)
    }

    fn complete(&self, response: ControlMessage) {
        let waiter = lock(&self.pending).remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!(id = %response.id, "Dropping response with no pending request"),
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Failing in-flight control requests");
        }
        // Dropping the senders wakes each waiter with ConnectionLost.
    }

    fn handle_incoming(self: &Arc<Self>, decoded: Decoded, router: &ControlRouter) {
        match decoded {
            Decoded::Message(message) => match message.kind {
                MessageKind::Request => {
                    let connection = Arc::clone(self);
                    let router = router.clone();
                    tokio::spawn(async move {
                        let response = router.dispatch(&message).await;
                        if let Err(e) = connection.send(response).await {
                            tracing::debug!(id = %message.id, error = %e, "Could not deliver response");
                        }
                    });
                }
                MessageKind::Response => self.complete(message),
                MessageKind::Notification => router.notify(&message),
            },
            Decoded::Malformed { id: Some(id), reason } => {
                tracing::warn!(id = %id, reason = %reason, "Rejecting malformed control message");
                let response =
                    ControlMessage::error_response(id, "", "", format!("InvalidRequest: malformed message: {}", reason));
                if self.outbound.try_send(response).is_err() {
                    tracing::warn!("Outbound queue full, dropping malformed-message response");
                }
            }
            Decoded::Malformed { id: None, reason } => {
                tracing::warn!(reason = %reason, "Dropping undecodable control message");
            }
        }
    }
}

async fn write_loop(
    mut writer: tokio::io::WriteHalf<UnixStream>,
    mut outbound: mpsc::Receiver<ControlMessage>,
    closed: CancellationToken,
) {
    let codec = ControlCodec::new();
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let bytes = match codec.encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(id = %message.id, error = %e, "Failed to encode control message");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            tracing::debug!(error = %e, "Control socket write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "Control socket flush failed");
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: tokio::io::ReadHalf<UnixStream>,
    connection: Arc<Connection>,
    router: ControlRouter,
) {
    let codec = ControlCodec::new();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    // Bytes of an oversized frame still to be discarded.
    let mut skip = 0usize;

    'outer: loop {
        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            _ = connection.closed.cancelled() => break,
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!("Control peer disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Control socket read failed");
                break;
            }
        }

        loop {
            discard(&mut buf, &mut skip);
            if skip > 0 {
                break;
            }
            match codec.try_decode(&buf) {
                Ok(Some((decoded, consumed))) => {
                    let _ = buf.split_to(consumed);
                    connection.handle_incoming(decoded, &router);
                }
                Ok(None) => break,
                Err(ProtocolError::FrameTooLarge { size, max }) => {
                    tracing::warn!(size, max, "Dropping oversized control message");
                    skip = LENGTH_PREFIX_SIZE + size;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Unrecoverable control framing error, closing connection");
                    break 'outer;
                }
            }
        }
    }

    connection.close();
}

/// Drop up to `skip` bytes from the front of `buf`.
fn discard(buf: &mut BytesMut, skip: &mut usize) {
    let n = (*skip).min(buf.len());
    if n > 0 {
        let _ = buf.split_to(n);
        *skip -= n;
    }
}
