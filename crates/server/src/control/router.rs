//! Request routing and notification listeners.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use async_trait::async_trait;
use protocol::{ControlMessage, ProtocolError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::SessionError;

/// Queue depth of one notification listener.
const LISTENER_CAPACITY: usize = 64;

/// Failure reported by a handler; sent back as the response's `error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("InvalidRequest", message)
    }
}

impl From<SessionError> for HandlerError {
    fn from(err: SessionError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        Self::invalid_request(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("Internal", err.to_string())
    }
}

/// Handles one `(category, action)` pair.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`ControlHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ControlHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        (self.0)(payload).await
    }
}

type RouteKey = (String, String);
type Listeners = HashMap<String, Vec<(u64, mpsc::Sender<ControlMessage>)>>;

#[derive(Default)]
struct RouterInner {
    handlers: RwLock<HashMap<RouteKey, Arc<dyn ControlHandler>>>,
    listeners: Mutex<Listeners>,
    next_listener: AtomicU64,
}

impl RouterInner {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove_listener(&self, category: &str, id: u64) {
        let mut listeners = self.listeners();
        if let Some(list) = listeners.get_mut(category) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                listeners.remove(category);
            }
        }
    }
}

/// Routes incoming requests to handlers and notifications to listeners.
///
/// Cheap to clone; clones share registrations.
#[derive(Clone, Default)]
pub struct ControlRouter {
    inner: Arc<RouterInner>,
}

impl ControlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `category/action`.
    pub fn register<H>(&self, category: &str, action: &str, handler: H)
    where
        H: ControlHandler + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((category.to_string(), action.to_string()), Arc::new(handler));
    }

    /// Register an async closure as the handler for `category/action`.
    pub fn register_fn<F, Fut>(&self, category: &str, action: &str, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(category, action, FnHandler(f));
    }

    pub fn has_handler(&self, category: &str, action: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(category.to_string(), action.to_string()))
    }

    /// Run the handler for `request` and build its response.
    pub async fn dispatch(&self, request: &ControlMessage) -> ControlMessage {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(request.category.clone(), request.action.clone()))
            .cloned();

        let Some(handler) = handler else {
            tracing::debug!(category = %request.category, action = %request.action, "No handler registered");
            let err = HandlerError::new(
                "NoHandler",
                format!("no handler for {}/{}", request.category, request.action),
            );
            return ControlMessage::error_response_to(request, err.to_string());
        };

        match handler.handle(request.payload.clone()).await {
            Ok(payload) => ControlMessage::response_to(request, payload),
            Err(err) => {
                tracing::debug!(
                    id = %request.id,
                    category = %request.category,
                    action = %request.action,
                    error = %err,
                    "Handler failed"
                );
                ControlMessage::error_response_to(request, err.to_string())
            }
        }
    }

    /// Listen for notifications of `category`.
    pub fn subscribe(&self, category: &str) -> NotificationSubscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
        self.inner
            .listeners()
            .entry(category.to_string())
            .or_default()
            .push((id, tx));

        NotificationSubscription {
            id,
            category: category.to_string(),
            rx,
            router: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a notification to every listener of its category.
    ///
    /// Never blocks: a full or closed listener is logged and skipped.
    pub fn notify(&self, message: &ControlMessage) {
        let listeners = self.inner.listeners();
        let Some(list) = listeners.get(&message.category) else {
            tracing::debug!(category = %message.category, action = %message.action, "Notification without listeners");
            return;
        };
        for (id, tx) in list {
            if let Err(e) = tx.try_send(message.clone()) {
                tracing::warn!(
                    listener_id = id,
                    category = %message.category,
                    action = %message.action,
                    error = %e,
                    "Dropping notification for listener"
                );
            }
        }
    }

    pub fn listener_count(&self, category: &str) -> usize {
        self.inner.listeners().get(category).map_or(0, Vec::len)
    }

    /// A handle that does not keep the router alive, for use inside handlers.
    pub fn downgrade(&self) -> WeakControlRouter {
        WeakControlRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

#[derive(Clone)]
pub struct WeakControlRouter {
    inner: Weak<RouterInner>,
}

impl WeakControlRouter {
    pub fn upgrade(&self) -> Option<ControlRouter> {
        self.inner.upgrade().map(|inner| ControlRouter { inner })
    }
}

/// A registered notification listener.
///
/// No message is delivered after [`unsubscribe`](Self::unsubscribe) or drop.
pub struct NotificationSubscription {
    id: u64,
    category: String,
    rx: mpsc::Receiver<ControlMessage>,
    router: Weak<RouterInner>,
}

impl NotificationSubscription {
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Next notification, or `None` after unsubscribe.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.rx.recv().await
    }

    /// Next notification whose payload decodes as `T`; others are skipped.
    pub async fn recv_as<T: serde::de::DeserializeOwned>(&mut self, action: &str) -> Option<T> {
        while let Some(message) = self.rx.recv().await {
            if message.action != action {
                continue;
            }
            match message.payload_as::<T>() {
                Ok(value) => return Some(value),
                Err(e) => tracing::warn!(action = %action, error = %e, "Ignoring undecodable notification"),
            }
        }
        None
    }

    /// Stop delivery. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.remove_listener(&self.category, self.id);
        }
        self.router = Weak::new();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.remove_listener(&self.category, self.id);
        }
    }
}
