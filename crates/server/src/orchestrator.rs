//! Server orchestrator for wiring together all components.
//!
//! Every component is constructed here once and handed to the others
//! explicitly: the auth gate, the session registry with its crash-resume
//! store, multiplexer discovery, the control router with its built-in
//! handlers, and the control socket server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::messages::{
    action, category, KillRequest, PruneRequest, RenameRequest, RepositoryPathUpdate, SessionRef,
};
use protocol::ControlMessage;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, Credential};
use crate::config::Config;
use crate::control::{get_socket_path, ControlError, ControlRouter, ControlSocketServer, HandlerError};
use crate::session::{
    parse_signal, MultiplexerDiscovery, RegistryConfig, RegistryEvent, SessionRegistry,
    SessionStore,
};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    /// Sessions re-attached from the crash-resume store.
    SessionsRestored { count: usize },
    /// The host supervisor changed the repository base path.
    RepositoryPathChanged { path: String },
    Error { message: String },
}

/// Repository base path pushed by the host supervisor.
///
/// The path is stored exactly as sent; `~` is not expanded.
#[derive(Debug, Clone, Default)]
pub struct RepositoryPath(Arc<std::sync::RwLock<Option<String>>>);

impl RepositoryPath {
    pub fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, path: impl Into<String>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(path.into());
    }
}

/// Orchestrator that owns every server subsystem.
pub struct ServerOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    discovery: Arc<MultiplexerDiscovery>,
    router: ControlRouter,
    repository_path: RepositoryPath,
    control: Option<Arc<ControlSocketServer>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl ServerOrchestrator {
    /// Creates a new orchestrator. Nothing runs until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.server.data_dir.display()
            )
        })?;

        let auth = AuthGate::from_config(&config.auth);
        if auth.is_enabled() {
            info!(tokens = config.auth.tokens.len(), "Token authorization enabled");
        }

        let store = SessionStore::new(&config.server.data_dir);
        let registry = Arc::new(
            SessionRegistry::new(RegistryConfig::from_config(&config), auth).with_store(store),
        );
        let discovery = Arc::new(MultiplexerDiscovery::new(config.multiplexer.priority.clone()));

        let (event_tx, _) = broadcast::channel(64);
        let repository_path = RepositoryPath::default();
        let router = ControlRouter::new();
        register_builtin_handlers(
            &router,
            &registry,
            &discovery,
            &repository_path,
            event_tx.clone(),
        );

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            discovery,
            router,
            repository_path,
            control: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Control socket path in effect for this configuration.
    pub fn socket_path(&self) -> PathBuf {
        self.config
            .server
            .control_socket
            .clone()
            .unwrap_or_else(get_socket_path)
    }

    /// Restores persisted sessions, starts background tasks and binds the
    /// control socket.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting termhub server...");

        let restored = self.registry.restore().await;
        if !restored.is_empty() {
            info!(count = restored.len(), "Restored attached sessions");
            self.emit_event(OrchestratorEvent::SessionsRestored {
                count: restored.len(),
            });
        }

        let cleanup = self.registry.start_cleanup_task(
            self.config.session.cleanup_interval(),
            self.config.session.exit_retention(),
            self.shutdown_token.clone(),
        );
        debug!("Started session cleanup task");

        let socket_path = self.socket_path();
        let control = match ControlSocketServer::bind(
            &socket_path,
            self.router.clone(),
            self.config.control.request_timeout(),
        )
        .await
        {
            Ok(server) => Arc::new(server),
            Err(e) => {
                cleanup.abort();
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                return Err(e).with_context(|| {
                    format!("Failed to bind control socket: {}", socket_path.display())
                });
            }
        };

        let accept = {
            let control = Arc::clone(&control);
            let token = self.shutdown_token.clone();
            tokio::spawn(async move { control.run(token).await })
        };

        let forwarder = tokio::spawn(forward_exit_notifications(
            self.registry.events(),
            Arc::clone(&control),
            self.shutdown_token.clone(),
        ));

        self.control = Some(control);
        self.tasks.extend([cleanup, accept, forwarder]);

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(socket = %socket_path.display(), "termhub server started");
        Ok(())
    }

    /// Stops the orchestrator gracefully.
    ///
    /// Local sessions are terminated; attach records are kept so the next
    /// start can restore them.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping termhub server...");

        self.shutdown_token.cancel();
        self.registry.shutdown().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        // Last reference; dropping it removes the socket file.
        self.control = None;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("termhub server stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<MultiplexerDiscovery> {
        &self.discovery
    }

    pub fn router(&self) -> &ControlRouter {
        &self.router
    }

    pub fn control(&self) -> Option<&Arc<ControlSocketServer>> {
        self.control.as_ref()
    }

    pub fn repository_path(&self) -> Option<String> {
        self.repository_path.get()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload).map_err(|e| HandlerError::invalid_request(e.to_string()))
}

/// Register the `system/*` and `session/*` handlers on `router`.
pub fn register_builtin_handlers(
    router: &ControlRouter,
    registry: &Arc<SessionRegistry>,
    discovery: &Arc<MultiplexerDiscovery>,
    repository_path: &RepositoryPath,
    events: broadcast::Sender<OrchestratorEvent>,
) {
    router.register_fn(category::SYSTEM, action::PING, |_| async {
        Ok(json!({ "pong": true }))
    });

    {
        let repository_path = repository_path.clone();
        let weak_router = router.downgrade();
        router.register_fn(category::SYSTEM, action::REPOSITORY_PATH_UPDATE, move |payload| {
            let repository_path = repository_path.clone();
            let weak_router = weak_router.clone();
            let events = events.clone();
            async move {
                let update: RepositoryPathUpdate = parse(payload)?;
                info!(path = %update.path, "Repository path updated");
                repository_path.set(update.path.clone());
                let _ = events.send(OrchestratorEvent::RepositoryPathChanged {
                    path: update.path.clone(),
                });
                if let Some(router) = weak_router.upgrade() {
                    router.notify(&ControlMessage::notification(
                        category::SYSTEM,
                        action::REPOSITORY_PATH_UPDATE,
                        json!({ "path": update.path }),
                    ));
                }
                Ok(json!({ "success": true, "path": update.path }))
            }
        });
    }

    let reg = Arc::clone(registry);
    router.register_fn(category::SESSION, action::LIST, move |_| {
        let reg = Arc::clone(&reg);
        async move { Ok(json!({ "sessions": reg.list() })) }
    });

    let reg = Arc::clone(registry);
    router.register_fn(category::SESSION, action::GET, move |payload| {
        let reg = Arc::clone(&reg);
        async move {
            let req: SessionRef = parse(payload)?;
            Ok(serde_json::to_value(reg.get(&req.id)?)?)
        }
    });

    let reg = Arc::clone(registry);
    router.register_fn(category::SESSION, action::KILL, move |payload| {
        let reg = Arc::clone(&reg);
        async move {
            let req: KillRequest = parse(payload)?;
            let signal = req.signal.as_deref().map(parse_signal).transpose()?;
            reg.kill(&req.id, signal, &Credential::LocalPeer).await?;
            Ok(serde_json::to_value(reg.get(&req.id)?)?)
        }
    });

    let reg = Arc::clone(registry);
    router.register_fn(category::SESSION, action::RENAME, move |payload| {
        let reg = Arc::clone(&reg);
        async move {
            let req: RenameRequest = parse(payload)?;
            reg.rename(&req.id, &req.name, &Credential::LocalPeer).await?;
            Ok(serde_json::to_value(reg.get(&req.id)?)?)
        }
    });

    let reg = Arc::clone(registry);
    router.register_fn(category::SESSION, action::PRUNE, move |payload| {
        let reg = Arc::clone(&reg);
        async move {
            let req: PruneRequest = parse(payload)?;
            let removed = reg.prune(
                Duration::from_secs(req.older_than_secs),
                &Credential::LocalPeer,
            )?;
            Ok(json!({ "removed": removed }))
        }
    });

    let disc = Arc::clone(discovery);
    router.register_fn(category::SESSION, action::DISCOVER, move |_| {
        let disc = Arc::clone(&disc);
        async move {
            Ok(json!({
                "available": disc.available(),
                "preferred": disc.preferred().await,
                "sessions": disc.discover().await,
            }))
        }
    });
}

/// Tell the connected peer about every session exit.
async fn forward_exit_notifications(
    mut events: broadcast::Receiver<RegistryEvent>,
    control: Arc<ControlSocketServer>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(RegistryEvent::Exited { id, exit_code }) => {
                let payload = json!({ "id": id, "exitCode": exit_code });
                match control
                    .notify(category::NOTIFICATION, action::SESSION_EXITED, payload)
                    .await
                {
                    Ok(()) => {}
                    Err(ControlError::NotConnected) => {
                        debug!(session_id = %id, "No control peer for exit notification");
                    }
                    Err(e) => warn!(session_id = %id, error = %e, "Failed to send exit notification"),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Exit notification forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlClient;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.data_dir = temp_dir.path().join("data");
        config.server.control_socket = Some(temp_dir.path().join("control.sock"));
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let orchestrator = ServerOrchestrator::new(config).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(temp_dir.path().join("data").is_dir());
        assert!(orchestrator.router().has_handler(category::SYSTEM, action::PING));
        assert!(orchestrator.router().has_handler(category::SESSION, action::DISCOVER));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let socket = temp_dir.path().join("control.sock");

        let mut orchestrator = ServerOrchestrator::new(config).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(socket.exists());
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!socket.exists());
        orchestrator.stop().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                OrchestratorEvent::StateChanged(OrchestratorState::Starting),
                OrchestratorEvent::StateChanged(OrchestratorState::Running),
                OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown),
                OrchestratorEvent::StateChanged(OrchestratorState::Stopped),
            ]
        );
    }

    #[tokio::test]
    async fn test_builtin_handlers_over_socket() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let socket = temp_dir.path().join("control.sock");

        let mut orchestrator = ServerOrchestrator::new(config).unwrap();
        orchestrator.start().await.unwrap();
        let mut local = orchestrator.router().subscribe(category::SYSTEM);

        let client = ControlClient::connect(&socket, ControlRouter::new()).await.unwrap();

        let pong = client.request(category::SYSTEM, action::PING, Value::Null).await.unwrap();
        assert_eq!(pong, json!({ "pong": true }));

        let resp = client
            .request(
                category::SYSTEM,
                action::REPOSITORY_PATH_UPDATE,
                json!({ "path": "~/Projects" }),
            )
            .await
            .unwrap();
        assert_eq!(resp, json!({ "success": true, "path": "~/Projects" }));
        assert_eq!(orchestrator.repository_path().as_deref(), Some("~/Projects"));

        let update: RepositoryPathUpdate = tokio::time::timeout(
            Duration::from_secs(5),
            local.recv_as(action::REPOSITORY_PATH_UPDATE),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(update.path, "~/Projects");

        let list = client.request(category::SESSION, action::LIST, Value::Null).await.unwrap();
        assert_eq!(list, json!({ "sessions": [] }));

        let err = client
            .request(category::SESSION, action::GET, json!({ "id": "missing" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Remote(ref msg) if msg.starts_with("NotFound")));

        let err = client
            .request(category::SESSION, action::GET, json!({ "nope": 1 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Remote(ref msg) if msg.starts_with("InvalidRequest")));

        drop(client);
        orchestrator.stop().await.unwrap();
    }

    #[test]
    fn test_repository_path_is_stored_verbatim() {
        let path = RepositoryPath::default();
        assert_eq!(path.get(), None);
        path.set("~/src");
        assert_eq!(path.get().as_deref(), Some("~/src"));
    }
}
