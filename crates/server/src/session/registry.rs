//! The session registry.
//!
//! The registry owns the id-keyed map of sessions. Every session has exactly
//! one task that owns its backend and is the only writer of its status,
//! geometry and activity; the registry talks to that task over a command
//! channel and reads its state through a `watch` channel. Callers never wait
//! on subscriber activity, only on the backend call their request triggers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use nix::sys::signal::Signal;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use protocol::UNKNOWN_EXIT_CODE;

use super::activity::ActivityTracker;
use super::backend::{self, BackendStream, LocalPty, SessionBackend};
use super::hub::{BufferBroadcastHub, HubConfig, Snapshot, Subscriber};
use super::model::{
    derive_name, now_millis, ActivityStatus, BackendKind, Geometry, LocalSpec, MultiplexerTarget,
    SessionError, SessionId, SessionInfo, SessionInput, SessionSpec, SessionStatus,
};
use super::store::{SessionStore, StoredSession};
use crate::auth::{AuthGate, Credential, Scope};
use crate::config::Config;

/// Capacity of the registry event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of each session task's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Environment variable carrying the session id into local sessions.
pub const SESSION_ID_ENV: &str = "TERMHUB_SESSION_ID";

/// Registry tuning, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_shell: String,
    pub default_geometry: Geometry,
    pub max_sessions: usize,
    /// Grace period after the kill signal before escalating to SIGKILL.
    pub kill_timeout: Duration,
    /// Screen polling interval for multiplexer panes.
    pub poll_interval: Duration,
    pub hub: HubConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_shell: config.session.default_shell.clone(),
            default_geometry: config.session.default_geometry(),
            max_sessions: config.session.max_sessions,
            kill_timeout: config.session.kill_timeout(),
            poll_interval: config.multiplexer.poll_interval(),
            hub: config.hub.hub_config(),
        }
    }
}

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Created(SessionInfo),
    StatusChanged { id: SessionId, status: SessionStatus },
    Renamed { id: SessionId, name: String },
    Exited { id: SessionId, exit_code: i32 },
    Removed { id: SessionId },
}

/// How a resize request was honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// The backend resized the terminal.
    Applied,
    /// Only the recorded geometry changed (backend cannot resize, or the
    /// session has exited).
    Recorded,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SessionCommand {
    Input { input: SessionInput, reply: Reply<()> },
    Resize { geometry: Geometry, reply: Reply<ResizeOutcome> },
    Kill { signal: Signal, reply: Reply<()> },
    Rename { name: String, reply: Reply<()> },
    /// Terminate for server shutdown; attach records are kept for resume.
    Shutdown { reply: Reply<()> },
}

/// Counts one live session toward `max_sessions` until dropped.
struct SessionSlot(Arc<AtomicUsize>);

impl SessionSlot {
    /// Take a slot unless `max` sessions are already live.
    fn try_acquire(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(live)))
    }

    /// Take a slot regardless of the limit.
    fn acquire(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(live))
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
struct SessionHandle {
    created_seq: u64,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionInfo>,
    hub: Arc<BufferBroadcastHub>,
}

/// Authoritative map of sessions.
pub struct SessionRegistry {
    config: RegistryConfig,
    auth: AuthGate,
    sessions: DashMap<SessionId, SessionHandle>,
    /// Sessions that have not exited yet.
    live: Arc<AtomicUsize>,
    next_seq: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
    store: Option<SessionStore>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, auth: AuthGate) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            auth,
            sessions: DashMap::new(),
            live: Arc::new(AtomicUsize::new(0)),
            next_seq: AtomicU64::new(0),
            events,
            store: None,
        }
    }

    /// Persist attach-mode sessions to `store` so they can be restored.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Create a session and return its snapshot (status `starting`).
    pub async fn create(
        &self,
        spec: SessionSpec,
        credential: &Credential,
    ) -> Result<SessionInfo, SessionError> {
        let (info, _subscriber) = self.create_with_subscriber(spec, credential).await?;
        Ok(info)
    }

    /// Create a session with a subscriber that is attached before the
    /// backend's first output can be published.
    pub async fn create_with_subscriber(
        &self,
        spec: SessionSpec,
        credential: &Credential,
    ) -> Result<(SessionInfo, Subscriber), SessionError> {
        self.auth.authorize(credential, Scope::Control)?;

        // Released on every error path below, or when the session exits.
        let slot = SessionSlot::try_acquire(&self.live, self.config.max_sessions).ok_or_else(|| {
            SessionError::InvalidRequest(format!(
                "session limit reached ({})",
                self.config.max_sessions
            ))
        })?;

        match spec {
            SessionSpec::Local(local) => self.create_local(local, slot).await,
            SessionSpec::Attach { target, name } => {
                let id = Uuid::new_v4().to_string();
                self.attach(id, target, name, now_millis(), slot).await
            }
        }
    }

    async fn create_local(
        &self,
        spec: LocalSpec,
        slot: SessionSlot,
    ) -> Result<(SessionInfo, Subscriber), SessionError> {
        let working_dir = resolve_working_dir(&spec.working_dir).await?;

        let command = if spec.command.is_empty() {
            vec![self.config.default_shell.clone()]
        } else {
            spec.command
        };
        let id = Uuid::new_v4().to_string();
        let name = spec
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| derive_name(&command));

        let mut env = spec.env;
        env.push((SESSION_ID_ENV.to_string(), id.clone()));
        let mut backend: Box<dyn SessionBackend> =
            Box::new(LocalPty::new(command.clone(), working_dir.clone(), env));
        let stream = start_backend(backend.as_mut(), spec.geometry).await?;

        let now = now_millis();
        let info = SessionInfo {
            id,
            name,
            command,
            working_dir,
            status: SessionStatus::Starting,
            exit_code: None,
            created_at: now,
            last_activity: now,
            exited_at: None,
            geometry: spec.geometry,
            activity: None,
            backend: BackendKind::Pty,
            pid: backend.pid(),
        };
        self.launch(info, backend, stream, None, slot)
    }

    async fn attach(
        &self,
        id: SessionId,
        target: MultiplexerTarget,
        name: Option<String>,
        created_at: u64,
        slot: SessionSlot,
    ) -> Result<(SessionInfo, Subscriber), SessionError> {
        let geometry = self.config.default_geometry;
        let mut backend = backend::for_target(&target, self.config.poll_interval);
        let stream = start_backend(backend.as_mut(), geometry).await?;

        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| target.label());
        let info = SessionInfo {
            id: id.clone(),
            name: name.clone(),
            command: vec![target.kind.binary().to_string(), target.label()],
            working_dir: PathBuf::new(),
            status: SessionStatus::Starting,
            exit_code: None,
            created_at,
            last_activity: now_millis(),
            exited_at: None,
            geometry,
            activity: None,
            backend: target.kind.backend_kind(),
            pid: None,
        };
        let record = StoredSession {
            id,
            name,
            target,
            created_at,
        };
        self.launch(info, backend, stream, Some(record), slot)
    }

    fn launch(
        &self,
        info: SessionInfo,
        backend: Box<dyn SessionBackend>,
        stream: BackendStream,
        record: Option<StoredSession>,
        slot: SessionSlot,
    ) -> Result<(SessionInfo, Subscriber), SessionError> {
        let id = info.id.clone();
        let hub = BufferBroadcastHub::new(id.clone(), info.geometry, self.config.hub);
        let subscriber = hub.subscribe(Scope::Control)?;

        let store = match (&record, &self.store) {
            (Some(record), Some(store)) => {
                if let Err(e) = store.save(record) {
                    tracing::warn!(session_id = %id, error = %e, "Failed to persist session record");
                }
                Some(store.clone())
            }
            _ => None,
        };

        let (state_tx, state_rx) = watch::channel(info.clone());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let task = SessionTask {
            id: id.clone(),
            backend,
            hub: Arc::clone(&hub),
            state: state_tx,
            events: self.events.clone(),
            store,
            tracker: ActivityTracker::new(),
            kill_timeout: self.config.kill_timeout,
            kill: None,
            slot: Some(slot),
        };

        self.sessions.insert(
            id.clone(),
            SessionHandle {
                created_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                commands: command_tx,
                state: state_rx,
                hub,
            },
        );

        tracing::info!(
            session_id = %id,
            name = %info.name,
            backend = %info.backend,
            pid = ?info.pid,
            geometry = %info.geometry,
            "Created session"
        );
        let _ = self.events.send(RegistryEvent::Created(info.clone()));
        tokio::spawn(task.run(command_rx, stream));

        Ok((info, subscriber))
    }

    fn handle(&self, id: &str) -> Result<SessionHandle, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn request<T>(
        &self,
        handle: &SessionHandle,
        id: &str,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        handle
            .commands
            .send(make(tx))
            .await
            .map_err(|_| task_gone(id))?;
        rx.await.map_err(|_| task_gone(id))?
    }

    /// Current snapshot of one session.
    pub fn get(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let handle = self.handle(id)?;
        let info = handle.state.borrow().clone();
        Ok(info.refresh_activity(now_millis()))
    }

    /// All sessions, in creation order.
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = now_millis();
        let mut entries: Vec<(u64, SessionInfo)> = self
            .sessions
            .iter()
            .map(|e| (e.created_seq, e.state.borrow().clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries
            .into_iter()
            .map(|(_, info)| info.refresh_activity(now))
            .collect()
    }

    /// Number of sessions in the map, exited ones included.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Continuous view of one session's state.
    pub fn watch(&self, id: &str) -> Result<watch::Receiver<SessionInfo>, SessionError> {
        Ok(self.handle(id)?.state)
    }

    /// Forward input to the backend: raw bytes verbatim, or a named key.
    pub async fn send_input(
        &self,
        id: &str,
        input: impl Into<SessionInput>,
        credential: &Credential,
    ) -> Result<(), SessionError> {
        self.auth.authorize(credential, Scope::Control)?;
        let handle = self.handle(id)?;
        if handle.state.borrow().is_exited() {
            return Err(SessionError::SessionExited(id.to_string()));
        }
        let input = input.into();
        self.request(&handle, id, |reply| SessionCommand::Input { input, reply })
            .await
    }

    /// Change the terminal geometry.
    pub async fn resize(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        credential: &Credential,
    ) -> Result<ResizeOutcome, SessionError> {
        self.auth.authorize(credential, Scope::Control)?;
        let geometry = Geometry::new(cols, rows)?;
        let handle = self.handle(id)?;
        self.request(&handle, id, |reply| SessionCommand::Resize { geometry, reply })
            .await
    }

    /// Terminate a session and wait until it has exited.
    ///
    /// Defaults to SIGTERM. Killing an exited session succeeds without effect.
    /// Attach-mode sessions are detached; the multiplexer pane keeps running.
    pub async fn kill(
        &self,
        id: &str,
        signal: Option<Signal>,
        credential: &Credential,
    ) -> Result<(), SessionError> {
        self.auth.authorize(credential, Scope::Control)?;
        let handle = self.handle(id)?;
        if handle.state.borrow().is_exited() {
            return Ok(());
        }
        let signal = signal.unwrap_or(Signal::SIGTERM);
        self.request(&handle, id, |reply| SessionCommand::Kill { signal, reply })
            .await
    }

    pub async fn rename(
        &self,
        id: &str,
        name: &str,
        credential: &Credential,
    ) -> Result<(), SessionError> {
        self.auth.authorize(credential, Scope::Control)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidRequest("name must not be empty".to_string()));
        }
        let handle = self.handle(id)?;
        let name = name.to_string();
        self.request(&handle, id, |reply| SessionCommand::Rename { name, reply })
            .await
    }

    /// Remove exited sessions that exited at least `older_than` ago.
    pub fn prune(
        &self,
        older_than: Duration,
        credential: &Credential,
    ) -> Result<Vec<SessionId>, SessionError> {
        self.auth.authorize(credential, Scope::Control)?;
        Ok(self.remove_exited(older_than))
    }

    fn remove_exited(&self, older_than: Duration) -> Vec<SessionId> {
        let now = now_millis();
        let threshold = older_than.as_millis() as u64;
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| {
                let info = e.state.borrow();
                info.is_exited()
                    && info
                        .exited_at
                        .is_some_and(|at| now.saturating_sub(at) >= threshold)
            })
            .map(|e| e.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if self
                .sessions
                .remove_if(&id, |_, h| h.state.borrow().is_exited())
                .is_some()
            {
                tracing::info!(session_id = %id, "Pruned exited session");
                let _ = self.events.send(RegistryEvent::Removed { id: id.clone() });
                removed.push(id);
            }
        }
        removed
    }

    /// Attach a viewer to a session's hub.
    pub fn subscribe(&self, id: &str, credential: &Credential) -> Result<Subscriber, SessionError> {
        self.auth.authorize(credential, Scope::View)?;
        self.handle(id)?.hub.subscribe(Scope::View)
    }

    /// Fresh catch-up state for a viewer that must resynchronise.
    pub fn snapshot(&self, id: &str, credential: &Credential) -> Result<Snapshot, SessionError> {
        self.auth.authorize(credential, Scope::View)?;
        Ok(self.handle(id)?.hub.snapshot())
    }

    /// Periodically prune sessions that exited more than `retention` ago.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = registry.remove_exited(retention);
                        if !removed.is_empty() {
                            tracing::debug!(count = removed.len(), "Cleanup pass removed sessions");
                        }
                    }
                }
            }
        })
    }

    /// Re-attach the multiplexer sessions recorded by a previous run.
    pub async fn restore(&self) -> Vec<SessionId> {
        let Some(store) = self.store.clone() else {
            return Vec::new();
        };

        let mut restored = Vec::new();
        for record in store.load_all() {
            if self.sessions.contains_key(&record.id) {
                continue;
            }
            let id = record.id.clone();
            // Restored sessions were admitted by a previous run.
            let slot = SessionSlot::acquire(&self.live);
            match self
                .attach(record.id, record.target, Some(record.name), record.created_at, slot)
                .await
            {
                Ok(_) => {
                    tracing::info!(session_id = %id, "Restored attached session");
                    restored.push(id);
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Dropping stale session record");
                    let _ = store.remove(&id);
                }
            }
        }
        restored
    }

    /// Terminate every live session. Attach records survive for [`restore`](Self::restore).
    pub async fn shutdown(&self) {
        let handles: Vec<(SessionId, SessionHandle)> = self
            .sessions
            .iter()
            .filter(|e| !e.state.borrow().is_exited())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (id, handle) in handles {
            if let Err(e) = self
                .request(&handle, &id, |reply| SessionCommand::Shutdown { reply })
                .await
            {
                tracing::warn!(session_id = %id, error = %e, "Session did not shut down cleanly");
            }
        }
    }
}

async fn resolve_working_dir(dir: &std::path::Path) -> Result<PathBuf, SessionError> {
    let resolved = tokio::fs::canonicalize(dir).await.map_err(|_| {
        SessionError::InvalidRequest(format!("working directory does not exist: {}", dir.display()))
    })?;
    let metadata = tokio::fs::metadata(&resolved).await.map_err(|e| {
        SessionError::InvalidRequest(format!("cannot access {}: {}", resolved.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(SessionError::InvalidRequest(format!(
            "working directory is not a directory: {}",
            resolved.display()
        )));
    }
    Ok(resolved)
}

async fn start_backend(
    backend: &mut dyn SessionBackend,
    geometry: Geometry,
) -> Result<BackendStream, SessionError> {
    backend.start(geometry).await.map_err(|e| match e {
        SessionError::InvalidRequest(_) | SessionError::BackendError(_) => e,
        other => SessionError::BackendError(other.to_string()),
    })
}

fn task_gone(id: &str) -> SessionError {
    SessionError::BackendError(format!("session task for {} has stopped", id))
}

struct KillProgress {
    escalated: bool,
    deadline: Instant,
    waiters: Vec<Reply<()>>,
}

/// The single owner of one session's backend and state.
struct SessionTask {
    id: SessionId,
    backend: Box<dyn SessionBackend>,
    hub: Arc<BufferBroadcastHub>,
    state: watch::Sender<SessionInfo>,
    events: broadcast::Sender<RegistryEvent>,
    store: Option<SessionStore>,
    tracker: ActivityTracker,
    kill_timeout: Duration,
    kill: Option<KillProgress>,
    slot: Option<SessionSlot>,
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>, stream: BackendStream) {
        let BackendStream {
            mut output,
            mut exit,
        } = stream;
        let mut output_open = true;

        if self.backend.kind() != BackendKind::Pty {
            self.mark_running();
        }

        loop {
            let exited = self.is_exited();
            if exited && output_open {
                output.close();
                output_open = false;
            }
            let deadline = self.kill.as_ref().map(|k| k.deadline);

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                chunk = output.recv(), if output_open && !exited => match chunk {
                    Some(data) => self.on_output(data),
                    None => output_open = false,
                },
                code = &mut exit, if !output_open && !exited => {
                    self.finish(code.ok().flatten());
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !exited => {
                    self.escalate().await;
                }
            }
        }

        if !self.is_exited() {
            let _ = self.backend.kill(Signal::SIGHUP).await;
        }
        tracing::debug!(session_id = %self.id, "Session task stopped");
    }

    fn is_exited(&self) -> bool {
        self.state.borrow().is_exited()
    }

    fn mark_running(&mut self) {
        if self.state.send_if_modified(|s| s.mark_running()) {
            tracing::debug!(session_id = %self.id, "Session running");
            let _ = self.events.send(RegistryEvent::StatusChanged {
                id: self.id.clone(),
                status: SessionStatus::Running,
            });
        }
    }

    fn on_output(&mut self, data: Bytes) {
        let now = now_millis();
        let specific_status = self.tracker.observe(&data, now);
        self.mark_running();
        self.state.send_modify(|s| {
            s.last_activity = now;
            s.activity = Some(ActivityStatus {
                is_active: true,
                specific_status,
            });
        });
        self.hub.publish_data(data);
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Input { input, reply } => {
                let result = self.write(input).await;
                let _ = reply.send(result);
            }
            SessionCommand::Resize { geometry, reply } => {
                let result = self.resize(geometry).await;
                let _ = reply.send(result);
            }
            SessionCommand::Kill { signal, reply } => self.begin_kill(signal, reply).await,
            SessionCommand::Rename { name, reply } => {
                self.state.send_modify(|s| s.name = name.clone());
                tracing::info!(session_id = %self.id, name = %name, "Renamed session");
                let _ = self.events.send(RegistryEvent::Renamed {
                    id: self.id.clone(),
                    name,
                });
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Shutdown { reply } => {
                // Keep the attach record for the next start.
                self.store = None;
                self.begin_kill(Signal::SIGHUP, reply).await;
            }
        }
    }

    async fn write(&mut self, input: SessionInput) -> Result<(), SessionError> {
        if self.is_exited() {
            return Err(SessionError::SessionExited(self.id.clone()));
        }
        let result = match input {
            SessionInput::Bytes(data) => self.backend.write(&data).await,
            SessionInput::Key(key) => self.backend.send_key(key).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Write failed, terminating session");
                let _ = self.backend.kill(Signal::SIGKILL).await;
                self.finish(None);
                Err(match e {
                    SessionError::BackendError(_) => e,
                    other => SessionError::BackendError(other.to_string()),
                })
            }
        }
    }

    async fn resize(&mut self, geometry: Geometry) -> Result<ResizeOutcome, SessionError> {
        let outcome = if self.is_exited() {
            ResizeOutcome::Recorded
        } else {
            match self.backend.resize(geometry).await {
                Ok(()) => ResizeOutcome::Applied,
                Err(SessionError::Unsupported(reason)) => {
                    tracing::warn!(session_id = %self.id, reason = %reason, "Resize not supported, recording geometry only");
                    ResizeOutcome::Recorded
                }
                Err(e) => return Err(e),
            }
        };

        self.state.send_modify(|s| s.geometry = geometry);
        self.hub.publish_resize(geometry);
        tracing::debug!(session_id = %self.id, geometry = %geometry, outcome = ?outcome, "Resized session");
        Ok(outcome)
    }

    async fn begin_kill(&mut self, signal: Signal, reply: Reply<()>) {
        if self.is_exited() {
            let _ = reply.send(Ok(()));
            return;
        }
        if let Some(progress) = self.kill.as_mut() {
            progress.waiters.push(reply);
            return;
        }

        tracing::info!(session_id = %self.id, signal = %signal, "Killing session");
        match self.backend.kill(signal).await {
            Ok(()) => {
                self.kill = Some(KillProgress {
                    escalated: signal == Signal::SIGKILL,
                    deadline: Instant::now() + self.kill_timeout,
                    waiters: vec![reply],
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn escalate(&mut self) {
        let Some(progress) = self.kill.as_mut() else {
            return;
        };

        if progress.escalated {
            tracing::warn!(session_id = %self.id, "Session did not exit after SIGKILL, marking exited");
            self.finish(None);
            return;
        }

        progress.escalated = true;
        progress.deadline = Instant::now() + self.kill_timeout;
        tracing::warn!(
            session_id = %self.id,
            timeout_ms = self.kill_timeout.as_millis() as u64,
            "Session ignored kill signal, sending SIGKILL"
        );
        if let Err(e) = self.backend.kill(Signal::SIGKILL).await {
            tracing::warn!(session_id = %self.id, error = %e, "SIGKILL failed");
        }
    }

    fn finish(&mut self, code: Option<i32>) {
        let now = now_millis();
        let changed = self.state.send_if_modified(|s| {
            let changed = s.mark_exited(code, now);
            if let Some(activity) = s.activity.as_mut() {
                activity.is_active = false;
            }
            changed
        });
        if !changed {
            return;
        }
        self.slot = None;

        self.hub.publish_exit(code);
        let exit_code = self.state.borrow().exit_code.unwrap_or(UNKNOWN_EXIT_CODE);
        tracing::info!(session_id = %self.id, exit_code, "Session exited");
        let _ = self.events.send(RegistryEvent::Exited {
            id: self.id.clone(),
            exit_code,
        });

        if let Some(store) = self.store.take() {
            if let Err(e) = store.remove(&self.id) {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to remove session record");
            }
        }

        if let Some(progress) = self.kill.take() {
            for waiter in progress.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }
}
