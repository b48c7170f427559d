//! Session data model.
//!
//! The types here are the snapshot a caller sees: they are produced by the
//! registry and never mutated outside the owning session task.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use protocol::UNKNOWN_EXIT_CODE;

/// Unique identifier for a session.
pub type SessionId = String;

/// How long after the last output a session still counts as active.
pub const ACTIVITY_WINDOW_MS: u64 = 5_000;

/// Errors returned by the session registry, hub and backends.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Bad request shape, e.g. a nonexistent working directory.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The credential does not grant the required scope.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Spawn, attach, write or kill failed in the backend.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The session has already exited.
    #[error("session has exited: {0}")]
    SessionExited(SessionId),

    /// The backend cannot perform this operation.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The session's hub is closed; no further subscriptions are accepted.
    #[error("hub closed for session {0}")]
    HubClosed(SessionId),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Stable machine-readable code, used in control-socket error responses.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidRequest(_) => "InvalidRequest",
            SessionError::NotFound(_) => "NotFound",
            SessionError::Unauthorized(_) => "Unauthorized",
            SessionError::BackendError(_) | SessionError::Io(_) => "BackendError",
            SessionError::SessionExited(_) => "SessionExited",
            SessionError::Unsupported(_) => "Unsupported",
            SessionError::HubClosed(_) => "HubClosed",
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Backend started, not yet confirmed running.
    Starting,
    /// Backend produced output (or attach succeeded).
    Running,
    /// Terminal state.
    Exited,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Terminal geometry, always at least 1x1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    cols: u16,
    rows: u16,
}

impl Geometry {
    /// Create a geometry, rejecting zero dimensions.
    pub fn new(cols: u16, rows: u16) -> Result<Self, SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidRequest(format!(
                "geometry must be at least 1x1, got {}x{}",
                cols, rows
            )));
        }
        Ok(Self { cols, rows })
    }

    /// Columns.
    pub fn cols(&self) -> u16 {
        self.cols
    }

    /// Rows.
    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Application-specific status recognised in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificStatus {
    /// Application name, e.g. "claude".
    pub app: String,
    /// Free-text summary.
    pub status: String,
}

/// Activity derived from recent output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStatus {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_status: Option<SpecificStatus>,
}

/// Which backend variant drives a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Pty,
    Tmux,
    Zellij,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Pty => write!(f, "pty"),
            BackendKind::Tmux => write!(f, "tmux"),
            BackendKind::Zellij => write!(f, "zellij"),
        }
    }
}

/// External terminal multiplexers we can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerKind {
    Tmux,
    Zellij,
}

impl MultiplexerKind {
    /// Name of the multiplexer's executable.
    pub fn binary(&self) -> &'static str {
        match self {
            MultiplexerKind::Tmux => "tmux",
            MultiplexerKind::Zellij => "zellij",
        }
    }

    /// Backend kind that drives an attached pane of this multiplexer.
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            MultiplexerKind::Tmux => BackendKind::Tmux,
            MultiplexerKind::Zellij => BackendKind::Zellij,
        }
    }
}

impl FromStr for MultiplexerKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tmux" => Ok(MultiplexerKind::Tmux),
            "zellij" => Ok(MultiplexerKind::Zellij),
            other => Err(SessionError::InvalidRequest(format!(
                "unknown multiplexer: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MultiplexerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Identifies an external multiplexer session, window and pane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiplexerTarget {
    pub kind: MultiplexerKind,
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane: Option<u32>,
}

impl MultiplexerTarget {
    /// Target a whole multiplexer session.
    pub fn new(kind: MultiplexerKind, session: impl Into<String>) -> Self {
        Self {
            kind,
            session: session.into(),
            window: None,
            pane: None,
        }
    }

    /// Narrow the target to a window (tmux) or tab (zellij).
    pub fn with_window(mut self, window: u32) -> Self {
        self.window = Some(window);
        self
    }

    /// Narrow the target to a pane.
    pub fn with_pane(mut self, pane: u32) -> Self {
        self.pane = Some(pane);
        self
    }

    /// Display label, e.g. `tmux:work:1.0`.
    pub fn label(&self) -> String {
        let mut label = format!("{}:{}", self.kind, self.session);
        if let Some(window) = self.window {
            label.push_str(&format!(":{}", window));
            if let Some(pane) = self.pane {
                label.push_str(&format!(".{}", pane));
            }
        }
        label
    }
}

/// A local pseudo-terminal session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSpec {
    /// Argument vector; empty means the configured default shell.
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub geometry: Geometry,
    pub name: Option<String>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl LocalSpec {
    pub fn new(command: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            working_dir: working_dir.into(),
            geometry: Geometry::default(),
            name: None,
            env: Vec::new(),
        }
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A request to create a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSpec {
    /// Spawn a command on a new pseudo-terminal.
    Local(LocalSpec),
    /// Attach to an existing multiplexer pane.
    Attach {
        target: MultiplexerTarget,
        name: Option<String>,
    },
}

/// Named keys that can be sent instead of raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialKey {
    Enter,
    Tab,
    Escape,
    Backspace,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    Delete,
    CtrlC,
    CtrlD,
    CtrlL,
    CtrlZ,
}

impl SpecialKey {
    const ALL: [SpecialKey; 18] = [
        SpecialKey::Enter,
        SpecialKey::Tab,
        SpecialKey::Escape,
        SpecialKey::Backspace,
        SpecialKey::Up,
        SpecialKey::Down,
        SpecialKey::Left,
        SpecialKey::Right,
        SpecialKey::Home,
        SpecialKey::End,
        SpecialKey::PageUp,
        SpecialKey::PageDown,
        SpecialKey::Insert,
        SpecialKey::Delete,
        SpecialKey::CtrlC,
        SpecialKey::CtrlD,
        SpecialKey::CtrlL,
        SpecialKey::CtrlZ,
    ];

    /// Bytes an xterm-compatible terminal sends for this key.
    pub fn escape_sequence(&self) -> &'static [u8] {
        match self {
            SpecialKey::Enter => b"\r",
            SpecialKey::Tab => b"\t",
            SpecialKey::Escape => b"\x1b",
            SpecialKey::Backspace => b"\x7f",
            SpecialKey::Up => b"\x1b[A",
            SpecialKey::Down => b"\x1b[B",
            SpecialKey::Right => b"\x1b[C",
            SpecialKey::Left => b"\x1b[D",
            SpecialKey::Home => b"\x1b[H",
            SpecialKey::End => b"\x1b[F",
            SpecialKey::PageUp => b"\x1b[5~",
            SpecialKey::PageDown => b"\x1b[6~",
            SpecialKey::Insert => b"\x1b[2~",
            SpecialKey::Delete => b"\x1b[3~",
            SpecialKey::CtrlC => b"\x03",
            SpecialKey::CtrlD => b"\x04",
            SpecialKey::CtrlL => b"\x0c",
            SpecialKey::CtrlZ => b"\x1a",
        }
    }

    /// Key name understood by `tmux send-keys`.
    pub fn tmux_name(&self) -> &'static str {
        match self {
            SpecialKey::Enter => "Enter",
            SpecialKey::Tab => "Tab",
            SpecialKey::Escape => "Escape",
            SpecialKey::Backspace => "BSpace",
            SpecialKey::Up => "Up",
            SpecialKey::Down => "Down",
            SpecialKey::Left => "Left",
            SpecialKey::Right => "Right",
            SpecialKey::Home => "Home",
            SpecialKey::End => "End",
            SpecialKey::PageUp => "PPage",
            SpecialKey::PageDown => "NPage",
            SpecialKey::Insert => "IC",
            SpecialKey::Delete => "DC",
            SpecialKey::CtrlC => "C-c",
            SpecialKey::CtrlD => "C-d",
            SpecialKey::CtrlL => "C-l",
            SpecialKey::CtrlZ => "C-z",
        }
    }

    /// Wire name, e.g. `page-up`.
    pub fn name(&self) -> &'static str {
        match self {
            SpecialKey::Enter => "enter",
            SpecialKey::Tab => "tab",
            SpecialKey::Escape => "escape",
            SpecialKey::Backspace => "backspace",
            SpecialKey::Up => "up",
            SpecialKey::Down => "down",
            SpecialKey::Left => "left",
            SpecialKey::Right => "right",
            SpecialKey::Home => "home",
            SpecialKey::End => "end",
            SpecialKey::PageUp => "page-up",
            SpecialKey::PageDown => "page-down",
            SpecialKey::Insert => "insert",
            SpecialKey::Delete => "delete",
            SpecialKey::CtrlC => "ctrl-c",
            SpecialKey::CtrlD => "ctrl-d",
            SpecialKey::CtrlL => "ctrl-l",
            SpecialKey::CtrlZ => "ctrl-z",
        }
    }
}

impl FromStr for SpecialKey {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('_', "-");
        let wanted = match wanted.as_str() {
            "esc" => "escape",
            "return" => "enter",
            "pgup" => "page-up",
            "pgdn" => "page-down",
            other => other,
        };
        SpecialKey::ALL
            .iter()
            .copied()
            .find(|key| key.name() == wanted)
            .ok_or_else(|| SessionError::InvalidRequest(format!("unknown key: {}", s)))
    }
}

impl fmt::Display for SpecialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Input for a session: raw bytes forwarded verbatim, or a named key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Bytes(Bytes),
    Key(SpecialKey),
}

impl From<Bytes> for SessionInput {
    fn from(data: Bytes) -> Self {
        SessionInput::Bytes(data)
    }
}

impl From<&[u8]> for SessionInput {
    fn from(data: &[u8]) -> Self {
        SessionInput::Bytes(Bytes::copy_from_slice(data))
    }
}

impl From<Vec<u8>> for SessionInput {
    fn from(data: Vec<u8>) -> Self {
        SessionInput::Bytes(Bytes::from(data))
    }
}

impl From<SpecialKey> for SessionInput {
    fn from(key: SpecialKey) -> Self {
        SessionInput::Key(key)
    }
}

/// Snapshot of a session as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    pub status: SessionStatus,
    /// Set if and only if `status` is `Exited`; `-1` means unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Unix milliseconds.
    pub created_at: u64,
    pub last_activity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<u64>,
    pub geometry: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityStatus>,
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl SessionInfo {
    /// Returns true once the session reached its terminal state.
    pub fn is_exited(&self) -> bool {
        self.status == SessionStatus::Exited
    }

    /// Move `starting` to `running`. No-op in any other state.
    pub(crate) fn mark_running(&mut self) -> bool {
        if self.status == SessionStatus::Starting {
            self.status = SessionStatus::Running;
            return true;
        }
        false
    }

    /// Move to `exited`, recording the code. Returns false if already exited.
    pub(crate) fn mark_exited(&mut self, code: Option<i32>, now: u64) -> bool {
        if self.is_exited() {
            return false;
        }
        self.status = SessionStatus::Exited;
        self.exit_code = Some(code.unwrap_or(UNKNOWN_EXIT_CODE));
        self.exited_at = Some(now);
        true
    }

    /// Recompute `activity.is_active` against `now`.
    pub(crate) fn refresh_activity(mut self, now: u64) -> Self {
        let active = !self.is_exited() && now.saturating_sub(self.last_activity) < ACTIVITY_WINDOW_MS;
        match self.activity.as_mut() {
            Some(activity) => activity.is_active = active,
            None if active => {
                self.activity = Some(ActivityStatus {
                    is_active: true,
                    specific_status: None,
                })
            }
            None => {}
        }
        self
    }
}

/// Derive a display name from a command vector.
pub fn derive_name(command: &[String]) -> String {
    let Some(program) = command.first() else {
        return "shell".to_string();
    };
    let base = std::path::Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());

    std::iter::once(base)
        .chain(command[1..].iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Current time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo {
            id: "s1".to_string(),
            name: "sh".to_string(),
            command: vec!["/bin/sh".to_string()],
            working_dir: PathBuf::from("/tmp"),
            status: SessionStatus::Starting,
            exit_code: None,
            created_at: 1_000,
            last_activity: 1_000,
            exited_at: None,
            geometry: Geometry::default(),
            activity: None,
            backend: BackendKind::Pty,
            pid: None,
        }
    }

    #[test]
    fn test_geometry_rejects_zero() {
        assert!(Geometry::new(0, 24).is_err());
        assert!(Geometry::new(80, 0).is_err());
        let g = Geometry::new(1, 1).unwrap();
        assert_eq!((g.cols(), g.rows()), (1, 1));
    }

    #[test]
    fn test_exit_code_set_only_when_exited() {
        let mut s = info();
        assert!(s.exit_code.is_none());

        assert!(s.mark_running());
        assert_eq!(s.status, SessionStatus::Running);
        assert!(s.exit_code.is_none());

        assert!(s.mark_exited(None, 2_000));
        assert_eq!(s.status, SessionStatus::Exited);
        assert_eq!(s.exit_code, Some(-1));
        assert_eq!(s.exited_at, Some(2_000));
    }

    #[test]
    fn test_no_transition_out_of_exited() {
        let mut s = info();
        assert!(s.mark_exited(Some(0), 2_000));
        assert!(!s.mark_running());
        assert!(!s.mark_exited(Some(1), 3_000));
        assert_eq!(s.status, SessionStatus::Exited);
        assert_eq!(s.exit_code, Some(0));
    }

    #[test]
    fn test_starting_to_exited_directly() {
        let mut s = info();
        assert!(s.mark_exited(Some(127), 1_500));
        assert_eq!(s.exit_code, Some(127));
    }

    #[test]
    fn test_derive_name() {
        let cmd = vec!["/usr/bin/python3".to_string(), "-m".to_string(), "http.server".to_string()];
        assert_eq!(derive_name(&cmd), "python3 -m http.server");
        assert_eq!(derive_name(&[]), "shell");
    }

    #[test]
    fn test_target_label() {
        let t = MultiplexerTarget::new(MultiplexerKind::Tmux, "work")
            .with_window(1)
            .with_pane(2);
        assert_eq!(t.label(), "tmux:work:1.2");

        let t = MultiplexerTarget::new(MultiplexerKind::Zellij, "dev").with_window(0);
        assert_eq!(t.label(), "zellij:dev:0");
    }

    #[test]
    fn test_multiplexer_kind_from_str() {
        assert_eq!("TMUX".parse::<MultiplexerKind>().unwrap(), MultiplexerKind::Tmux);
        assert_eq!("zellij".parse::<MultiplexerKind>().unwrap(), MultiplexerKind::Zellij);
        assert!("screen".parse::<MultiplexerKind>().is_err());
    }

    #[test]
    fn test_refresh_activity() {
        let s = info().refresh_activity(1_000 + ACTIVITY_WINDOW_MS - 1);
        assert!(s.activity.unwrap().is_active);

        let s = info().refresh_activity(1_000 + ACTIVITY_WINDOW_MS);
        assert!(s.activity.is_none());

        let mut s = info();
        s.activity = Some(ActivityStatus {
            is_active: true,
            specific_status: Some(SpecificStatus {
                app: "claude".to_string(),
                status: "Thinking".to_string(),
            }),
        });
        let s = s.refresh_activity(60_000);
        let activity = s.activity.unwrap();
        assert!(!activity.is_active);
        assert!(activity.specific_status.is_some());
    }

    #[test]
    fn test_session_info_json_shape() {
        let mut s = info();
        s.mark_exited(Some(0), 5);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["status"], "exited");
        assert_eq!(v["exitCode"], 0);
        assert_eq!(v["workingDir"], "/tmp");
        assert_eq!(v["backend"], "pty");
    }

    #[test]
    fn test_special_key_parsing() {
        assert_eq!("enter".parse::<SpecialKey>().unwrap(), SpecialKey::Enter);
        assert_eq!("Page_Up".parse::<SpecialKey>().unwrap(), SpecialKey::PageUp);
        assert_eq!("ESC".parse::<SpecialKey>().unwrap(), SpecialKey::Escape);
        assert_eq!("ctrl-c".parse::<SpecialKey>().unwrap(), SpecialKey::CtrlC);
        assert!(matches!(
            "hyper".parse::<SpecialKey>(),
            Err(SessionError::InvalidRequest(_))
        ));

        for key in SpecialKey::ALL {
            assert_eq!(key.name().parse::<SpecialKey>().unwrap(), key);
            assert_eq!(serde_json::to_value(key).unwrap(), key.name());
        }
    }

    #[test]
    fn test_special_key_sequences() {
        assert_eq!(SpecialKey::Up.escape_sequence(), b"\x1b[A");
        assert_eq!(SpecialKey::Enter.escape_sequence(), b"\r");
        assert_eq!(SpecialKey::CtrlC.escape_sequence(), b"\x03");
        assert_eq!(SpecialKey::PageDown.tmux_name(), "NPage");
        assert_eq!(SpecialKey::CtrlC.tmux_name(), "C-c");
    }

    #[test]
    fn test_session_input_conversions() {
        assert_eq!(
            SessionInput::from(&b"ls\r"[..]),
            SessionInput::Bytes(Bytes::from_static(b"ls\r"))
        );
        assert_eq!(SessionInput::from(SpecialKey::Tab), SessionInput::Key(SpecialKey::Tab));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SessionError::NotFound("x".into()).code(), "NotFound");
        assert_eq!(
            SessionError::Io(std::io::Error::other("x")).code(),
            "BackendError"
        );
    }
}
