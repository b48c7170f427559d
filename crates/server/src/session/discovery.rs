//! Enumerate external multiplexer sessions for the attach flow.
//!
//! Read-only: nothing here changes multiplexer state. CLI output parsing is
//! kept in pure functions so it can be tested without the binaries.

use serde::Serialize;
use tokio::sync::OnceCell;

use super::backend::run_multiplexer;
use super::backend::zellij::parse_session_names;
use super::model::{MultiplexerKind, SessionError};

const TMUX_SESSION_FORMAT: &str = "#{session_name}\t#{session_attached}";
const TMUX_WINDOW_FORMAT: &str = "#{window_index}\t#{window_active}\t#{window_name}";
const TMUX_PANE_FORMAT: &str = "#{pane_index}\t#{pane_active}\t#{pane_current_command}";

/// A pane inside a discovered window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPane {
    pub index: u32,
    pub active: bool,
    pub command: String,
}

/// A tmux window or zellij tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredWindow {
    /// tmux window index, or 1-based zellij tab position.
    pub index: u32,
    pub name: String,
    pub active: bool,
    pub panes: Vec<DiscoveredPane>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredSession {
    pub kind: MultiplexerKind,
    pub name: String,
    pub attached: bool,
    pub windows: Vec<DiscoveredWindow>,
}

/// Pick the first entry of `priority` that is available.
pub fn select_preferred(
    available: &[MultiplexerKind],
    priority: &[MultiplexerKind],
) -> Option<MultiplexerKind> {
    priority.iter().copied().find(|kind| available.contains(kind))
}

fn flag(s: &str) -> bool {
    s.trim().parse::<u32>().map(|n| n > 0).unwrap_or(false)
}

/// Parse `list-sessions -F TMUX_SESSION_FORMAT`.
pub fn parse_tmux_sessions(output: &str) -> Vec<(String, bool)> {
    output
        .lines()
        .filter_map(|line| {
            let (name, attached) = line.split_once('\t')?;
            Some((name.to_string(), flag(attached)))
        })
        .collect()
}

/// Parse `list-windows -F TMUX_WINDOW_FORMAT`.
pub fn parse_tmux_windows(output: &str) -> Vec<DiscoveredWindow> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let index = parts.next()?.trim().parse().ok()?;
            let active = flag(parts.next()?);
            let name = parts.next().unwrap_or_default().to_string();
            Some(DiscoveredWindow {
                index,
                name,
                active,
                panes: Vec::new(),
            })
        })
        .collect()
}

/// Parse `list-panes -F TMUX_PANE_FORMAT`.
pub fn parse_tmux_panes(output: &str) -> Vec<DiscoveredPane> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let index = parts.next()?.trim().parse().ok()?;
            let active = flag(parts.next()?);
            let command = parts.next().unwrap_or_default().to_string();
            Some(DiscoveredPane {
                index,
                active,
                command,
            })
        })
        .collect()
}

/// Parse `zellij action query-tab-names` into 1-based tabs.
pub fn parse_zellij_tabs(output: &str) -> Vec<DiscoveredWindow> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .zip(1u32..)
        .map(|(name, index)| DiscoveredWindow {
            index,
            name: name.to_string(),
            active: false,
            panes: Vec::new(),
        })
        .collect()
}

/// Discovery over the multiplexers installed on this host.
#[derive(Debug)]
pub struct MultiplexerDiscovery {
    priority: Vec<MultiplexerKind>,
    preferred: OnceCell<Option<MultiplexerKind>>,
}

impl MultiplexerDiscovery {
    pub fn new(priority: Vec<MultiplexerKind>) -> Self {
        Self {
            priority,
            preferred: OnceCell::new(),
        }
    }

    pub fn is_installed(kind: MultiplexerKind) -> bool {
        which::which(kind.binary()).is_ok()
    }

    /// Installed multiplexers, in priority order.
    pub fn available(&self) -> Vec<MultiplexerKind> {
        self.priority
            .iter()
            .copied()
            .filter(|k| Self::is_installed(*k))
            .collect()
    }

    /// The preferred installed multiplexer. Computed once and cached.
    pub async fn preferred(&self) -> Option<MultiplexerKind> {
        *self
            .preferred
            .get_or_init(|| async {
                let available = self.available();
                let chosen = select_preferred(&available, &self.priority);
                tracing::debug!(available = ?available, chosen = ?chosen, "Selected preferred multiplexer");
                chosen
            })
            .await
    }

    /// Sessions of every installed multiplexer. Per-multiplexer failures are
    /// logged and skipped.
    pub async fn discover(&self) -> Vec<DiscoveredSession> {
        let mut sessions = Vec::new();
        for kind in self.available() {
            match discover_kind(kind).await {
                Ok(found) => sessions.extend(found),
                Err(e) => tracing::warn!(multiplexer = %kind, error = %e, "Discovery failed"),
            }
        }
        sessions
    }
}

/// Sessions of one multiplexer.
pub async fn discover_kind(kind: MultiplexerKind) -> Result<Vec<DiscoveredSession>, SessionError> {
    match kind {
        MultiplexerKind::Tmux => discover_tmux().await,
        MultiplexerKind::Zellij => discover_zellij().await,
    }
}

async fn discover_tmux() -> Result<Vec<DiscoveredSession>, SessionError> {
    let listing = match run_multiplexer("tmux", &["list-sessions", "-F", TMUX_SESSION_FORMAT]).await {
        Ok(out) => out,
        // No tmux server means no sessions.
        Err(SessionError::BackendError(msg))
            if msg.contains("no server running") || msg.contains("No such file") =>
        {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e),
    };

    let mut sessions = Vec::new();
    for (name, attached) in parse_tmux_sessions(&listing) {
        let target = format!("={}", name);
        let windows_out =
            run_multiplexer("tmux", &["list-windows", "-t", &target, "-F", TMUX_WINDOW_FORMAT]).await?;

        let mut windows = parse_tmux_windows(&windows_out);
        for window in &mut windows {
            let window_target = format!("{}:{}", target, window.index);
            let panes_out = run_multiplexer(
                "tmux",
                &["list-panes", "-t", &window_target, "-F", TMUX_PANE_FORMAT],
            )
            .await?;
            window.panes = parse_tmux_panes(&panes_out);
        }

        sessions.push(DiscoveredSession {
            kind: MultiplexerKind::Tmux,
            name,
            attached,
            windows,
        });
    }
    Ok(sessions)
}

async fn discover_zellij() -> Result<Vec<DiscoveredSession>, SessionError> {
    let listing = match run_multiplexer("zellij", &["list-sessions", "--short", "--no-formatting"]).await {
        Ok(out) => out,
        Err(SessionError::BackendError(msg)) if msg.contains("No active") => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut sessions = Vec::new();
    for name in parse_session_names(&listing) {
        let windows = match run_multiplexer("zellij", &["--session", &name, "action", "query-tab-names"]).await {
            Ok(out) => parse_zellij_tabs(&out),
            Err(e) => {
                tracing::debug!(session = %name, error = %e, "Could not list zellij tabs");
                Vec::new()
            }
        };
        sessions.push(DiscoveredSession {
            kind: MultiplexerKind::Zellij,
            name,
            attached: false,
            windows,
        });
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_preferred() {
        use MultiplexerKind::*;
        assert_eq!(select_preferred(&[Tmux, Zellij], &[Zellij, Tmux]), Some(Zellij));
        assert_eq!(select_preferred(&[Tmux], &[Zellij, Tmux]), Some(Tmux));
        assert_eq!(select_preferred(&[], &[Zellij, Tmux]), None);
        assert_eq!(select_preferred(&[Tmux], &[Zellij]), None);
    }

    #[test]
    fn test_parse_tmux_sessions() {
        let out = "work\t1\nscratch\t0\nbad line\n";
        assert_eq!(
            parse_tmux_sessions(out),
            vec![("work".to_string(), true), ("scratch".to_string(), false)]
        );
    }

    #[test]
    fn test_parse_tmux_windows() {
        let windows = parse_tmux_windows("0\t0\teditor\n1\t1\tlogs\twith tab\nx\t0\tbad\n");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].name, "editor");
        assert!(!windows[0].active);
        assert_eq!(windows[1].index, 1);
        assert!(windows[1].active);
        assert_eq!(windows[1].name, "logs\twith tab");
    }

    #[test]
    fn test_parse_tmux_panes() {
        let panes = parse_tmux_panes("0\t1\tvim\n1\t0\tzsh\n");
        assert_eq!(
            panes,
            vec![
                DiscoveredPane {
                    index: 0,
                    active: true,
                    command: "vim".to_string()
                },
                DiscoveredPane {
                    index: 1,
                    active: false,
                    command: "zsh".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_parse_zellij_tabs_are_one_based() {
        let tabs = parse_zellij_tabs("Tab #1\n\nbuild\n");
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].index, 1);
        assert_eq!(tabs[1].index, 2);
        assert_eq!(tabs[1].name, "build");
    }

    #[tokio::test]
    async fn test_preferred_is_cached() {
        let discovery = MultiplexerDiscovery::new(vec![MultiplexerKind::Tmux, MultiplexerKind::Zellij]);
        let first = discovery.preferred().await;
        assert_eq!(discovery.preferred().await, first);
        if let Some(kind) = first {
            assert!(MultiplexerDiscovery::is_installed(kind));
        }
    }

    #[tokio::test]
    async fn test_discover_does_not_fail_without_multiplexers() {
        let discovery = MultiplexerDiscovery::new(vec![]);
        assert!(discovery.available().is_empty());
        assert!(discovery.discover().await.is_empty());
    }

    #[test]
    fn test_session_json_shape() {
        let session = DiscoveredSession {
            kind: MultiplexerKind::Zellij,
            name: "dev".to_string(),
            attached: false,
            windows: parse_zellij_tabs("main\n"),
        };
        let v = serde_json::to_value(&session).unwrap();
        assert_eq!(v["kind"], "zellij");
        assert_eq!(v["windows"][0]["index"], 1);
    }
}
