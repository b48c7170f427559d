//! termhub session server
//!
//! Runs the server, or talks to a running one over the control socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use server::auth::{generate_token, hash_token, Scope};
use server::config::Config;
use server::control::{get_socket_path, ControlClient, ControlRouter};
use server::orchestrator::{OrchestratorEvent, ServerOrchestrator};
use server::protocol::messages::{action, category};
use server::session::model::now_millis;
use server::session::{parse_signal, SessionInfo, SessionStatus};
use tracing_subscriber::EnvFilter;

/// termhub - terminal session server.
#[derive(Parser, Debug)]
#[command(name = "termhub-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the server in the foreground
    Start,

    /// Show server status
    Status,

    /// Manage sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// List attachable tmux and zellij sessions
    Discover {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Set the repository base path
    RepoPath {
        /// Path, stored as given
        path: String,
    },

    /// Generate a bearer token and the config entry that accepts it
    Token {
        /// Scope granted to the token
        #[arg(long, default_value = "control", value_parser = ["view", "control"])]
        scope: String,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Kill a session
    Kill {
        /// Session ID to kill
        session_id: String,

        /// Signal to send (default: SIGTERM)
        /// Common values: SIGTERM (15), SIGKILL (9), SIGHUP (1)
        #[arg(long, short, default_value = "SIGTERM")]
        signal: String,

        /// Force kill (equivalent to --signal SIGKILL)
        #[arg(long, short)]
        force: bool,
    },

    /// Remove exited sessions
    Prune {
        /// Only sessions that exited at least this many seconds ago
        #[arg(long, default_value = "0", value_name = "SECS")]
        older_than: u64,
    },
}

#[derive(Deserialize)]
struct SessionList {
    sessions: Vec<SessionInfo>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.server.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = &cli.config {
        tracing::debug!(path = %path.display(), "Using config file");
    }

    config.validate()?;

    let socket_path = config
        .server
        .control_socket
        .clone()
        .unwrap_or_else(get_socket_path);

    match cli.command {
        Commands::Start => {
            if ControlClient::connect_with_timeout(&socket_path, ControlRouter::new(), Duration::from_secs(1))
                .await
                .is_ok()
            {
                eprintln!("Error: a server is already listening on {}", socket_path.display());
                eprintln!();
                eprintln!("To check its status, run:");
                eprintln!("  termhub-server status");
                std::process::exit(1);
            }

            let mut orchestrator = ServerOrchestrator::new(config)?;
            run_foreground(&mut orchestrator).await?;
        }
        Commands::Status => match query_status(&socket_path).await {
            Ok((total, running)) => {
                println!("Server Status: running");
                println!("  Socket:   {}", socket_path.display());
                println!("  Sessions: {} ({} running)", total, running);
            }
            Err(e) => {
                eprintln!("Server is not running: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Sessions(cmd) => match cmd {
            SessionsCommands::List { json } => match query_sessions(&socket_path).await {
                Ok(sessions) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list sessions: {}", e);
                    std::process::exit(1);
                }
            },
            SessionsCommands::Kill {
                session_id,
                signal,
                force,
            } => {
                let signal = if force { "SIGKILL".to_string() } else { signal };
                let parsed = match parse_signal(&signal) {
                    Ok(sig) => sig,
                    Err(e) => {
                        eprintln!("Invalid signal: {}", e);
                        std::process::exit(1);
                    }
                };

                let payload = json!({ "id": session_id, "signal": parsed.as_str() });
                match send_request(&socket_path, category::SESSION, action::KILL, payload).await {
                    Ok(info) => {
                        let exit = info
                            .get("exitCode")
                            .and_then(Value::as_i64)
                            .map_or_else(|| "unknown".to_string(), |c| c.to_string());
                        println!("Session {} terminated with {} (exit code {})", session_id, parsed, exit);
                    }
                    Err(e) => {
                        eprintln!("Failed to kill session: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            SessionsCommands::Prune { older_than } => {
                let payload = json!({ "olderThanSecs": older_than });
                match send_request(&socket_path, category::SESSION, action::PRUNE, payload).await {
                    Ok(resp) => {
                        let removed = resp
                            .get("removed")
                            .and_then(Value::as_array)
                            .map_or(0, Vec::len);
                        println!("Removed {} session(s)", removed);
                    }
                    Err(e) => {
                        eprintln!("Failed to prune sessions: {}", e);
                        std::process::exit(1);
                    }
                }
            }
        },
        Commands::Discover { json } => {
            match send_request(&socket_path, category::SESSION, action::DISCOVER, Value::Null).await {
                Ok(resp) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&resp)?);
                    } else {
                        print_discovery(&resp);
                    }
                }
                Err(e) => {
                    eprintln!("Discovery failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Token { scope } => {
            let scope = if scope == "view" { Scope::View } else { Scope::Control };
            let token = generate_token();
            println!("Token: {}", token);
            println!();
            println!("Add this to the [auth] section of your config:");
            println!();
            print!("{}", token_entry_toml(&hash_token(&token), scope));
        }
        Commands::RepoPath { path } => {
            let payload = json!({ "path": path });
            match send_request(
                &socket_path,
                category::SYSTEM,
                action::REPOSITORY_PATH_UPDATE,
                payload,
            )
            .await
            {
                Ok(_) => println!("Repository path set to {}", path),
                Err(e) => {
                    eprintln!("Failed to set repository path: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn send_request(
    socket_path: &Path,
    category: &str,
    action: &str,
    payload: Value,
) -> anyhow::Result<Value> {
    let client = ControlClient::connect(socket_path, ControlRouter::new())
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to {}: {}", socket_path.display(), e))?;
    Ok(client.request(category, action, payload).await?)
}

async fn query_sessions(socket_path: &Path) -> anyhow::Result<Vec<SessionInfo>> {
    let resp = send_request(socket_path, category::SESSION, action::LIST, Value::Null).await?;
    let list: SessionList = serde_json::from_value(resp)?;
    Ok(list.sessions)
}

/// Returns `(total, running)` session counts.
async fn query_status(socket_path: &Path) -> anyhow::Result<(usize, usize)> {
    send_request(socket_path, category::SYSTEM, action::PING, Value::Null).await?;
    let sessions = query_sessions(socket_path).await?;
    let running = sessions
        .iter()
        .filter(|s| s.status == SessionStatus::Running)
        .count();
    Ok((sessions.len(), running))
}

/// TOML for an `[auth].tokens` entry accepting a token with `digest`.
fn token_entry_toml(digest: &str, scope: Scope) -> String {
    format!("[[auth.tokens]]\nsha256 = \"{}\"\nscopes = [\"{}\"]\n", digest, scope)
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);
    let name_width = sessions
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(4)
        .clamp(4, 32);

    println!(
        "{:<id_width$}  {:<name_width$}  {:<8}  {:<7}  {:>5}  {:>10}",
        "ID", "NAME", "STATUS", "BACKEND", "EXIT", "CREATED",
    );
    println!("{}", "-".repeat(id_width + name_width + 42));

    for session in sessions {
        let exit = session
            .exit_code
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        println!(
            "{:<id_width$}  {:<name_width$}  {:<8}  {:<7}  {:>5}  {:>10}",
            session.id,
            truncate_str(&session.name, name_width),
            session.status,
            session.backend,
            exit,
            format_relative_time(session.created_at),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn print_discovery(resp: &Value) {
    let preferred = resp.get("preferred").and_then(Value::as_str).unwrap_or("none");
    println!("Preferred multiplexer: {}", preferred);

    let sessions = resp
        .get("sessions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if sessions.is_empty() {
        println!("No multiplexer sessions found.");
        return;
    }

    for session in &sessions {
        let kind = session.get("kind").and_then(Value::as_str).unwrap_or("?");
        let name = session.get("name").and_then(Value::as_str).unwrap_or("?");
        let attached = session.get("attached").and_then(Value::as_bool).unwrap_or(false);
        println!("{}:{}{}", kind, name, if attached { " (attached)" } else { "" });

        let windows = session.get("windows").and_then(Value::as_array);
        for window in windows.into_iter().flatten() {
            let index = window.get("index").and_then(Value::as_u64).unwrap_or(0);
            let wname = window.get("name").and_then(Value::as_str).unwrap_or("");
            println!("  {}: {}", index, wname);
            let panes = window.get("panes").and_then(Value::as_array);
            for pane in panes.into_iter().flatten() {
                let pindex = pane.get("index").and_then(Value::as_u64).unwrap_or(0);
                let command = pane.get("command").and_then(Value::as_str).unwrap_or("");
                println!("    .{} {}", pindex, command);
            }
        }
    }
}

/// Format a Unix millisecond timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: u64) -> String {
    let elapsed = now_millis().saturating_sub(timestamp_ms) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to at most `max_len` characters, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

async fn run_foreground(orchestrator: &mut ServerOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(state = ?state, "Orchestrator state changed");
                }
                OrchestratorEvent::SessionsRestored { count } => {
                    tracing::info!(count, "Sessions restored");
                }
                OrchestratorEvent::RepositoryPathChanged { path } => {
                    tracing::info!(path = %path, "Repository path changed");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!(error = %message, "Orchestrator error");
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
