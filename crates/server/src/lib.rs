//! # termhub Session Server Library
//!
//! Hosts interactive terminal sessions and streams them to any number of
//! viewers.
//!
//! ## Overview
//!
//! - **Sessions**: run a command on a local pseudo-terminal, or attach to a
//!   pane of an external multiplexer (tmux or zellij)
//! - **Buffer streaming**: each session's output is fanned out to viewers as
//!   sequenced frames with per-viewer backpressure
//! - **Control socket**: correlated request/response and notifications with
//!   the host supervisor over a local Unix socket
//! - **Authorization**: every mutating call and every subscription passes an
//!   auth gate
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Server Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌─────────────┐  │
//! │  │ Session Registry │──▶│   Backends   │   │  Auth Gate  │  │
//! │  │ (task / session) │   │ pty/tmux/zj  │   └─────────────┘  │
//! │  └────────┬─────────┘   └──────────────┘                    │
//! │           ▼                                                  │
//! │  ┌──────────────────┐   ┌──────────────────────────────┐    │
//! │  │ Broadcast Hubs   │   │ Control Socket + Router      │    │
//! │  └──────────────────┘   └──────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, ServerOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = ServerOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Credentials, scopes and the auth gate
//! - [`session`]: Registry, backends, hubs, discovery and persistence
//! - [`control`]: Control socket server, client and routing
//! - [`orchestrator`]: Main server coordinator

pub mod auth;
pub mod config;
pub mod control;
pub mod orchestrator;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{AuthGate, Credential, Scope};
pub use config::Config;
pub use control::{ControlClient, ControlError, ControlRouter, ControlSocketServer};
pub use orchestrator::{OrchestratorEvent, OrchestratorState, ServerOrchestrator};
pub use session::{
    BufferBroadcastHub, HubEvent, LocalSpec, MultiplexerKind, MultiplexerTarget, SessionError,
    SessionId, SessionInfo, SessionInput, SessionRegistry, SessionSpec, SessionStatus, SpecialKey,
    Subscriber,
};
