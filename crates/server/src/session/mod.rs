//! Session management module.
//!
//! Sessions run a command on a local pseudo-terminal or attach to a pane of
//! an external multiplexer. The [`SessionRegistry`] owns them; each session's
//! output is fanned out to viewers by a [`BufferBroadcastHub`].

pub mod activity;
pub mod backend;
pub mod discovery;
pub mod hub;
pub mod model;
pub mod registry;
pub mod store;

pub use backend::{parse_signal, SessionBackend};
pub use discovery::{DiscoveredSession, MultiplexerDiscovery};
pub use hub::{BufferBroadcastHub, HubConfig, HubEvent, Snapshot, Subscriber, SubscriberStats};
pub use model::{
    ActivityStatus, BackendKind, Geometry, LocalSpec, MultiplexerKind, MultiplexerTarget,
    SessionError, SessionId, SessionInfo, SessionInput, SessionSpec, SessionStatus, SpecialKey,
    SpecificStatus,
};
pub use registry::{RegistryConfig, RegistryEvent, ResizeOutcome, SessionRegistry};
pub use store::SessionStore;
