//! Local control socket between the host supervisor and the session server.
//!
//! Messages are length-prefixed JSON [`ControlMessage`](protocol::ControlMessage)
//! records. Either side may send requests; responses are correlated by id and
//! may arrive in any order. Notifications are fire-and-forget and fan out to
//! every listener registered for their category.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/termhub/control.sock`
//! - Fallback: `/tmp/termhub-$UID/control.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use server::control::{get_socket_path, ControlClient, ControlRouter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ControlClient::connect(&get_socket_path(), ControlRouter::new()).await?;
//!     let pong = client.request("system", "ping", serde_json::Value::Null).await?;
//!     println!("{}", pong);
//!     Ok(())
//! }
//! ```

mod client;
mod connection;
mod router;
mod server;

pub use client::ControlClient;
pub use connection::Connection;
pub use router::{
    ControlHandler, ControlRouter, FnHandler, HandlerError, NotificationSubscription,
    WeakControlRouter,
};
pub use server::ControlSocketServer;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use protocol::ProtocolError;
use thiserror::Error;

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors on the requesting side of the control socket.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The connection closed before a response arrived.
    #[error("connection lost")]
    ConnectionLost,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// No peer is connected.
    #[error("no peer connected")]
    NotConnected,

    /// The peer answered with an error response.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    /// Whether the peer reported that nothing handles the request.
    pub fn is_no_handler(&self) -> bool {
        matches!(self, ControlError::Remote(msg) if msg.starts_with("NoHandler"))
    }
}

/// Get the control socket path.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/termhub/control.sock`
/// 2. Otherwise: `/tmp/termhub-$UID/control.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("termhub").join("control.sock")
    } else {
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/termhub-{}", uid)).join("control.sock")
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/termhub-unsupported/control.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialised with the other env tests
        unsafe {
            std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        }
        let path = get_socket_path();
        assert_eq!(path, PathBuf::from("/run/user/1000/termhub/control.sock"));

        // SAFETY: serialised with the other env tests
        unsafe {
            match original {
                Some(val) => std::env::set_var("XDG_RUNTIME_DIR", val),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        // SAFETY: serialised with the other env tests
        unsafe {
            std::env::remove_var("XDG_RUNTIME_DIR");
        }
        let path = get_socket_path();
        let s = path.to_string_lossy();
        assert!(s.starts_with("/tmp/termhub-"));
        assert!(s.ends_with("/control.sock"));

        // SAFETY: serialised with the other env tests
        unsafe {
            if let Some(val) = original {
                std::env::set_var("XDG_RUNTIME_DIR", val);
            }
        }
    }

    #[test]
    fn test_no_handler_detection() {
        assert!(ControlError::Remote("NoHandler: no handler for a/b".into()).is_no_handler());
        assert!(!ControlError::Remote("NotFound: session not found: x".into()).is_no_handler());
        assert!(!ControlError::ConnectionLost.is_no_handler());
    }
}
