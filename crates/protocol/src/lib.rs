//! # termhub Protocol Library
//!
//! Wire formats shared by the termhub session server and its peers.
//!
//! ## Overview
//!
//! - **Buffer frames**: the binary, sequence-numbered stream a viewer
//!   receives for one session (data, resize and exit frames)
//! - **Control messages**: correlated request/response/notification records
//!   exchanged with the host supervisor over the local control socket
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{BufferFrame, FrameCodec, ControlCodec, ControlMessage};
//! use protocol::messages::{action, category};
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&BufferFrame::data(1, &b"hello\r\n"[..])).unwrap();
//! let (frame, _) = codec.decode(&bytes).unwrap();
//! assert_eq!(frame.sequence, 1);
//!
//! let request = ControlMessage::request(
//!     category::SYSTEM,
//!     action::PING,
//!     serde_json::Value::Null,
//! );
//! let wire = ControlCodec::new().encode(&request).unwrap();
//! assert!(wire.len() > 4);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: buffer stream frame codec
//! - [`messages`]: control-socket messages and codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    BufferFrame, FrameCodec, FrameKind, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD, UNKNOWN_EXIT_CODE,
};
pub use messages::{
    ControlCodec, ControlMessage, Decoded, MessageKind, LENGTH_PREFIX_SIZE,
    MAX_CONTROL_MESSAGE_SIZE,
};
