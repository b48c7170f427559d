//! Binary framing for the per-session buffer stream.
//!
//! # Frame Format
//!
//! Each frame consists of (little-endian):
//! - 1 byte: frame kind (0 = data, 1 = resize, 2 = exit)
//! - 4 bytes: sequence number (u32)
//! - 4 bytes: payload length (u32)
//! - N bytes: payload
//!
//! Payloads by kind:
//! - data: raw terminal bytes
//! - resize: `cols: u16, rows: u16`
//! - exit: `code: i32`, where `-1` means the code is unknown

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Frame header size: 1 (kind) + 4 (sequence) + 4 (length) = 9 bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum payload size (16 MB).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Wire value used for an exit code that could not be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

const RESIZE_PAYLOAD_SIZE: usize = 4;
const EXIT_PAYLOAD_SIZE: usize = 4;

/// The kind of a buffer frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Raw terminal output.
    Data = 0,
    /// Terminal geometry change.
    Resize = 1,
    /// Session exit; always the last frame of a stream.
    Exit = 2,
}

impl FrameKind {
    /// Get the wire byte for this kind.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parse a wire byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Resize),
            2 => Ok(FrameKind::Exit),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }

    /// Lowercase name, used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Data => "data",
            FrameKind::Resize => "resize",
            FrameKind::Exit => "exit",
        }
    }
}

/// One immutable, numbered unit of a session's buffer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferFrame {
    /// What the payload carries.
    pub kind: FrameKind,
    /// Monotonic per-session sequence number.
    pub sequence: u32,
    /// Kind-specific payload.
    pub payload: Bytes,
}

impl BufferFrame {
    /// Create a data frame.
    pub fn data(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            sequence,
            payload: payload.into(),
        }
    }

    /// Create a resize frame.
    pub fn resize(sequence: u32, cols: u16, rows: u16) -> Self {
        let mut payload = BytesMut::with_capacity(RESIZE_PAYLOAD_SIZE);
        payload.put_u16_le(cols);
        payload.put_u16_le(rows);
        Self {
            kind: FrameKind::Resize,
            sequence,
            payload: payload.freeze(),
        }
    }

    /// Create an exit frame. `None` is encoded as [`UNKNOWN_EXIT_CODE`].
    pub fn exit(sequence: u32, code: Option<i32>) -> Self {
        let code = code.unwrap_or(UNKNOWN_EXIT_CODE);
        Self {
            kind: FrameKind::Exit,
            sequence,
            payload: Bytes::copy_from_slice(&code.to_le_bytes()),
        }
    }

    /// Decode the `(cols, rows)` carried by a resize frame.
    pub fn resize_dimensions(&self) -> Result<(u16, u16)> {
        self.expect_payload(FrameKind::Resize, RESIZE_PAYLOAD_SIZE)?;
        let p = &self.payload;
        Ok((
            u16::from_le_bytes([p[0], p[1]]),
            u16::from_le_bytes([p[2], p[3]]),
        ))
    }

    /// Decode the exit code carried by an exit frame; `None` means unknown.
    pub fn exit_code(&self) -> Result<Option<i32>> {
        self.expect_payload(FrameKind::Exit, EXIT_PAYLOAD_SIZE)?;
        let p = &self.payload;
        let code = i32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        Ok((code != UNKNOWN_EXIT_CODE).then_some(code))
    }

    /// Total encoded size of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    fn expect_payload(&self, kind: FrameKind, expected: usize) -> Result<()> {
        if self.kind != kind || self.payload.len() != expected {
            return Err(ProtocolError::InvalidPayload {
                kind: kind.name(),
                expected,
                got: self.payload.len(),
            });
        }
        Ok(())
    }
}

/// Encoder and decoder for buffer frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into a fresh buffer.
    pub fn encode(&self, frame: &BufferFrame) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(frame.encoded_len());
        self.encode_into(frame, &mut out)?;
        Ok(out.freeze())
    }

    /// Append an encoded frame to `out`.
    pub fn encode_into(&self, frame: &BufferFrame, out: &mut BytesMut) -> Result<()> {
        check_payload_len(frame.payload.len())?;
        validate_payload_shape(frame.kind, frame.payload.len())?;

        out.reserve(frame.encoded_len());
        out.put_u8(frame.kind.as_byte());
        out.put_u32_le(frame.sequence);
        out.put_u32_le(frame.payload.len() as u32);
        out.put_slice(&frame.payload);
        Ok(())
    }

    /// Decode a frame from bytes.
    ///
    /// Returns the decoded frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(BufferFrame, usize)> {
        match self.try_decode(data)? {
            Some(decoded) => Ok(decoded),
            None => Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))),
        }
    }

    /// Try to decode a frame from bytes, returning None if there isn't enough data.
    ///
    /// This is useful for streaming scenarios where you may receive partial frames.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(BufferFrame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let kind = FrameKind::from_byte(data[0])?;
        let sequence = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;

        check_payload_len(len)?;
        validate_payload_shape(kind, len)?;

        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Ok(None);
        }

        let frame = BufferFrame {
            kind,
            sequence,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..total]),
        };
        Ok(Some((frame, total)))
    }
}

fn check_payload_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    Ok(())
}

fn validate_payload_shape(kind: FrameKind, len: usize) -> Result<()> {
    let expected = match kind {
        FrameKind::Data => return Ok(()),
        FrameKind::Resize => RESIZE_PAYLOAD_SIZE,
        FrameKind::Exit => EXIT_PAYLOAD_SIZE,
    };
    if len != expected {
        return Err(ProtocolError::InvalidPayload {
            kind: kind.name(),
            expected,
            got: len,
        });
    }
    Ok(())
}
