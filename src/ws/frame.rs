//! WebSocket frames as delivered by, and handed to, the transport.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continues a fragmented message.
    Continuation,
    /// First (or only) frame of a UTF-8 text message.
    Text,
    /// First (or only) frame of a binary message.
    Binary,
    /// Close handshake.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
}

impl OpCode {
    /// Returns `true` for close, ping and pong.
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// The wire value of this opcode.
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::Protocol(format!("reserved opcode {other:#x}"))),
        }
    }
}

/// Standard close status codes.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The endpoint is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present in the close frame.
    pub const NO_STATUS: u16 = 1005;
    /// The connection closed without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// Message data was inconsistent with its type.
    pub const INVALID_DATA: u16 = 1007;
    /// A message was too big to process.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// A single WebSocket frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// The three reserved bits, `RSV1` in the highest position.
    pub rsv: u8,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("fin", &self.fin)
            .field("rsv", &self.rsv)
            .field("opcode", &self.opcode)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl Frame {
    /// Create a frame.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            payload: payload.into(),
        }
    }

    /// A complete text message in one frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()), true)
    }

    /// A complete binary message in one frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// A continuation fragment.
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data, fin)
    }

    /// A ping.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// A pong.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// A close frame with a status code and reason.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Decode the status code and reason of a close frame.
    ///
    /// An empty payload means no status was sent.
    pub fn close_reason(&self) -> Result<(u16, String), Error> {
        match self.payload.len() {
            0 => Ok((close_code::NO_STATUS, String::new())),
            1 => Err(Error::Protocol("close frame with a one byte payload".into())),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                let reason = std::str::from_utf8(&self.payload[2..])
                    .map_err(|_| Error::Protocol("close reason is not valid UTF-8".into()))?;
                Ok((code, reason.to_owned()))
            }
        }
    }
}
