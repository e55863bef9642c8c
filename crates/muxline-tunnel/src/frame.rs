//! Wire format
//!
//! Every frame starts with a 12-byte big-endian header:
//!
//! ```text
//!  0        1        2                 4                                 8                                12
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! |version |  type  |      flags      |             stream id             |              length               |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! Only Data frames carry a payload (`length` bytes). WindowUpdate, Ping and
//! GoAway carry their scalar (delta, ping value, code) in `length` itself.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

pub const HEADER_SIZE: usize = 12;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        match v {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u16 {
        /// Opens a stream
        const SYN = 0x01;
        /// Acknowledges an open, or answers a ping
        const ACK = 0x02;
        /// Half-closes the sender's side
        const FIN = 0x04;
        /// Resets the stream
        const RST = 0x08;
    }
}

/// Reason carried by a GoAway frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GoAwayCode {
    Normal = 0,
    ProtocolError = 1,
    InternalError = 2,
}

impl GoAwayCode {
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(GoAwayCode::Normal),
            1 => Some(GoAwayCode::ProtocolError),
            2 => Some(GoAwayCode::InternalError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("truncated header ({0} of 12 bytes)")]
    Truncated(usize),

    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    #[inline]
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    #[inline]
    pub fn data(flags: Flags, stream_id: u32, len: u32) -> Self {
        Self::new(FrameType::Data, flags, stream_id, len)
    }

    #[inline]
    pub fn window_update(flags: Flags, stream_id: u32, delta: u32) -> Self {
        Self::new(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    #[inline]
    pub fn ping(flags: Flags, value: u32) -> Self {
        Self::new(FrameType::Ping, flags, 0, value)
    }

    #[inline]
    pub fn go_away(code: GoAwayCode) -> Self {
        Self::new(FrameType::GoAway, Flags::empty(), 0, code.code())
    }

    /// Payload bytes following the header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        match self.frame_type {
            FrameType::Data => self.length as usize,
            _ => 0,
        }
    }

    /// Header plus payload.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.frame_type as u8;
        out[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Decode the header at the start of `buf`. Unknown flag bits are kept.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(buf.len()));
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(FrameError::Version(buf[0]));
        }
        let frame_type = FrameType::try_from(buf[1])?;
        Ok(Self {
            version: buf[0],
            frame_type,
            flags: Flags::from_bits_retain(u16::from_be_bytes([buf[2], buf[3]])),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Decode and enforce the payload limit.
    pub fn decode_checked(buf: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        let h = Self::decode(buf)?;
        if h.payload_len() > max_payload {
            return Err(FrameError::TooLarge {
                len: h.payload_len(),
                max: max_payload,
            });
        }
        Ok(h)
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(stream={}, flags={:?}, len={})",
            self.frame_type, self.stream_id, self.flags, self.length
        )
    }
}

/// Append one complete frame to `out`.
pub fn encode_frame(header: &Header, payload: &[u8], out: &mut Vec<u8>) {
    debug_assert_eq!(header.payload_len(), payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
}
