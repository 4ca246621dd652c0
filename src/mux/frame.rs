//! Multiplexer wire framing.
//!
//! Every frame is a fixed 7-byte header followed by the payload:
//! `u32_be stream_id | u8 type | u16_be length | length bytes`.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 7;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),
    #[error("payload of {got} bytes is invalid for {opcode:?}")]
    BadPayload { opcode: OpCode, got: usize },
    #[error("payload longer than {MAX_PAYLOAD} bytes")]
    PayloadTooLong,
}

/// Frame types.
///
/// `MsgSend` is reserved for control-plane traffic on the signal channel;
/// it never legally appears inside a data multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Open a stream (`SYN`). Payload: initial receive window + link info.
    NewConn = 0,
    /// Accept a stream. Payload: the acceptor's initial receive window.
    ConnSuccess = 1,
    /// Refuse a stream. Payload: a short UTF-8 reason.
    ConnFail = 2,
    Data = 3,
    /// Payload: `u32_be` window credit delta.
    WindowUpdate = 4,
    Ping = 5,
    Pong = 6,
    /// Half-close. Carries no payload.
    Fin = 7,
    Rst = 8,
    MsgSend = 9,
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::NewConn),
            1 => Ok(Self::ConnSuccess),
            2 => Ok(Self::ConnFail),
            3 => Ok(Self::Data),
            4 => Ok(Self::WindowUpdate),
            5 => Ok(Self::Ping),
            6 => Ok(Self::Pong),
            7 => Ok(Self::Fin),
            8 => Ok(Self::Rst),
            9 => Ok(Self::MsgSend),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    NewConn {
        /// The opener's initial receive window.
        rwnd: u32,
        /// Opaque link info handed to the acceptor.
        link: Bytes,
    },
    ConnSuccess {
        rwnd: u32,
    },
    ConnFail {
        reason: Bytes,
    },
    Data(Bytes),
    WindowUpdate {
        delta: u32,
    },
    Ping,
    Pong,
    Fin,
    Rst,
    MsgSend(Bytes),
}

impl Payload {
    /// The wire type of this payload.
    #[must_use]
    pub const fn opcode(&self) -> OpCode {
        match self {
            Self::NewConn { .. } => OpCode::NewConn,
            Self::ConnSuccess { .. } => OpCode::ConnSuccess,
            Self::ConnFail { .. } => OpCode::ConnFail,
            Self::Data(_) => OpCode::Data,
            Self::WindowUpdate { .. } => OpCode::WindowUpdate,
            Self::Ping => OpCode::Ping,
            Self::Pong => OpCode::Pong,
            Self::Fin => OpCode::Fin,
            Self::Rst => OpCode::Rst,
            Self::MsgSend(_) => OpCode::MsgSend,
        }
    }

    fn wire_len(&self) -> usize {
        match self {
            Self::NewConn { link, .. } => 4 + link.len(),
            Self::ConnSuccess { .. } | Self::WindowUpdate { .. } => 4,
            Self::ConnFail { reason } => reason.len(),
            Self::Data(data) | Self::MsgSend(data) => data.len(),
            Self::Ping | Self::Pong | Self::Fin | Self::Rst => 0,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to. Zero for connection-level frames
    /// (`Ping`/`Pong`).
    pub id: u32,
    pub payload: Payload,
}

impl Frame {
    #[must_use]
    pub fn new_syn(id: u32, rwnd: u32, link: Bytes) -> Self {
        Self {
            id,
            payload: Payload::NewConn { rwnd, link },
        }
    }

    #[must_use]
    pub const fn new_conn_success(id: u32, rwnd: u32) -> Self {
        Self {
            id,
            payload: Payload::ConnSuccess { rwnd },
        }
    }

    #[must_use]
    pub fn new_conn_fail(id: u32, reason: &str) -> Self {
        Self {
            id,
            payload: Payload::ConnFail {
                reason: Bytes::copy_from_slice(reason.as_bytes()),
            },
        }
    }

    #[must_use]
    pub const fn new_data(id: u32, data: Bytes) -> Self {
        Self {
            id,
            payload: Payload::Data(data),
        }
    }

    #[must_use]
    pub const fn new_window_update(id: u32, delta: u32) -> Self {
        Self {
            id,
            payload: Payload::WindowUpdate { delta },
        }
    }

    #[must_use]
    pub const fn new_ping() -> Self {
        Self {
            id: 0,
            payload: Payload::Ping,
        }
    }

    #[must_use]
    pub const fn new_pong() -> Self {
        Self {
            id: 0,
            payload: Payload::Pong,
        }
    }

    #[must_use]
    pub const fn new_fin(id: u32) -> Self {
        Self {
            id,
            payload: Payload::Fin,
        }
    }

    #[must_use]
    pub const fn new_rst(id: u32) -> Self {
        Self {
            id,
            payload: Payload::Rst,
        }
    }

    /// Serialize into wire bytes.
    ///
    /// # Panics
    /// Panics if the payload exceeds [`MAX_PAYLOAD`]; callers chunk `Data`
    /// payloads before constructing frames.
    #[must_use]
    pub fn finalize(&self) -> FinalizedFrame {
        let len = self.payload.wire_len();
        assert!(len <= MAX_PAYLOAD, "frame payload too long (this is a bug)");
        let mut buf = BytesMut::with_capacity(HEADER_LEN + len);
        buf.put_u32(self.id);
        buf.put_u8(self.payload.opcode() as u8);
        buf.put_u16(len as u16);
        match &self.payload {
            Payload::NewConn { rwnd, link } => {
                buf.put_u32(*rwnd);
                buf.put_slice(link);
            }
            Payload::ConnSuccess { rwnd } => buf.put_u32(*rwnd),
            Payload::WindowUpdate { delta } => buf.put_u32(*delta),
            Payload::ConnFail { reason } => buf.put_slice(reason),
            Payload::Data(data) | Payload::MsgSend(data) => buf.put_slice(data),
            Payload::Ping | Payload::Pong | Payload::Fin | Payload::Rst => {}
        }
        FinalizedFrame(buf.freeze())
    }

    /// Reassemble a frame from a parsed header and its payload bytes.
    pub fn parse(id: u32, opcode: u8, mut payload: Bytes) -> Result<Self, FrameError> {
        let opcode = OpCode::try_from(opcode)?;
        let got = payload.len();
        let payload = match opcode {
            OpCode::NewConn => {
                if got < 4 {
                    return Err(FrameError::BadPayload { opcode, got });
                }
                let rwnd = payload.get_u32();
                Payload::NewConn {
                    rwnd,
                    link: payload,
                }
            }
            OpCode::ConnSuccess => {
                if got != 4 {
                    return Err(FrameError::BadPayload { opcode, got });
                }
                Payload::ConnSuccess {
                    rwnd: payload.get_u32(),
                }
            }
            OpCode::WindowUpdate => {
                if got != 4 {
                    return Err(FrameError::BadPayload { opcode, got });
                }
                Payload::WindowUpdate {
                    delta: payload.get_u32(),
                }
            }
            OpCode::ConnFail => Payload::ConnFail { reason: payload },
            OpCode::Data => Payload::Data(payload),
            OpCode::MsgSend => Payload::MsgSend(payload),
            OpCode::Ping | OpCode::Pong | OpCode::Fin | OpCode::Rst => {
                if got != 0 {
                    return Err(FrameError::BadPayload { opcode, got });
                }
                match opcode {
                    OpCode::Ping => Payload::Ping,
                    OpCode::Pong => Payload::Pong,
                    OpCode::Fin => Payload::Fin,
                    OpCode::Rst => Payload::Rst,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Self { id, payload })
    }
}

/// A frame serialized for the writer task. An empty `FinalizedFrame` is a
/// flush marker: the writer flushes the sink instead of writing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedFrame(Bytes);

impl FinalizedFrame {
    /// The flush marker.
    #[must_use]
    pub const fn flush() -> Self {
        Self(Bytes::new())
    }

    #[must_use]
    pub fn is_flush(&self) -> bool {
        self.0.is_empty()
    }

    /// Frame type, if this is not the flush marker.
    #[must_use]
    pub fn opcode(&self) -> Option<OpCode> {
        self.0.get(4).copied().and_then(|b| OpCode::try_from(b).ok())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<FinalizedFrame> for Bytes {
    fn from(frame: FinalizedFrame) -> Self {
        frame.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let wire = frame.finalize();
        let bytes = wire.as_bytes();
        let id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let opcode = bytes[4];
        let len = u16::from_be_bytes(bytes[5..7].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - HEADER_LEN);
        let parsed = Frame::parse(id, opcode, Bytes::copy_from_slice(&bytes[HEADER_LEN..])).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn frame_roundtrip_all_types() {
        roundtrip(Frame::new_syn(1, 4096, Bytes::from_static(b"{\"host\":\"a\"}")));
        roundtrip(Frame::new_conn_success(2, 65536));
        roundtrip(Frame::new_conn_fail(3, "dial failed"));
        roundtrip(Frame::new_data(4, Bytes::from_static(b"hello")));
        roundtrip(Frame::new_data(5, Bytes::from(vec![0xaa; MAX_PAYLOAD])));
        roundtrip(Frame::new_window_update(6, 1 << 20));
        roundtrip(Frame::new_ping());
        roundtrip(Frame::new_pong());
        roundtrip(Frame::new_fin(7));
        roundtrip(Frame::new_rst(8));
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(matches!(
            Frame::parse(1, 0xff, Bytes::new()),
            Err(FrameError::UnknownType(0xff))
        ));
    }

    #[test]
    fn rejects_payload_on_bare_frames() {
        assert!(matches!(
            Frame::parse(1, OpCode::Fin as u8, Bytes::from_static(b"x")),
            Err(FrameError::BadPayload { .. })
        ));
    }

    #[test]
    fn flush_marker_is_empty() {
        assert!(FinalizedFrame::flush().is_flush());
        assert!(!Frame::new_ping().finalize().is_flush());
    }
}
