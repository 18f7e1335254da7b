//! WebSocket frame codec
//!
//! Wire layout: FIN + opcode byte, mask flag + 7-bit length, 0/2/8 bytes of
//! extended length, optional 4-byte mask, payload XORed with the mask.
//! Decoding never consumes a partial frame: `Ok(None)` means "need more".

use bytes::{BufMut, BytesMut};
use std::fmt;
use thiserror::Error;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

/// Control frames carry at most this much payload
pub const MAX_CONTROL_PAYLOAD_LEN: usize = 125;

/// Normal closure status code
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown WebSocket opcode: {0:#x}")]
    UnknownOpcode(u8),

    #[error("Reserved bits set in frame header: {0:#04x}")]
    ReservedBits(u8),

    #[error("Frame payload too large: {0} bytes")]
    Oversized(u64),

    #[error("Control frame payload too large: {0} bytes")]
    ControlTooLarge(usize),
}

pub type FrameResult<T> = Result<T, FrameError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> FrameResult<Self> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// One decoded frame; the payload is always unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(OpCode::Text, text.as_bytes())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Binary, bytes)
    }

    pub fn close(code: Option<u16>, reason: &str) -> Self {
        Self::new(OpCode::Close, close_payload(code, reason))
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Pong, payload)
    }
}

/// Serialize a frame, masking the payload when a key is given
pub fn encode(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = BytesMut::with_capacity(len + 14);

    let fin_bit = if frame.fin { 0x80 } else { 0x00 };
    out.put_u8(fin_bit | frame.opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        out.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(mask_bit | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(mask_bit | 127);
        out.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            out.put_slice(&key);
            out.extend(
                frame
                    .payload
                    .iter()
                    .enumerate()
                    .map(|(i, byte)| byte ^ key[i % 4]),
            );
        }
        None => out.put_slice(&frame.payload),
    }
    out.to_vec()
}

/// Decode the first frame in `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> FrameResult<Option<(Frame, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[0];
    let second = buf[1];

    if first & 0x70 != 0 {
        return Err(FrameError::ReservedBits(first & 0x70));
    }
    let fin = first & 0x80 != 0;
    let opcode = OpCode::from_u8(first & 0x0F)?;
    let masked = second & 0x80 != 0;

    let (len, mut offset) = match second & 0x7F {
        126 => {
            let Some(ext) = buf.get(2..4) else {
                return Ok(None);
            };
            (u64::from(u16::from_be_bytes([ext[0], ext[1]])), 4)
        }
        127 => {
            let Some(ext) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut raw = [0u8; 8];
            raw.copy_from_slice(ext);
            (u64::from_be_bytes(raw), 10)
        }
        short => (u64::from(short), 2),
    };

    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::Oversized(len));
    }
    let len = len as usize;
    if opcode.is_control() && len > MAX_CONTROL_PAYLOAD_LEN {
        return Err(FrameError::ControlTooLarge(len));
    }

    let mask = if masked {
        let Some(key) = buf.get(offset..offset + 4) else {
            return Ok(None);
        };
        offset += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    let Some(raw) = buf.get(offset..offset + len) else {
        return Ok(None);
    };
    let payload = match mask {
        Some(key) => raw
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % 4])
            .collect(),
        None => raw.to_vec(),
    };

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        offset + len,
    )))
}

/// Close frame body: 2-byte status code followed by a UTF-8 reason
pub fn close_payload(code: Option<u16>, reason: &str) -> Vec<u8> {
    let Some(code) = code else {
        return Vec::new();
    };
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    match payload {
        [high, low, reason @ ..] => (
            Some(u16::from_be_bytes([*high, *low])),
            String::from_utf8_lossy(reason).into_owned(),
        ),
        _ => (None, String::new()),
    }
}
