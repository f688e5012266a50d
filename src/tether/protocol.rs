//! Minecraft-style packet framing: `VarInt(len) + VarInt(packet_id) + body`.
//!
//! Only the pieces needed to answer status/ping queries while no tunnel is
//! available live here. Everything is pure and allocation-light so it can be
//! driven from the sans-IO [`crate::tether::offline`] state machine.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// A VarInt never spans more than 5 bytes (32 bits / 7 bits per byte).
pub const MAX_VARINT_BYTES: usize = 5;

/// Largest frame the game accepts (3-byte VarInt length).
pub const MAX_FRAME_LEN: u32 = (1 << 21) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("need more data")]
    Incomplete,
    #[error("malformed varint")]
    Malformed,
    /// The frame is complete but its contents are unusable; `consumed` bytes
    /// can be skipped to reach the next frame boundary.
    #[error("malformed frame ({consumed} bytes)")]
    MalformedFrame { consumed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub body: Bytes,
}

pub fn write_varint(out: &mut BytesMut, mut value: u32) {
    loop {
        if value & !0x7f == 0 {
            out.put_u8(value as u8);
            return;
        }
        out.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
}

pub fn encode_varint(value: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(MAX_VARINT_BYTES);
    write_varint(&mut out, value);
    out.freeze()
}

/// Decode a VarInt starting at `offset`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_varint(buf: &[u8], offset: usize) -> Result<(u32, usize), CodecError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let Some(&b) = buf.get(offset + i) else {
            return Err(CodecError::Incomplete);
        };
        value |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CodecError::Malformed)
}

pub fn encode_string(s: &str) -> Bytes {
    let b = s.as_bytes();
    let mut out = BytesMut::with_capacity(MAX_VARINT_BYTES + b.len());
    write_varint(&mut out, b.len() as u32);
    out.put_slice(b);
    out.freeze()
}

pub fn encode_packet(id: u32, body: &[u8]) -> Bytes {
    let id_bytes = encode_varint(id);
    let len = id_bytes.len() + body.len();
    let mut out = BytesMut::with_capacity(MAX_VARINT_BYTES + len);
    write_varint(&mut out, len as u32);
    out.put_slice(&id_bytes);
    out.put_slice(body);
    out.freeze()
}

/// Extract one frame from the front of `buf`.
///
/// On success returns the frame and the total number of bytes it occupied,
/// length prefix included.
pub fn decode_packet(buf: &[u8]) -> Result<(Frame, usize), CodecError> {
    let (len, len_n) = decode_varint(buf, 0)?;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::Malformed);
    }

    let total = len_n + len as usize;
    if buf.len() < total {
        return Err(CodecError::Incomplete);
    }

    let payload = &buf[len_n..total];
    let Ok((id, id_n)) = decode_varint(payload, 0) else {
        return Err(CodecError::MalformedFrame { consumed: total });
    };

    Ok((
        Frame {
            id,
            body: Bytes::copy_from_slice(&payload[id_n..]),
        },
        total,
    ))
}
