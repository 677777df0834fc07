use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Length prefix plus opcode.
pub const HEADER_LEN: usize = 3;

/// Largest payload a frame can declare.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

fn declared_len(buf: &[u8]) -> usize {
    usize::from(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Whether `buf` starts with a complete frame.
pub fn can_dispatch(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf.len() >= declared_len(buf) + HEADER_LEN
}

/// Split the next complete frame off the front of `buf`.
pub fn next_frame(buf: &mut BytesMut) -> Option<Frame> {
    if !can_dispatch(buf) {
        return None;
    }
    let len = declared_len(buf);
    let mut frame = buf.split_to(len + HEADER_LEN);
    frame.advance(2);
    let opcode = frame.get_u8();
    Some(Frame {
        opcode,
        payload: frame.freeze(),
    })
}

/// Hand every complete frame at the front of `buf` to `handler`, in order.
///
/// Returns the number of bytes consumed; a trailing partial frame is left for
/// the caller to keep buffering.
pub fn dispatch(buf: &[u8], mut handler: impl FnMut(Frame)) -> usize {
    let mut offset = 0;
    while can_dispatch(&buf[offset..]) {
        let rest = &buf[offset..];
        let len = declared_len(rest);
        handler(Frame {
            opcode: rest[2],
            payload: Bytes::copy_from_slice(&rest[HEADER_LEN..HEADER_LEN + len]),
        });
        offset += len + HEADER_LEN;
    }
    offset
}

/// Build a frame: write a placeholder header, let `write` append the payload,
/// then patch in the real length.
pub fn encode_frame(
    opcode: u8,
    write: impl FnOnce(&mut BytesMut) -> ProtocolResult<()>,
) -> ProtocolResult<BytesMut> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(&[0, 0, opcode]);
    write(&mut buf)?;
    let len = buf.len() - HEADER_LEN;
    let declared = u16::try_from(len).map_err(|_| ProtocolError::MessageTooLarge {
        size: len,
        max: MAX_PAYLOAD,
    })?;
    buf[..2].copy_from_slice(&declared.to_be_bytes());
    Ok(buf)
}
