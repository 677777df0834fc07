//! Payload field encoding.
//!
//! Integers are big-endian. `cstr` fields are NUL-terminated UTF-8;
//! `bytes` fields carry a 2-byte big-endian length prefix; optional fields
//! lead with a one-byte presence flag.

use bytes::{Buf, BufMut, BytesMut};
use keystone_types::Oid;

use crate::error::{ProtocolError, ProtocolResult};

/// Sequential reader over one frame's payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &'static str) -> ProtocolResult<()> {
        if self.buf.remaining() < n {
            return Err(ProtocolError::Truncated(what));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> ProtocolResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::InvalidFlag(other)),
        }
    }

    pub fn read_u16(&mut self) -> ProtocolResult<u16> {
        self.need(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> ProtocolResult<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn read_oid(&mut self) -> ProtocolResult<Oid> {
        self.read_u64().map(Oid::new)
    }

    pub fn read_cstr(&mut self) -> ProtocolResult<String> {
        let end = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::UnterminatedString)?;
        let s = std::str::from_utf8(&self.buf[..end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        self.buf.advance(end + 1);
        Ok(s)
    }

    pub fn read_bytes(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = usize::from(self.read_u16()?);
        self.need(len, "bytes")?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    /// A `bytes` field where length 0 stands for "none".
    pub fn read_nullable_str(&mut self) -> ProtocolResult<Option<String>> {
        let bytes = self.read_bytes()?;
        if bytes.is_empty() {
            return Ok(None);
        }
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_opt_bytes(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        if self.read_bool()? {
            self.read_bytes().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read_opt_oid(&mut self) -> ProtocolResult<Option<Oid>> {
        if self.read_bool()? {
            self.read_oid().map(Some)
        } else {
            Ok(None)
        }
    }
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn put_oid(buf: &mut BytesMut, oid: Oid) {
    buf.put_u64(oid.value());
}

pub fn put_cstr(buf: &mut BytesMut, s: &str) -> ProtocolResult<()> {
    if s.as_bytes().contains(&0) {
        return Err(ProtocolError::EmbeddedNul);
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> ProtocolResult<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::MessageTooLarge {
        size: bytes.len(),
        max: usize::from(u16::MAX),
    })?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Write `s` as a `bytes` field, or an empty one for `None`.
pub fn put_nullable_str(buf: &mut BytesMut, s: Option<&str>) -> ProtocolResult<()> {
    put_bytes(buf, s.map(str::as_bytes).unwrap_or_default())
}

pub fn put_opt_bytes(buf: &mut BytesMut, bytes: Option<&[u8]>) -> ProtocolResult<()> {
    match bytes {
        Some(bytes) => {
            put_bool(buf, true);
            put_bytes(buf, bytes)
        }
        None => {
            put_bool(buf, false);
            Ok(())
        }
    }
}

pub fn put_opt_oid(buf: &mut BytesMut, oid: Option<Oid>) {
    match oid {
        Some(oid) => {
            put_bool(buf, true);
            put_oid(buf, oid);
        }
        None => put_bool(buf, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_roundtrip_and_sequencing() {
        let mut buf = BytesMut::new();
        put_cstr(&mut buf, "mazewar").unwrap();
        put_cstr(&mut buf, "").unwrap();
        put_oid(&mut buf, Oid::new(42));

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.read_cstr().unwrap(), "mazewar");
        assert_eq!(reader.read_cstr().unwrap(), "");
        assert_eq!(reader.read_oid().unwrap(), Oid::new(42));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let mut reader = WireReader::new(b"abc");
        assert!(matches!(reader.read_cstr(), Err(ProtocolError::UnterminatedString)));
    }

    #[test]
    fn embedded_nul_cannot_be_written() {
        let mut buf = BytesMut::new();
        assert!(matches!(put_cstr(&mut buf, "a\0b"), Err(ProtocolError::EmbeddedNul)));
    }

    #[test]
    fn truncated_bytes_field_is_rejected() {
        let mut reader = WireReader::new(&[0x00, 0x05, 1, 2]);
        assert!(matches!(reader.read_bytes(), Err(ProtocolError::Truncated("bytes"))));
    }

    #[test]
    fn bytes_field_has_be_length_prefix() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, &[9, 8, 7]).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x03, 9, 8, 7]);
    }

    #[test]
    fn oversized_bytes_field_is_rejected() {
        let mut buf = BytesMut::new();
        let big = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            put_bytes(&mut buf, &big),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn nullable_and_optional_fields() {
        let mut buf = BytesMut::new();
        put_nullable_str(&mut buf, None).unwrap();
        put_nullable_str(&mut buf, Some("key")).unwrap();
        put_opt_bytes(&mut buf, None).unwrap();
        put_opt_oid(&mut buf, Some(Oid::new(7)));

        let mut reader = WireReader::new(&buf);
        assert_eq!(reader.read_nullable_str().unwrap(), None);
        assert_eq!(reader.read_nullable_str().unwrap().as_deref(), Some("key"));
        assert_eq!(reader.read_opt_bytes().unwrap(), None);
        assert_eq!(reader.read_opt_oid().unwrap(), Some(Oid::new(7)));
    }

    #[test]
    fn bad_presence_flag() {
        let mut reader = WireReader::new(&[2]);
        assert!(matches!(reader.read_opt_bytes(), Err(ProtocolError::InvalidFlag(2))));
    }
}
