//! Byte-slice codec for packet bodies.
//!
//! [`WireReader`] walks a body with an explicit offset and fails with
//! [`WireError::Truncated`] instead of reading past the end. Strings carry a
//! 2-byte little-endian length prefix.

use crate::errors::{WireError, WireResult};
use bytes::{Buf, BufMut, BytesMut};

/// Cursor over a received body.
pub struct WireReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    fn take(&mut self, needed: usize, what: &'static str) -> WireResult<&'a [u8]> {
        if needed > self.remaining() {
            return Err(WireError::Truncated {
                what,
                offset: self.offset,
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    pub fn read_u16(&mut self, what: &'static str) -> WireResult<u16> {
        let mut bytes = self.take(2, what)?;
        Ok(bytes.get_u16_le())
    }

    pub fn read_u32(&mut self, what: &'static str) -> WireResult<u32> {
        let mut bytes = self.take(4, what)?;
        Ok(bytes.get_u32_le())
    }

    pub fn read_u64(&mut self, what: &'static str) -> WireResult<u64> {
        let mut bytes = self.take(8, what)?;
        Ok(bytes.get_u64_le())
    }

    /// A u16 length followed by that many UTF-8 bytes.
    pub fn read_string(&mut self, what: &'static str) -> WireResult<String> {
        let len = self.read_u16(what)? as usize;
        self.read_fixed_string(len, what)
    }

    pub fn read_fixed_string(&mut self, len: usize, what: &'static str) -> WireResult<String> {
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| WireError::invalid(what, e.to_string()))
    }
}

/// Body builder.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// Write a length-prefixed string. Fails if it does not fit a u16 length.
    pub fn put_string(&mut self, value: &str, what: &'static str) -> WireResult<()> {
        let len = u16::try_from(value.len()).map_err(|_| WireError::TooLong {
            what,
            len: value.len(),
            max: u16::MAX as usize,
        })?;
        self.buf.put_u16_le(len);
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    /// Write exactly `len` bytes of `value`.
    pub fn put_fixed_string(&mut self, value: &str, len: usize, what: &'static str) -> WireResult<()> {
        if value.len() != len {
            return Err(WireError::invalid(
                what,
                format!("expected {} bytes, got {}", len, value.len()),
            ));
        }
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}
