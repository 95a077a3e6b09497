//! Byte stream.
//!
//! A read/write cursor over a growable byte buffer. Writes append, reads
//! consume from the front. Primitives are copied at fixed width in native
//! byte order: master and slaves are assumed to share an architecture.
//!
//! Layouts:
//! - strings and blobs: `u32` length, then raw bytes (no terminator)
//! - sequences: `u32` count, then each element

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};

/// Growable byte buffer with typed read/write helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteStream {
    buf: BytesMut,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Wraps existing bytes for reading.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
        }
    }

    /// Bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Freezes the unread contents.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn ensure(&self, needed: usize) -> ProtocolResult<()> {
        if self.buf.len() < needed {
            return Err(ProtocolError::ShortBuffer {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Appends raw bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Consumes `n` bytes from the front.
    pub fn read(&mut self, n: usize) -> ProtocolResult<Bytes> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n).freeze())
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn read_bool(&mut self) -> ProtocolResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16_ne(v);
    }

    pub fn read_u16(&mut self) -> ProtocolResult<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_ne())
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32_ne(v);
    }

    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_ne())
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_ne(v);
    }

    pub fn read_i32(&mut self) -> ProtocolResult<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_ne())
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.put_u64_ne(v);
    }

    pub fn read_u64(&mut self) -> ProtocolResult<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_ne())
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_ne(v);
    }

    pub fn read_i64(&mut self) -> ProtocolResult<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_ne())
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.put_f32_ne(v);
    }

    pub fn read_f32(&mut self) -> ProtocolResult<f32> {
        self.ensure(4)?;
        Ok(self.buf.get_f32_ne())
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.put_f64_ne(v);
    }

    pub fn read_f64(&mut self) -> ProtocolResult<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64_ne())
    }

    /// Writes a length-prefixed blob.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write(bytes);
    }

    /// Reads a length-prefixed blob.
    pub fn read_blob(&mut self) -> ProtocolResult<Bytes> {
        let len = self.read_u32()? as usize;
        self.read(len)
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_blob(s.as_bytes());
    }

    pub fn read_string(&mut self) -> ProtocolResult<String> {
        let raw = self.read_blob()?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString)
    }

    /// Writes `(count, element…)` using `write_one` for each element.
    pub fn write_seq<T>(&mut self, items: &[T], mut write_one: impl FnMut(&mut Self, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            write_one(self, item);
        }
    }

    /// Reads `(count, element…)` using `read_one` for each element.
    pub fn read_seq<T>(
        &mut self,
        mut read_one: impl FnMut(&mut Self) -> ProtocolResult<T>,
    ) -> ProtocolResult<Vec<T>> {
        let count = self.read_u32()? as usize;
        // A bogus count must not turn into a huge allocation.
        let mut out = Vec::with_capacity(count.min(self.len()));
        for _ in 0..count {
            out.push(read_one(self)?);
        }
        Ok(out)
    }
}
