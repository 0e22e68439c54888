//! Length-prefixed byte streams used for all engine serialization:
//! shard-to-shard transport, registration persistence, and operator
//! argument payloads.
//!
//! All integers are variable-length with a continuation bit. Strings are
//! `<length><bytes>` with no terminator. Doubles are fixed 8-byte
//! little-endian IEEE-754 so that round-trips are lossless.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer at offset {0}")]
    UnexpectedEof(usize),
    #[error("varint exceeds 64 bits at offset {0}")]
    VarintOverflow(usize),
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Growable byte buffer backing a [`BufferWriter`].
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    bytes: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Freeze into an immutable, cheaply-cloneable byte string.
    pub fn into_bytes(self) -> Bytes {
        self.bytes.freeze()
    }

    pub fn writer(&mut self) -> BufferWriter<'_> {
        BufferWriter { buf: self }
    }

    pub fn reader(&self) -> BufferReader<'_> {
        BufferReader {
            data: &self.bytes,
            pos: 0,
        }
    }
}

/// Appends varint-framed values to a [`Buffer`].
pub struct BufferWriter<'a> {
    buf: &'a mut Buffer,
}

impl<'a> BufferWriter<'a> {
    pub fn write_varu64(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.bytes.put_u8(byte);
                return;
            }
            self.buf.bytes.put_u8(byte | 0x80);
        }
    }

    /// Signed integers are zigzag-mapped so small negatives stay small.
    pub fn write_vari64(&mut self, v: i64) {
        self.write_varu64(((v << 1) ^ (v >> 63)) as u64);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.bytes.put_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_varu64(v.len() as u64);
        self.buf.bytes.put_slice(v);
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_bytes(v.as_bytes());
    }

    /// Append pre-framed bytes verbatim (no length prefix).
    pub fn write_raw(&mut self, v: &[u8]) {
        self.buf.bytes.put_slice(v);
    }
}

/// Consuming cursor over a serialized byte stream.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn read_varu64(&mut self) -> Result<u64, Error> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(Error::UnexpectedEof(self.pos))?;
            self.pos += 1;

            if shift == 63 && byte > 1 {
                return Err(Error::VarintOverflow(start));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::VarintOverflow(start));
            }
        }
    }

    pub fn read_vari64(&mut self) -> Result<i64, Error> {
        let v = self.read_varu64()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    pub fn read_f64(&mut self) -> Result<f64, Error> {
        let raw = self.read_exact(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        Ok(f64::from_le_bytes(le))
    }

    /// Borrow a length-prefixed byte string from the underlying stream.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_varu64()? as usize;
        self.read_exact(len)
    }

    pub fn read_str(&mut self) -> Result<&'a str, Error> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| Error::InvalidUtf8)
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < len {
            return Err(Error::UnexpectedEof(self.pos));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn varint_boundaries() {
        let mut buf = Buffer::new();
        let mut w = buf.writer();
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::MAX] {
            w.write_varu64(v);
        }
        // 127 fits one byte, 128 needs two.
        assert_eq!(buf.as_slice()[..4], [0, 1, 127, 0x80]);

        let mut r = buf.reader();
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::MAX] {
            assert_eq!(r.read_varu64().unwrap(), v);
        }
        assert!(r.is_exhausted());
    }

    #[test]
    fn signed_varints_round_trip() {
        let mut buf = Buffer::new();
        let mut w = buf.writer();
        for v in [0i64, -1, 1, i64::MIN, i64::MAX, -300] {
            w.write_vari64(v);
        }
        let mut r = buf.reader();
        for v in [0i64, -1, 1, i64::MIN, i64::MAX, -300] {
            assert_eq!(r.read_vari64().unwrap(), v);
        }
    }

    #[test]
    fn strings_carry_explicit_lengths() {
        let mut buf = Buffer::new();
        let mut w = buf.writer();
        w.write_str("");
        w.write_bytes(b"hello\x00world");
        w.write_str("done");

        let mut r = buf.reader();
        assert_eq!(r.read_str().unwrap(), "");
        assert_eq!(r.read_bytes().unwrap(), b"hello\x00world");
        assert_eq!(r.read_str().unwrap(), "done");
    }

    #[test]
    fn short_reads_error_without_panicking() {
        let mut buf = Buffer::new();
        buf.writer().write_varu64(1000);
        let partial = &buf.as_slice()[..1];
        assert_eq!(
            BufferReader::new(partial).read_varu64(),
            Err(Error::UnexpectedEof(1))
        );
        assert_eq!(
            BufferReader::new(&[]).read_f64(),
            Err(Error::UnexpectedEof(0))
        );
        let mut r = BufferReader::new(&[5, b'a', b'b']);
        assert_eq!(r.read_bytes(), Err(Error::UnexpectedEof(1)));
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let mut r = BufferReader::new(&[0xff; 10]);
        assert_eq!(r.read_varu64(), Err(Error::VarintOverflow(0)));
    }

    #[quickcheck]
    fn qc_mixed_round_trip(u: u64, i: i64, f: f64, s: String, b: Vec<u8>) -> bool {
        let mut buf = Buffer::new();
        let mut w = buf.writer();
        w.write_varu64(u);
        w.write_vari64(i);
        w.write_f64(f);
        w.write_str(&s);
        w.write_bytes(&b);

        let mut r = buf.reader();
        r.read_varu64().unwrap() == u
            && r.read_vari64().unwrap() == i
            && r.read_f64().unwrap().to_bits() == f.to_bits()
            && r.read_str().unwrap() == s
            && r.read_bytes().unwrap() == b.as_slice()
            && r.is_exhausted()
    }
}
