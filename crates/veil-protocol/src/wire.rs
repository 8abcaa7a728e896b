/// Byte-level wire codec.
///
/// All integers are little-endian. Byte strings carry a `u16` length
/// prefix. Reads never run past the end of the input — a short buffer is
/// a `WireError::Truncated`, surfaced to the caller instead of garbage.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("byte string too long for u16 length prefix: {len} bytes")]
    Oversize { len: usize },

    #[error("bad field length: expected {expected}, got {got}")]
    BadLength { expected: usize, got: usize },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("unknown packet type tag {tag}")]
    UnknownTag { tag: u8 },
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append a `u16`-length-prefixed byte string.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), WireError> {
        let len = u16::try_from(data.len()).map_err(|_| WireError::Oversize { len: data.len() })?;
        self.put_u16(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Append a `u16`-length-prefixed UTF-8 string.
    pub fn put_string(&mut self, value: &str) -> Result<(), WireError> {
        self.put_bytes(value.as_bytes())
    }
}

/// Cursor over an input slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read `n` raw bytes with no length prefix.
    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.take(n)
    }

    /// Read a `u16`-length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.get_u16()? as usize;
        self.take(len)
    }

    /// Read a `u16`-length-prefixed byte string of an exact expected size.
    pub fn get_bytes_exact<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let data = self.get_bytes()?;
        let arr: [u8; N] = data.try_into().map_err(|_| WireError::BadLength {
            expected: N,
            got: data.len(),
        })?;
        Ok(arr)
    }

    /// Read a `u16`-length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String, WireError> {
        let data = self.get_bytes()?;
        String::from_utf8(data.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}
