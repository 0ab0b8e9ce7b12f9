//! Bounds-checked little-endian reader over an event body

use crate::error::DecodeError;

pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            context,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated(self.context));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Unsigned little-endian integer of `n` (<= 8) bytes.
    pub fn uint_le(&mut self, n: usize) -> Result<u64, DecodeError> {
        let bytes = self.take(n)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Unsigned big-endian integer of `n` (<= 8) bytes.
    pub fn uint_be(&mut self, n: usize) -> Result<u64, DecodeError> {
        let bytes = self.take(n)?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    pub fn u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(self.uint_le(2)? as u16)
    }

    pub fn u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(self.uint_le(4)? as u32)
    }

    pub fn u64_le(&mut self) -> Result<u64, DecodeError> {
        self.uint_le(8)
    }

    pub fn f32_le(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.u32_le()?))
    }

    pub fn f64_le(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.u64_le()?))
    }

    /// Length-encoded integer. `0xFB` (NULL) is rejected.
    pub fn packed_int(&mut self) -> Result<u64, DecodeError> {
        match self.u8()? {
            first @ 0..=250 => Ok(u64::from(first)),
            252 => self.uint_le(2),
            253 => self.uint_le(3),
            254 => self.uint_le(8),
            other => Err(DecodeError::malformed(format!(
                "invalid packed integer prefix {:#04x} in {}",
                other, self.context
            ))),
        }
    }

    /// One-byte length prefix, bytes, NUL terminator.
    pub fn short_name(&mut self) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        self.skip(1)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

pub(crate) fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    let bit_idx = idx % 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] & (1 << bit_idx)) != 0
}
