//! Bounds-checked byte reader
//!
//! Every read checks the remaining length first and fails with
//! `DatexError::BufferTooShort` without consuming anything, so a caller
//! can rewind to the start of an instruction and retry once more bytes
//! have arrived.

use datex_core::{DatexError, DatexResult, PointerId, POINTER_ID_SIZE};

/// Cursor over a borrowed buffer
#[derive(Clone, Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        ByteReader { buf, pos }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread tail of the buffer
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    #[inline]
    fn need(&self, n: usize) -> DatexResult<()> {
        if self.remaining() < n {
            return Err(DatexError::BufferTooShort {
                expected: self.pos + n,
                actual: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn peek(&self) -> DatexResult<u8> {
        self.need(1)?;
        Ok(self.buf[self.pos])
    }

    pub fn bytes(&mut self, n: usize) -> DatexResult<&'a [u8]> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> DatexResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> DatexResult<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> DatexResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn i8(&mut self) -> DatexResult<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> DatexResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> DatexResult<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> DatexResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> DatexResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> DatexResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> DatexResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> DatexResult<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// UTF-8 text of a known length
    pub fn text(&mut self, len: usize) -> DatexResult<String> {
        let start = self.pos;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| {
            DatexError::Syntax(format!("invalid utf-8 at byte {}", start))
        })
    }

    /// `u8 len + utf8`
    pub fn short_text(&mut self) -> DatexResult<String> {
        let start = self.pos;
        let len = self.u8()? as usize;
        let out = self.text(len);
        if out.is_err() {
            self.pos = start;
        }
        out
    }

    /// `u32 len + utf8`
    pub fn long_text(&mut self) -> DatexResult<String> {
        let start = self.pos;
        let len = self.u32()? as usize;
        let out = self.text(len);
        if out.is_err() {
            self.pos = start;
        }
        out
    }

    pub fn pointer_id(&mut self) -> DatexResult<PointerId> {
        Ok(PointerId::from_bytes(self.array::<POINTER_ID_SIZE>()?))
    }
}
