//! Little-endian primitives shared by the command codecs.
//!
//! Every length read from the stream is untrusted. [`WireReader`] checks `len * elem_size` against
//! the bytes actually remaining (with checked arithmetic) before anything is allocated, so a
//! hostile `u32::MAX` length fails with [`DecodeError::LengthOverflow`] instead of reserving memory.

use crate::error::DecodeError;
use crate::handle::ObjectHandle;

#[derive(Debug, Default)]
pub struct WireWriter {
    out: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(out: Vec<u8>) -> Self {
        Self { out }
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.out
    }

    pub fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.out.push(v as u8);
    }

    pub fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn handle(&mut self, h: ObjectHandle) {
        self.u32(h.id);
        self.u32(h.generation);
    }

    pub fn handles(&mut self, hs: &[ObjectHandle]) {
        self.u32(hs.len() as u32);
        for h in hs {
            self.handle(*h);
        }
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.u32(data.len() as u32);
        self.out.extend_from_slice(data);
    }

    pub fn opt_bytes(&mut self, data: Option<&[u8]>) {
        match data {
            Some(data) => {
                self.u8(1);
                self.bytes(data);
            }
            None => self.u8(0),
        }
    }

    pub fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    pub fn opt_str(&mut self, s: Option<&str>) {
        self.opt_bytes(s.map(str::as_bytes));
    }

    pub fn u32_array(&mut self, values: &[u32]) {
        self.u32(values.len() as u32);
        for v in values {
            self.u32(*v);
        }
    }

    pub fn raw(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    /// Overwrite a previously written `u32` at `at`.
    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.out[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

pub struct WireReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.raw(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.raw(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn handle(&mut self) -> Result<ObjectHandle, DecodeError> {
        Ok(ObjectHandle::new(self.u32()?, self.u32()?))
    }

    /// Read a `u32` element count and check that `count * elem_size` bytes are actually present.
    pub fn count(&mut self, elem_size: usize) -> Result<usize, DecodeError> {
        let len = self.u32()?;
        let remaining = self.remaining();
        let total = (len as usize).checked_mul(elem_size);
        match total {
            Some(total) if total <= remaining => Ok(len as usize),
            _ => Err(DecodeError::LengthOverflow {
                len,
                elem_size,
                remaining,
            }),
        }
    }

    pub fn handles(&mut self) -> Result<Vec<ObjectHandle>, DecodeError> {
        let n = self.count(8)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.handle()?);
        }
        Ok(out)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let n = self.count(1)?;
        self.raw(n)
    }

    pub fn opt_bytes(&mut self) -> Result<Option<&'a [u8]>, DecodeError> {
        if self.bool()? {
            Ok(Some(self.bytes()?))
        } else {
            Ok(None)
        }
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.bytes()?;
        core::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn opt_string(&mut self) -> Result<Option<String>, DecodeError> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    pub fn u32_array(&mut self) -> Result<Vec<u32>, DecodeError> {
        let n = self.count(4)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.u32()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostile_array_length_is_rejected_before_allocation() {
        let mut w = WireWriter::new();
        w.u32(u32::MAX);
        w.u32(0);
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(
            r.handles(),
            Err(DecodeError::LengthOverflow {
                len: u32::MAX,
                elem_size: 8,
                remaining: 4
            })
        );
    }

    #[test]
    fn bool_is_strict() {
        let mut r = WireReader::new(&[0, 1, 2]);
        assert_eq!(r.bool(), Ok(false));
        assert_eq!(r.bool(), Ok(true));
        assert_eq!(r.bool(), Err(DecodeError::InvalidBool(2)));
    }

    #[test]
    fn optional_strings_carry_presence() {
        let mut w = WireWriter::new();
        w.opt_str(None);
        w.opt_str(Some("queue"));
        w.opt_str(Some(""));
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.opt_string().unwrap(), None);
        assert_eq!(r.opt_string().unwrap().as_deref(), Some("queue"));
        assert_eq!(r.opt_string().unwrap().as_deref(), Some(""));
        r.finish().unwrap();
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut w = WireWriter::new();
        w.bytes(&[0xff, 0xfe]);
        let bytes = w.into_bytes();
        assert_eq!(
            WireReader::new(&bytes).string(),
            Err(DecodeError::InvalidUtf8)
        );
    }

    #[test]
    fn truncated_scalar_is_eof() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert_eq!(r.u32(), Err(DecodeError::UnexpectedEof));
    }
}
