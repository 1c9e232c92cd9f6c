//! Little-endian read cursor shared by the engine's binary formats.

use crate::error::{EngineError, EngineResult};

pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize) -> EngineResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(EngineError::Corrupt(format!(
                "unexpected end of data: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> EngineResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> EngineResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> EngineResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> EngineResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> EngineResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> EngineResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub(crate) fn f64(&mut self) -> EngineResult<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub(crate) fn magic(&mut self) -> EngineResult<[u8; 4]> {
        self.array()
    }

    /// Reads a `u16` length-prefixed UTF-8 string.
    pub(crate) fn string(&mut self) -> EngineResult<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| EngineError::Corrupt(format!("invalid UTF-8 string: {}", e)))
    }
}

/// Appends a `u16` length-prefixed string.
pub(crate) fn put_string(buf: &mut Vec<u8>, s: &str) -> EngineResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| EngineError::Corrupt(format!("string of {} bytes is too long", s.len())))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}
