//! Wire-level primitives shared by every consensus codec: little-endian
//! integers, Bitcoin's compact-size varints and raw hash reads.

use thiserror::Error;

use crate::hash::H256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("input ended before the value was complete")]
    Truncated,
    #[error("malformed encoding: {0}")]
    Malformed(&'static str),
    #[error("varint not encoded in its shortest form")]
    NonCanonicalVarInt,
}

/// A cursor over an input buffer. Every read either consumes exactly the
/// bytes of one value or fails without a partial state the caller could
/// misuse.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Looks at the next byte without consuming it.
    #[must_use]
    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Reads a compact-size integer, rejecting encodings longer than the
    /// value requires.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let first = self.read_u8()?;
        match first {
            0..=0xFC => Ok(u64::from(first)),
            0xFD => {
                let value = u64::from(self.read_u16()?);
                if value < 0xFD {
                    return Err(CodecError::NonCanonicalVarInt);
                }
                Ok(value)
            }
            0xFE => {
                let value = u64::from(self.read_u32()?);
                if value <= u64::from(u16::MAX) {
                    return Err(CodecError::NonCanonicalVarInt);
                }
                Ok(value)
            }
            0xFF => {
                let value = self.read_u64()?;
                if value <= u64::from(u32::MAX) {
                    return Err(CodecError::NonCanonicalVarInt);
                }
                Ok(value)
            }
        }
    }

    /// Reads a varint that counts items still to be parsed. Each item
    /// occupies at least one byte, so any count beyond the remaining input
    /// is truncation; checking here keeps hostile counts from driving
    /// huge allocations.
    pub fn read_count(&mut self) -> Result<usize, CodecError> {
        let count = self.read_varint()?;
        if count > self.remaining() as u64 {
            return Err(CodecError::Truncated);
        }
        Ok(count as usize)
    }

    /// Reads a varint length prefix followed by that many raw bytes.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_varint()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::Truncated);
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Reads 32 raw bytes as a hash in natural order.
    pub fn read_hash(&mut self) -> Result<H256, CodecError> {
        let bytes = self.take(32)?;
        Ok(H256(bytes.try_into().unwrap()))
    }

    /// Fails unless the whole input has been consumed.
    pub fn expect_end(&self) -> Result<(), CodecError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(CodecError::Malformed("trailing bytes after value"))
        }
    }
}

/// Growable output buffer. The writer always emits canonical encodings.
#[derive(Default)]
pub struct ByteWriter {
    out: Vec<u8>,
}

impl ByteWriter {
    #[must_use]
    pub fn new() -> Self {
        ByteWriter::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        ByteWriter {
            out: Vec::with_capacity(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.out
    }

    pub fn write_u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a compact-size integer in its shortest form.
    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xFC => self.write_u8(value as u8),
            0xFD..=0xFFFF => {
                self.write_u8(0xFD);
                self.write_u16(value as u16);
            }
            0x1_0000..=0xFFFF_FFFF => {
                self.write_u8(0xFE);
                self.write_u32(value as u32);
            }
            _ => {
                self.write_u8(0xFF);
                self.write_u64(value);
            }
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_hash(&mut self, hash: &H256) {
        self.out.extend_from_slice(&hash.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_bytes(value: u64) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_varint(value);
        writer.into_vec()
    }

    #[test]
    fn varint_boundaries() {
        assert_eq!(varint_bytes(0), [0x00]);
        assert_eq!(varint_bytes(0xFC), [0xFC]);
        assert_eq!(varint_bytes(0xFD), [0xFD, 0xFD, 0x00]);
        assert_eq!(varint_bytes(0xFFFF), [0xFD, 0xFF, 0xFF]);
        assert_eq!(varint_bytes(0x1_0000), [0xFE, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            varint_bytes(0x1_0000_0000),
            [0xFF, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x1_0000, u64::from(u32::MAX), u64::MAX] {
            let bytes = varint_bytes(value);
            let mut reader = ByteReader::new(&bytes);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn non_canonical_varint_rejected() {
        // 5 encoded with a 3-byte prefix.
        let mut reader = ByteReader::new(&[0xFD, 0x05, 0x00]);
        assert_eq!(reader.read_varint(), Err(CodecError::NonCanonicalVarInt));

        let mut reader = ByteReader::new(&[0xFE, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(reader.read_varint(), Err(CodecError::NonCanonicalVarInt));
    }

    #[test]
    fn truncated_reads() {
        let mut reader = ByteReader::new(&[0x01, 0x02]);
        assert_eq!(reader.read_u32(), Err(CodecError::Truncated));

        let mut reader = ByteReader::new(&[0xFD, 0xFD]);
        assert_eq!(reader.read_varint(), Err(CodecError::Truncated));

        // Length prefix promising more bytes than the buffer holds.
        let mut reader = ByteReader::new(&[0x05, 0xAA]);
        assert_eq!(reader.read_var_bytes(), Err(CodecError::Truncated));
    }

    #[test]
    fn hostile_count_is_truncation_not_allocation() {
        let mut bytes = vec![0xFE];
        bytes.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_count(), Err(CodecError::Truncated));
    }

    #[test]
    fn little_endian_integers() {
        let mut writer = ByteWriter::new();
        writer.write_u32(0xDEAD_BEEF);
        writer.write_u64(1);
        assert_eq!(writer.len(), 12);
        let bytes = writer.into_vec();
        assert_eq!(bytes[..4], [0xEF, 0xBE, 0xAD, 0xDE]);

        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), 1);
        reader.expect_end().unwrap();
    }
}
