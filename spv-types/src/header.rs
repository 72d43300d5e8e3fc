use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::difficulty::{target_from_bits, work_from_target, Target, Work};
use crate::hash::{double_sha256, H256};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Block version, now repurposed for soft fork signalling.
    pub version: i32,
    /// Reference to the previous block in the chain.
    pub prev_block_hash: H256,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: H256,
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the blockhash must lie, in compact form.
    pub bits: u32,
    /// The nonce, selected to obtain a low enough blockhash.
    pub nonce: u32,
}

impl Header {
    /// Serialized length: version, prev hash, merkle root, time, bits, nonce.
    pub const SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4; // 80

    pub fn read(reader: &mut ByteReader<'_>) -> Result<Header, CodecError> {
        Ok(Header {
            version: reader.read_i32()?,
            prev_block_hash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            time: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }

    /// Decodes exactly 80 bytes.
    pub fn parse(bytes: &[u8]) -> Result<Header, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let header = Header::read(&mut reader)?;
        reader.expect_end()?;
        Ok(header)
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        writer.write_i32(self.version);
        writer.write_hash(&self.prev_block_hash);
        writer.write_hash(&self.merkle_root);
        writer.write_u32(self.time);
        writer.write_u32(self.bits);
        writer.write_u32(self.nonce);
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; Header::SIZE] {
        let mut writer = ByteWriter::with_capacity(Header::SIZE);
        self.write(&mut writer);
        writer.into_vec().try_into().unwrap()
    }

    /// The block hash: double SHA-256 over the 80 serialized bytes.
    #[must_use]
    pub fn block_hash(&self) -> H256 {
        double_sha256(&self.serialize())
    }

    /// The proof-of-work threshold this header claims, or `None` when the
    /// compact bits do not decode to a valid target.
    #[must_use]
    pub fn target(&self) -> Option<Target> {
        target_from_bits(self.bits)
    }

    /// The work done to mine a block at this header's target.
    #[must_use]
    pub fn work(&self) -> Option<Work> {
        self.target().map(|target| work_from_target(&target))
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainWorkError {
    #[error("header bits do not encode a valid target")]
    InvalidTarget,
    #[error("cumulative chain work overflowed 256 bits")]
    Overflow,
}

/// Length of the version-1 compact record: 32-byte work, big-endian
/// height, raw header.
pub const COMPACT_V1_LEN: usize = 32 + 4 + Header::SIZE;
/// Length of the version-2 compact record, which truncates the work to
/// its low 12 bytes.
pub const COMPACT_V2_LEN: usize = 12 + 4 + Header::SIZE;

/// A header annotated with its position in the chain: the cached block
/// hash, the cumulative work up to and including it, and its height.
/// Built once when the chain engine accepts the header, immutable after.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredBlock {
    pub header: Header,
    pub block_hash: H256,
    pub chain_work: Work,
    pub height: u32,
}

impl StoredBlock {
    #[must_use]
    pub fn new(header: Header, chain_work: Work, height: u32) -> StoredBlock {
        StoredBlock {
            block_hash: header.block_hash(),
            header,
            chain_work,
            height,
        }
    }

    /// Wraps the child header that extends this block: one higher, with
    /// this block's work plus the child's own.
    pub fn build_next(&self, header: Header) -> Result<StoredBlock, ChainWorkError> {
        let work = header.work().ok_or(ChainWorkError::InvalidTarget)?;
        let (chain_work, overflow) = self.chain_work.overflowing_add(work);
        if overflow {
            return Err(ChainWorkError::Overflow);
        }
        Ok(StoredBlock::new(header, chain_work, self.height + 1))
    }

    /// The 96-byte record: full 32-byte big-endian work.
    #[must_use]
    pub fn encode_compact_v1(&self) -> [u8; COMPACT_V1_LEN] {
        let mut out = [0u8; COMPACT_V1_LEN];
        out[..32].copy_from_slice(&self.chain_work.to_be_bytes());
        out[32..36].copy_from_slice(&self.height.to_be_bytes());
        out[36..].copy_from_slice(&self.header.serialize());
        out
    }

    /// The 76-byte record, applicable while the cumulative work fits in
    /// 12 bytes; `None` once it no longer does.
    #[must_use]
    pub fn encode_compact_v2(&self) -> Option<[u8; COMPACT_V2_LEN]> {
        if !self.chain_work.fits_in_bytes(12) {
            return None;
        }
        let mut out = [0u8; COMPACT_V2_LEN];
        out[..12].copy_from_slice(&self.chain_work.to_be_bytes()[20..]);
        out[12..16].copy_from_slice(&self.height.to_be_bytes());
        out[16..].copy_from_slice(&self.header.serialize());
        Some(out)
    }

    /// The preferred encoding: v2 while the work fits, v1 thereafter.
    #[must_use]
    pub fn encode_compact(&self) -> Vec<u8> {
        match self.encode_compact_v2() {
            Some(record) => record.to_vec(),
            None => self.encode_compact_v1().to_vec(),
        }
    }

    pub fn decode_compact_v1(bytes: &[u8]) -> Result<StoredBlock, CodecError> {
        if bytes.len() != COMPACT_V1_LEN {
            return Err(CodecError::Malformed("bad v1 record length"));
        }
        let chain_work = Work::from_be_bytes(bytes[..32].try_into().unwrap());
        let height = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let header = Header::parse(&bytes[36..])?;
        Ok(StoredBlock::new(header, chain_work, height))
    }

    pub fn decode_compact_v2(bytes: &[u8]) -> Result<StoredBlock, CodecError> {
        if bytes.len() != COMPACT_V2_LEN {
            return Err(CodecError::Malformed("bad v2 record length"));
        }
        let mut work_bytes = [0u8; 32];
        work_bytes[20..].copy_from_slice(&bytes[..12]);
        let chain_work = Work::from_be_bytes(&work_bytes);
        let height = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let header = Header::parse(&bytes[16..])?;
        Ok(StoredBlock::new(header, chain_work, height))
    }

    /// Decodes either record version, selected by length.
    pub fn decode_compact(bytes: &[u8]) -> Result<StoredBlock, CodecError> {
        match bytes.len() {
            COMPACT_V1_LEN => StoredBlock::decode_compact_v1(bytes),
            COMPACT_V2_LEN => StoredBlock::decode_compact_v2(bytes),
            _ => Err(CodecError::Malformed("unrecognized record length")),
        }
    }
}
