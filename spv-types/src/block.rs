//! Blocks: header plus optional transaction list, with the header- and
//! body-level verification rules an SPV node enforces.

use thiserror::Error;

use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::difficulty::target_met;
use crate::hash::{double_sha256, H256};
use crate::header::Header;
use crate::merkle::merkle_root;
use crate::network::ValidationPolicy;
use crate::tx::Transaction;

/// Largest serialized block consensus accepts.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// Cap on the summed legacy sig-op count of a block.
pub const MAX_BLOCK_SIGOPS: u32 = (MAX_BLOCK_SIZE / 50) as u32;
/// How far into the future a header timestamp may run ahead of our clock.
pub const ALLOWED_TIME_DRIFT_SECS: u64 = 2 * 60 * 60;

/// Prefix of the coinbase output script carrying the witness commitment:
/// `OP_RETURN OP_PUSH36 0xaa21a9ed`.
const WITNESS_COMMITMENT_PREFIX: [u8; 6] = [0x6A, 0x24, 0xAA, 0x21, 0xA9, 0xED];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("header bits do not encode a valid target")]
    InvalidTarget,
    #[error("block hash is above the claimed target")]
    PowBelowTarget,
    #[error("timestamp {time} is more than the allowed drift past {now}")]
    TimestampTooFarAhead { time: u32, now: u64 },
    #[error("computed merkle root does not match the header")]
    MerkleMismatch,
    #[error("witness commitment does not match the witness data")]
    WitnessCommitmentMismatch,
    #[error("coinbase missing from the first slot or duplicated later")]
    BadCoinbasePosition,
    #[error("coinbase script does not commit to height {0}")]
    BadCoinbaseHeight(u32),
    #[error("block exceeds the sig-op limit: {0}")]
    SigOpsExceeded(u32),
    #[error("serialized block is {0} bytes, above the 1MB limit")]
    OversizedBlock(usize),
    #[error("block has no transactions")]
    EmptyBlock,
    #[error("witness data present without a witness commitment")]
    UnexpectedWitness,
}

/// Extra body checks the caller can opt into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxVerifyFlags {
    /// Enforce the BIP34 rule that the coinbase script starts with the
    /// block height.
    pub height_in_coinbase: bool,
}

/// A block header together with its transactions, when we have them.
/// Header-only blocks are what SPV synchronization moves around; they
/// still hash and chain like full blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub txdata: Option<Vec<Transaction>>,
}

impl Block {
    #[must_use]
    pub fn header_only(header: Header) -> Block {
        Block {
            header,
            txdata: None,
        }
    }

    /// Decodes a block: an 80-byte header, then either nothing or a
    /// complete transaction list with no trailing bytes.
    pub fn parse(bytes: &[u8]) -> Result<Block, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let header = Header::read(&mut reader)?;

        if reader.is_empty() {
            return Ok(Block::header_only(header));
        }

        let tx_count = reader.read_count()?;
        let mut txdata = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            txdata.push(Transaction::read(&mut reader)?);
        }
        reader.expect_end()?;

        Ok(Block {
            header,
            txdata: Some(txdata),
        })
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(Header::SIZE);
        self.header.write(&mut writer);
        if let Some(txdata) = &self.txdata {
            writer.write_varint(txdata.len() as u64);
            for tx in txdata {
                writer.write_bytes(&tx.serialize());
            }
        }
        writer.into_vec()
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        self.header.block_hash()
    }

    /// The merkle root over the body's txids; `None` without a body.
    #[must_use]
    pub fn compute_merkle_root(&self) -> Option<H256> {
        let txdata = self.txdata.as_ref()?;
        let txids: Vec<H256> = txdata.iter().map(Transaction::txid).collect();
        merkle_root(&txids)
    }

    /// The witness merkle root: same tree over wtxids, with the coinbase
    /// leaf pinned to zero.
    #[must_use]
    pub fn compute_witness_root(&self) -> Option<H256> {
        let txdata = self.txdata.as_ref()?;
        let leaves: Vec<H256> = txdata
            .iter()
            .enumerate()
            .map(|(i, tx)| if i == 0 { H256::ZERO } else { tx.wtxid() })
            .collect();
        merkle_root(&leaves)
    }

    /// Stateless header checks: proof of work and timestamp drift.
    pub fn verify_header(
        &self,
        policy: &ValidationPolicy,
        now: u64,
    ) -> Result<(), VerificationError> {
        verify_header(&self.header, policy, now)
    }

    /// Body checks for a block claimed to sit at `height`. Signature and
    /// script validity stay with an external verifier; this enforces the
    /// structural consensus rules an SPV node can check alone.
    pub fn verify_transactions(
        &self,
        height: u32,
        flags: &TxVerifyFlags,
    ) -> Result<(), VerificationError> {
        let txdata = match &self.txdata {
            Some(txdata) if !txdata.is_empty() => txdata,
            _ => return Err(VerificationError::EmptyBlock),
        };

        let size = self.serialize().len();
        if size > MAX_BLOCK_SIZE {
            return Err(VerificationError::OversizedBlock(size));
        }

        let coinbase = &txdata[0];
        if !coinbase.is_coinbase() {
            return Err(VerificationError::BadCoinbasePosition);
        }
        if txdata[1..].iter().any(Transaction::is_coinbase) {
            return Err(VerificationError::BadCoinbasePosition);
        }

        if flags.height_in_coinbase {
            let expected = bip34_height_prefix(height);
            if !coinbase.inputs[0].script_sig.starts_with(&expected) {
                return Err(VerificationError::BadCoinbaseHeight(height));
            }
        }

        let computed = self
            .compute_merkle_root()
            .expect("txdata verified non-empty");
        if computed != self.header.merkle_root {
            return Err(VerificationError::MerkleMismatch);
        }

        let sigops: u32 = txdata.iter().map(Transaction::sigop_count).sum();
        if sigops > MAX_BLOCK_SIGOPS {
            return Err(VerificationError::SigOpsExceeded(sigops));
        }

        self.verify_witness_commitment(txdata)
    }

    fn verify_witness_commitment(
        &self,
        txdata: &[Transaction],
    ) -> Result<(), VerificationError> {
        let coinbase = &txdata[0];
        let commitment = find_witness_commitment(coinbase);
        let any_witness = txdata.iter().any(Transaction::has_witness);

        let Some(commitment) = commitment else {
            // Pre-segwit blocks simply have no witness bytes anywhere.
            if any_witness {
                return Err(VerificationError::UnexpectedWitness);
            }
            return Ok(());
        };

        // The reserved value is the single 32-byte item of the coinbase
        // input witness.
        let reserved: &[u8] = match coinbase.inputs[0].witness.as_slice() {
            [item] if item.len() == 32 => item,
            _ => return Err(VerificationError::WitnessCommitmentMismatch),
        };

        let witness_root = self
            .compute_witness_root()
            .expect("txdata verified non-empty");
        let mut preimage = [0u8; 64];
        preimage[..32].copy_from_slice(&witness_root.0);
        preimage[32..].copy_from_slice(reserved);
        if double_sha256(&preimage) != commitment {
            return Err(VerificationError::WitnessCommitmentMismatch);
        }
        Ok(())
    }
}

/// Stateless header checks, usable without building a [`Block`].
pub fn verify_header(
    header: &Header,
    policy: &ValidationPolicy,
    now: u64,
) -> Result<(), VerificationError> {
    let target = header.target().ok_or(VerificationError::InvalidTarget)?;
    if !policy.skip_pow_verification && !target_met(&header.block_hash(), &target) {
        return Err(VerificationError::PowBelowTarget);
    }

    if u64::from(header.time) > now + ALLOWED_TIME_DRIFT_SECS {
        return Err(VerificationError::TimestampTooFarAhead {
            time: header.time,
            now,
        });
    }
    Ok(())
}

/// The BIP34 height prefix: the block height pushed as a minimal script
/// number at the very start of the coinbase script.
#[must_use]
pub fn bip34_height_prefix(height: u32) -> Vec<u8> {
    // Small values have dedicated opcodes: OP_0 and OP_1..OP_16.
    if height == 0 {
        return vec![0x00];
    }
    if height <= 16 {
        return vec![0x50 + height as u8];
    }

    let mut num = Vec::with_capacity(5);
    let mut value = height;
    while value > 0 {
        num.push((value & 0xFF) as u8);
        value >>= 8;
    }
    // Script numbers are signed; a set top bit needs a padding byte.
    if num.last().unwrap() & 0x80 != 0 {
        num.push(0x00);
    }

    let mut out = Vec::with_capacity(1 + num.len());
    out.push(num.len() as u8);
    out.extend_from_slice(&num);
    out
}

/// The coinbase's witness commitment, if one is present: the last output
/// whose script starts `OP_RETURN OP_PUSH36 0xaa21a9ed`.
fn find_witness_commitment(coinbase: &Transaction) -> Option<H256> {
    coinbase
        .outputs
        .iter()
        .rev()
        .find(|output| output.script_pubkey.starts_with(&WITNESS_COMMITMENT_PREFIX))
        .and_then(|output| output.script_pubkey.get(6..38))
        .map(|bytes| H256(bytes.try_into().unwrap()))
}
