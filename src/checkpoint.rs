//! The signed textual checkpoint format and chain bootstrap.
//!
//! A checkpoint file lets a fresh node skip years of header sync: it
//! seeds the store with a trusted stored block well before the wallet's
//! birth time and syncs forward from there. Files carry optional
//! detached signatures over the checkpoint data; verifying them is an
//! out-of-band step, this module only parses and exposes them.

use std::io::BufRead;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::info;
use spv_types::codec::ByteWriter;
use spv_types::hash::{sha256, H256};
use spv_types::header::{StoredBlock, COMPACT_V1_LEN, COMPACT_V2_LEN};
use spv_types::network::{Network, NetworkConfig};
use thiserror::Error;

use crate::store::{BlockStore, StoreError};

/// First line of every checkpoint file.
const FILE_MAGIC: &str = "TXT CHECKPOINTS 1";
/// Most signatures a file may carry.
const MAX_SIGNATURES: usize = 256;
/// Slack subtracted from the bootstrap target time, covering clock drift
/// between us and whoever produced the checkpoints.
const BOOTSTRAP_DRIFT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("not a checkpoint file")]
    BadMagic,
    #[error("implausible count: {0}")]
    BadCount(&'static str),
    #[error("checkpoint record has an unrecognized size")]
    BadRecordSize,
    #[error("malformed checkpoint file: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads a per-network checkpoint file and answers "the best trusted
/// block at or before time T".
pub struct CheckpointManager {
    config: NetworkConfig,
    signatures: Vec<Vec<u8>>,
    data_hash: H256,
    /// Ascending by header time.
    checkpoints: Vec<StoredBlock>,
}

/// The conventional file name for a network's checkpoints.
#[must_use]
pub fn checkpoint_file_name(network: Network) -> String {
    format!("{}.checkpoints.txt", network.id())
}

impl CheckpointManager {
    /// Parses a checkpoint stream. The format is US-ASCII lines: the
    /// magic, a signature count and that many base64 signatures, then a
    /// checkpoint count and that many base64 compact stored-block
    /// records (v1 or v2, told apart by length).
    pub fn load<R: BufRead>(
        config: NetworkConfig,
        reader: R,
    ) -> Result<CheckpointManager, CheckpointError> {
        let mut lines = reader.lines();
        let mut next_line = move || -> Result<String, CheckpointError> {
            match lines.next() {
                Some(line) => Ok(line?.trim_end().to_owned()),
                None => Err(CheckpointError::Malformed("unexpected end of file")),
            }
        };

        if next_line()? != FILE_MAGIC {
            return Err(CheckpointError::BadMagic);
        }

        let num_signatures: usize = next_line()?
            .parse()
            .map_err(|_| CheckpointError::Malformed("unreadable signature count"))?;
        if num_signatures > MAX_SIGNATURES {
            return Err(CheckpointError::BadCount("too many signatures"));
        }
        let mut signatures = Vec::with_capacity(num_signatures);
        for _ in 0..num_signatures {
            let decoded = BASE64
                .decode(next_line()?)
                .map_err(|_| CheckpointError::Malformed("signature is not base64"))?;
            signatures.push(decoded);
        }

        let num_checkpoints: u32 = next_line()?
            .parse()
            .map_err(|_| CheckpointError::Malformed("unreadable checkpoint count"))?;
        if num_checkpoints == 0 {
            return Err(CheckpointError::BadCount("no checkpoints"));
        }

        // The signatures cover the count and the raw record bytes.
        let mut signed_data = ByteWriter::new();
        signed_data.write_bytes(&num_checkpoints.to_be_bytes());

        let mut checkpoints = Vec::with_capacity(num_checkpoints as usize);
        for _ in 0..num_checkpoints {
            let raw = BASE64
                .decode(next_line()?)
                .map_err(|_| CheckpointError::Malformed("checkpoint is not base64"))?;
            if raw.len() != COMPACT_V1_LEN && raw.len() != COMPACT_V2_LEN {
                return Err(CheckpointError::BadRecordSize);
            }
            signed_data.write_bytes(&raw);
            let block = StoredBlock::decode_compact(&raw)
                .map_err(|_| CheckpointError::Malformed("undecodable checkpoint record"))?;
            checkpoints.push(block);
        }

        checkpoints.sort_by_key(|block| block.header.time);
        let data_hash = sha256(&signed_data.into_vec());

        info!(
            target: "checkpoint",
            "loaded {} checkpoints ({} signatures), newest at time {}",
            checkpoints.len(),
            signatures.len(),
            checkpoints.last().map(|b| b.header.time).unwrap_or(0)
        );

        Ok(CheckpointManager {
            config,
            signatures,
            data_hash,
            checkpoints,
        })
    }

    #[must_use]
    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// SHA-256 over the data the file's signatures cover. Callers that
    /// care can check the signatures against this out of band.
    #[must_use]
    pub fn data_hash(&self) -> H256 {
        self.data_hash
    }

    #[must_use]
    pub fn signatures(&self) -> &[Vec<u8>] {
        &self.signatures
    }

    /// The latest checkpoint whose header time is at or before `time`,
    /// falling back to the network's genesis block when none is.
    #[must_use]
    pub fn checkpoint_before(&self, time: u64) -> StoredBlock {
        self.checkpoints
            .iter()
            .rev()
            .find(|block| u64::from(block.header.time) <= time)
            .cloned()
            .unwrap_or_else(|| self.config.genesis_stored_block())
    }

    /// Seeds a fresh store for a wallet born at `time`: picks the
    /// checkpoint a week earlier (allowing for clock drift), stores it
    /// and makes it the chain head.
    pub fn bootstrap<S: BlockStore>(
        &self,
        store: &S,
        time: u64,
    ) -> Result<StoredBlock, CheckpointError> {
        let target = time.saturating_sub(BOOTSTRAP_DRIFT_SECS);
        let checkpoint = self.checkpoint_before(target);
        info!(
            target: "checkpoint",
            "bootstrapping store from height {} ({})",
            checkpoint.height,
            checkpoint.block_hash
        );
        store.put(&checkpoint)?;
        store.set_chain_head(&checkpoint)?;
        Ok(checkpoint)
    }
}
