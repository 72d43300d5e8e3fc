//! Per-network consensus parameters and the validation policy callers
//! pass into verification.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::hash::H256;
use crate::header::{Header, StoredBlock};
use crate::tx::{OutPoint, Transaction, TxIn, TxOut};
use crate::u256::U256;

/// Highest target either Bitcoin network accepts, i.e. the lowest
/// possible difficulty.
pub const POW_LIMIT: U256 = U256::new(
    0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff,
    0xffff_ffff_ffff_ffff_ffff_ffff_ffff_ffff,
);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Short identifier, used among other things to name the per-network
    /// checkpoint file `<id>.checkpoints.txt`.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
        }
    }

    #[must_use]
    pub fn config(&self) -> NetworkConfig {
        NetworkConfig::new(*self)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: Network,
    /// Blocks between difficulty retargets.
    pub difficulty_adjustment_interval: u32,
    /// Seconds one retarget window is supposed to take.
    pub pow_target_timespan: i64,
    /// Seconds between blocks the retargeting aims for.
    pub pow_target_spacing: u32,
    /// Compact form of [`POW_LIMIT`].
    pub proof_of_work_limit_bits: u32,
    pub pow_limit: U256,
    /// Testnet's 20-minute emergency rule.
    pub pow_allow_min_difficulty_blocks: bool,
}

impl NetworkConfig {
    #[must_use]
    pub fn new(network: Network) -> Self {
        match network {
            Network::Mainnet => NetworkConfig {
                network,
                difficulty_adjustment_interval: 2016,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 600,
                proof_of_work_limit_bits: 0x1d00_ffff,
                pow_limit: POW_LIMIT,
                pow_allow_min_difficulty_blocks: false,
            },
            Network::Testnet => NetworkConfig {
                network,
                difficulty_adjustment_interval: 2016,
                pow_target_timespan: 14 * 24 * 60 * 60,
                pow_target_spacing: 600,
                proof_of_work_limit_bits: 0x1d00_ffff,
                pow_limit: POW_LIMIT,
                pow_allow_min_difficulty_blocks: true,
            },
        }
    }

    /// The network's genesis header. The body is identical on both
    /// networks; only time and nonce differ.
    #[must_use]
    pub fn genesis_header(&self) -> Header {
        let (time, nonce) = match self.network {
            Network::Mainnet => (1_231_006_505, 2_083_236_893),
            Network::Testnet => (1_296_688_602, 414_098_458),
        };
        Header {
            version: 1,
            prev_block_hash: H256::ZERO,
            merkle_root: genesis_coinbase().txid(),
            time,
            bits: 0x1d00_ffff,
            nonce,
        }
    }

    /// The full genesis block, coinbase included.
    #[must_use]
    pub fn genesis_block(&self) -> Block {
        Block {
            header: self.genesis_header(),
            txdata: Some(vec![genesis_coinbase()]),
        }
    }

    /// Genesis wrapped as the height-0 stored block, the seed for a
    /// fresh store when no checkpoint reaches further.
    #[must_use]
    pub fn genesis_stored_block(&self) -> StoredBlock {
        let header = self.genesis_header();
        let work = header.work().expect("genesis bits are valid");
        StoredBlock::new(header, work, 0)
    }
}

/// Knobs for header verification, passed explicitly into every verify
/// call. Skipping proof of work is for tests that build chains out of
/// unmined headers.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub skip_pow_verification: bool,
}

const GENESIS_OUTPUT_VALUE: u64 = 50_0000_0000;

// The newspaper headline satoshi stamped into the first coinbase.
const GENESIS_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

// The uncompressed key the genesis output pays, followed by OP_CHECKSIG.
const GENESIS_OUTPUT_SCRIPT_HEX: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e0\
    3909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

fn genesis_coinbase() -> Transaction {
    // scriptSig: push the genesis bits, push 4, push the headline.
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    script_sig.push(GENESIS_MESSAGE.len() as u8);
    script_sig.extend_from_slice(GENESIS_MESSAGE);

    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig,
            sequence: 0xFFFF_FFFF,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut {
            value: GENESIS_OUTPUT_VALUE,
            script_pubkey: hex::decode(GENESIS_OUTPUT_SCRIPT_HEX).expect("genesis script literal"),
        }],
        lock_time: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::difficulty::{target_from_bits, target_to_bits};

    #[test]
    fn genesis_coinbase_hashes_to_known_txid() {
        assert_eq!(
            genesis_coinbase().txid().to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
    }

    #[test]
    fn mainnet_genesis_hash() {
        let config = Network::Mainnet.config();
        assert_eq!(
            config.genesis_header().block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(config.genesis_stored_block().height, 0);
    }

    #[test]
    fn testnet_genesis_hash() {
        let config = Network::Testnet.config();
        assert_eq!(
            config.genesis_header().block_hash().to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
    }

    #[test]
    fn pow_limit_packs_to_its_compact_form() {
        let config = Network::Mainnet.config();
        // The compact form truncates the mantissa, so it only round-trips
        // in the packing direction.
        assert_eq!(
            target_to_bits(&config.pow_limit),
            config.proof_of_work_limit_bits
        );
        assert!(target_from_bits(config.proof_of_work_limit_bits).unwrap() <= config.pow_limit);
    }

    #[test]
    fn genesis_block_body_matches_header() {
        let block = Network::Mainnet.config().genesis_block();
        assert_eq!(
            block.compute_merkle_root().unwrap(),
            block.header.merkle_root
        );
    }
}
