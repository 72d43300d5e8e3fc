//! Consensus-critical primitives for a Bitcoin SPV node: bit-exact wire
//! codecs for transactions, headers and blocks, the compact difficulty
//! encoding with its work arithmetic, merkle tree construction, and the
//! stored-block records the chain engine persists.

pub mod block;
pub mod codec;
pub mod difficulty;
pub mod hash;
pub mod header;
pub mod merkle;
pub mod network;
pub mod tx;
pub mod u256;

pub use block::{Block, TxVerifyFlags, VerificationError};
pub use codec::{ByteReader, ByteWriter, CodecError};
pub use difficulty::{Target, Work};
pub use hash::{double_sha256, sha256, H256};
pub use header::{ChainWorkError, Header, StoredBlock};
pub use network::{Network, NetworkConfig, ValidationPolicy};
pub use tx::{OutPoint, Transaction, TxIn, TxOut};
pub use u256::U256;
