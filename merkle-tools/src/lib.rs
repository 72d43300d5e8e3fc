//! Merkle inclusion proofs for transactions.
//!
//! A proof is the list of sibling hashes on the path from a leaf to the
//! root, inner nodes excluded at both ends. Proofs are built by whoever
//! holds the full transaction list and verified by SPV clients that only
//! know the block header's merkle root.

pub use spv_types::hash::{double_sha256, H256};
use spv_types::merkle::hash_pair;

/// Builds the inclusion proof for the leaf at `position`. Levels with an
/// odd node count duplicate their last node, exactly as the root
/// construction does.
///
/// # Panics
///
/// If `position` is out of range or `tx_hashes` is empty.
#[must_use]
pub fn merkle_proof_calculator(tx_hashes: &[H256], position: usize) -> Vec<H256> {
    assert!(
        position < tx_hashes.len(),
        "proof position outside the transaction list"
    );

    let mut proof = Vec::new();
    let mut level = tx_hashes.to_vec();
    let mut position = position;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }

        let sibling = position ^ 1;
        proof.push(level[sibling]);

        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        position /= 2;
    }

    proof
}

/// Replays an inclusion proof: hashes the transaction up the tree and
/// returns the root the proof commits to. The caller compares the result
/// against the merkle root in a block header it trusts.
///
/// The leaf index decides sides at each level: even positions hash as the
/// left child, odd as the right.
#[must_use]
pub fn compute_root_from_merkle_proof(
    tx_hash: H256,
    position: usize,
    merkle_proof: &[H256],
) -> H256 {
    let mut current = tx_hash;
    let mut position = position;

    for sibling in merkle_proof {
        current = if position % 2 == 0 {
            hash_pair(&current, sibling)
        } else {
            hash_pair(sibling, &current)
        };
        position /= 2;
    }

    current
}
