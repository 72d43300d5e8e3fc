//! Merkle tree construction over transaction ids.

use crate::hash::{double_sha256, H256};

/// Computes the root of the transaction merkle tree: pair adjacent
/// hashes, duplicating the last when a level is odd, until one remains.
/// A single leaf is its own root. Returns `None` for an empty list,
/// which has no defined root.
#[must_use]
pub fn merkle_root(leaves: &[H256]) -> Option<H256> {
    if leaves.is_empty() {
        return None;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    Some(level[0])
}

/// One interior node: double SHA-256 over the two children's natural
/// bytes, left then right.
#[must_use]
pub fn hash_pair(left: &H256, right: &H256) -> H256 {
    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(&left.0);
    concat[32..].copy_from_slice(&right.0);
    double_sha256(&concat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_hex(hex: &str) -> H256 {
        hex.parse().unwrap()
    }

    // Hash pairs of items recursively until a single value is obtained.
    fn naive_root(hash_list: &[H256]) -> H256 {
        if hash_list.len() == 1 {
            return hash_list[0];
        }

        let mut next = Vec::new();
        for i in (0..hash_list.len() - 1).step_by(2) {
            next.push(hash_pair(&hash_list[i], &hash_list[i + 1]));
        }
        if hash_list.len() % 2 == 1 {
            let last = hash_list[hash_list.len() - 1];
            next.push(hash_pair(&last, &last));
        }
        naive_root(&next)
    }

    fn sample_txids() -> Vec<H256> {
        vec![
            decode_hex("18afbf37d136ff62644b231fcde72f1fb8edd04a798fb00cb06360da635da275"),
            decode_hex("30b19832a5f4b952e151de77d96139987492becc8b6e1e914c4103cfbb06c01e"),
            decode_hex("b94ed12902e35b29dd53cf25e665b4d0bc92f22adbc383ad90566584902b061d"),
            decode_hex("1920e5d8a10018dc65308bb4d1f11d30b5406c6499688443bfcd1ef364206b14"),
            decode_hex("048f3897c16bdc59ec1187aa080a4b4aa5ec1afcb4b776cf8b8a214b01990a7b"),
            decode_hex("266a660e2be5f2fdf41ae21d5a29c4db6270b2686dfe3902bd2dd3bca3626d7c"),
            decode_hex("17c3b888226ce70908303eaecb88ba02aa5ab858fade8576261b1203c6885528"),
            decode_hex("8a06d54b8b411e99b7e4d60c330b8cde4feb23d62edfc25047c4d837dfb5b253"),
        ]
    }

    #[test]
    fn empty_list_has_no_root() {
        assert_eq!(merkle_root(&[]), None);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = decode_hex("18afbf37d136ff62644b231fcde72f1fb8edd04a798fb00cb06360da635da275");
        assert_eq!(merkle_root(&[leaf]), Some(leaf));
    }

    #[test]
    fn eight_leaves_match_known_root() {
        let expected =
            decode_hex("7c8708d1f517caf3082d95cf1f6ced11a009318338e720ecee58a2b4e643d56a");
        assert_eq!(merkle_root(&sample_txids()), Some(expected));
    }

    #[test]
    fn matches_naive_reference_for_all_small_sizes() {
        let txids = sample_txids();
        for n in 1..=txids.len() {
            assert_eq!(merkle_root(&txids[..n]), Some(naive_root(&txids[..n])));
        }
    }
}
