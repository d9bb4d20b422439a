//! Composite block types for the lattice chain.
//!
//! A composite block is the only on-chain unit. Besides the usual linkage
//! fields it anchors an ordered map of child-chain headers harvested from
//! external blockchains; the weighted distance fields are arbitrary-precision
//! because they accumulate without bound.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One anchored header from an external child blockchain. Opaque to the
/// node beyond these five fields.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildHeader {
    pub blockchain: String,
    pub height: u64,
    pub hash: String,
    pub merkle_root: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompositeBlock {
    /// Content digest, unique identity. Hex-encoded.
    pub hash: String,
    pub previous_hash: String,
    /// Monotonically increasing; genesis = 1.
    pub height: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub difficulty: BigUint,
    /// Per-block work delta; total_distance = parent.total_distance + distance.
    pub distance: BigUint,
    pub total_distance: BigUint,
    /// Ordered mapping child-chain name -> anchored header sequence.
    pub blockchain_headers: BTreeMap<String, Vec<ChildHeader>>,
    /// Cached count over all header sequences.
    pub blockchain_headers_count: u64,
    /// Identity credited for the block.
    pub miner_key: String,
}

impl CompositeBlock {
    /// Recompute the content digest over every field except `hash` itself.
    /// The preimage is the canonical binary encoding, so two blocks with
    /// equal fields always produce the same digest.
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(&self.height.to_be_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(&self.difficulty.to_bytes_be());
        hasher.update(&self.distance.to_bytes_be());
        hasher.update(&self.total_distance.to_bytes_be());
        for (chain, headers) in &self.blockchain_headers {
            hasher.update(chain.as_bytes());
            for h in headers {
                hasher.update(h.hash.as_bytes());
                hasher.update(h.merkle_root.as_bytes());
                hasher.update(&h.height.to_be_bytes());
                hasher.update(&h.timestamp.to_be_bytes());
            }
        }
        hasher.update(&self.blockchain_headers_count.to_be_bytes());
        hasher.update(self.miner_key.as_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Seal the block: recount the anchored headers and stamp the digest.
    pub fn seal(&mut self) {
        self.blockchain_headers_count = self
            .blockchain_headers
            .values()
            .map(|v| v.len() as u64)
            .sum();
        self.hash = self.compute_hash();
    }

    pub fn is_genesis(&self) -> bool {
        self.height == crate::constants::chain::GENESIS_HEIGHT
    }

    /// The deterministic height-1 block every store is seeded with.
    pub fn genesis(network: &str) -> Self {
        let mut genesis = CompositeBlock {
            hash: String::new(),
            previous_hash: hex::encode([0u8; 32]),
            height: crate::constants::chain::GENESIS_HEIGHT,
            timestamp: 1_529_280_000,
            difficulty: crate::block::validator::minimum_difficulty(),
            distance: BigUint::from(1u8),
            total_distance: BigUint::from(1u8),
            blockchain_headers: BTreeMap::new(),
            blockchain_headers_count: 0,
            miner_key: format!("genesis.{network}"),
        };
        genesis.seal();
        genesis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> CompositeBlock {
        let mut headers = BTreeMap::new();
        headers.insert(
            "btc".to_string(),
            vec![ChildHeader {
                blockchain: "btc".to_string(),
                height: 529_338,
                hash: "00000000a1b2".to_string(),
                merkle_root: "deadbeef".to_string(),
                timestamp: 1_529_280_100,
            }],
        );
        let mut b = CompositeBlock {
            hash: String::new(),
            previous_hash: "aa".repeat(32),
            height: 2,
            timestamp: 1_529_280_160,
            difficulty: BigUint::from(10_000u32),
            distance: BigUint::from(500u32),
            total_distance: BigUint::from(501u32),
            blockchain_headers: headers,
            blockchain_headers_count: 0,
            miner_key: "miner-a".to_string(),
        };
        b.seal();
        b
    }

    #[test]
    fn seal_counts_headers_and_stamps_hash() {
        let b = sample_block();
        assert_eq!(b.blockchain_headers_count, 1);
        assert_eq!(b.hash, b.compute_hash());
        assert_eq!(b.hash.len(), 64);
    }

    #[test]
    fn digest_changes_with_content() {
        let a = sample_block();
        let mut b = sample_block();
        b.height = 3;
        b.seal();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn genesis_is_deterministic() {
        assert_eq!(
            CompositeBlock::genesis("testnet").hash,
            CompositeBlock::genesis("testnet").hash
        );
        assert!(CompositeBlock::genesis("testnet").is_genesis());
    }
}
