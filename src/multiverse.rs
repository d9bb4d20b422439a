//! In-memory best-chain window and chain-adoption logic.
//!
//! The multiverse holds at most `WINDOW_SIZE` composite blocks ordered
//! highest first. It decides three things: whether an arriving block
//! extends the tip (`add_next_block`), whether it replaces the tip at the
//! same height (`add_best_block`), and whether the node should stop mining
//! and fetch a range from peers instead (`add_resync_request`). The durable
//! tip lives in the store; the window is a cache over it.

use crate::block::types::{ChildHeader, CompositeBlock};
use crate::block::validator::{
    children_height_sum, get_newest_header, is_valid_block, validate_block_sequence,
    validate_sequence_difficulty,
};
use crate::constants::chain::{
    GENESIS_HEIGHT, HIGH_HEIGHT_CLOCK_SKEW_SECS, HIGH_HEIGHT_THRESHOLD, MAX_BLOCK_AGE_SECS,
    MAX_HEIGHT_JUMP, STALE_TIP_SECS, TIP_TIMESTAMP_SLACK_SECS, VALIDITY_CACHE_SIZE, WINDOW_SIZE,
};
use crate::constants::sync::SYNCLOCK_STALE_SECS;
use crate::error::ValidationError;
use crate::store::{keys, KvStore};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Multiverse {
    store: Arc<KvStore>,
    /// Window of adopted blocks, index 0 = highest.
    blocks: Vec<CompositeBlock>,
    /// Structural-validity verdicts keyed by block hash.
    validity: LruCache<String, bool>,
    /// Written back when the synclock goes stale; height 1 means unlocked.
    genesis: CompositeBlock,
    /// Gate for the per-extension sequence check (see `add_next_block`).
    strict_sequence_check: bool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Multiverse {
    pub fn new(store: Arc<KvStore>, genesis: CompositeBlock, strict_sequence_check: bool) -> Self {
        Self {
            store,
            blocks: Vec::with_capacity(WINDOW_SIZE),
            validity: LruCache::new(NonZeroUsize::new(VALIDITY_CACHE_SIZE).unwrap()),
            genesis,
            strict_sequence_check,
        }
    }

    pub fn get_highest(&self) -> Option<&CompositeBlock> {
        self.blocks.first()
    }

    pub fn get_parent_highest(&self) -> Option<&CompositeBlock> {
        self.blocks.get(1)
    }

    pub fn get_lowest(&self) -> Option<&CompositeBlock> {
        self.blocks.last()
    }

    pub fn has_block(&self, block: &CompositeBlock) -> bool {
        self.blocks.iter().any(|b| b.hash == block.hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Replace the window wholesale after a resync adopted a new run.
    /// `blocks` must be ordered highest first.
    pub fn adopt_sequence(&mut self, blocks: Vec<CompositeBlock>) {
        self.blocks = blocks;
        self.blocks.truncate(WINDOW_SIZE);
    }

    /// Structural validity with an LRU memo; resync gating consults this on
    /// every candidate so the digest work is paid once per block.
    pub fn is_valid_block_cached(&mut self, block: &CompositeBlock) -> bool {
        if let Some(&verdict) = self.validity.get(&block.hash) {
            return verdict;
        }
        let verdict = is_valid_block(block);
        self.validity.put(block.hash.clone(), verdict);
        verdict
    }

    /// Same-height tip replacement. Succeeds when the window is empty (seed)
    /// or when the candidate links to the block under the tip and carries
    /// more total distance than the tip it displaces.
    pub fn add_best_block(&mut self, block: CompositeBlock) -> bool {
        if self.blocks.is_empty() {
            info!(height = block.height, hash = %block.hash, "seeding empty multiverse");
            self.blocks.push(block);
            return true;
        }
        let Some(parent) = self.get_parent_highest() else {
            debug!("no parent under the tip, cannot swap");
            return false;
        };
        if block.previous_hash != parent.hash {
            debug!(height = block.height, "candidate does not link under the tip");
            return false;
        }
        if block.total_distance <= self.blocks[0].total_distance {
            debug!(height = block.height, "candidate carries no more distance than the tip");
            return false;
        }
        info!(height = block.height, hash = %block.hash, "tip replaced by heavier sibling");
        self.blocks[0] = block;
        true
    }

    /// The main acceptance rule: decide whether `block` becomes the new tip.
    /// Every gate below rejects silently (debug log only); storage errors on
    /// the tip read reject with a warning and leave the window untouched.
    pub fn add_next_block(&mut self, block: CompositeBlock) -> bool {
        if self.blocks.is_empty() {
            info!(height = block.height, hash = %block.hash, "window empty, adopting candidate");
            self.blocks.push(block);
            return true;
        }

        let tip = match self.store.get_block(keys::LATEST, false) {
            Ok(tip) => tip,
            Err(e) => {
                warn!("tip read failed, rejecting candidate: {e}");
                return false;
            }
        };
        let Some(tip) = tip else {
            info!(height = block.height, "no persisted tip, adopting candidate");
            self.blocks.insert(0, block);
            self.blocks.truncate(WINDOW_SIZE);
            return true;
        };

        // Hotswap: the persisted parent disagrees with the tip's linkage,
        // meaning the local tip record is corrupt. A same-height candidate
        // that links cleanly and carries more distance replaces it outright.
        if let Ok(Some(parent)) = self.store.get_block(keys::PARENT, true) {
            if parent.hash != tip.previous_hash
                && tip.height == block.height
                && validate_sequence_difficulty(&parent, &block)
                && block.total_distance > tip.total_distance
                && block.timestamp >= tip.timestamp
            {
                info!(height = block.height, hash = %block.hash, "hotswapping corrupt tip");
                self.blocks[0] = block;
                return true;
            }
        }

        if block.height == GENESIS_HEIGHT {
            debug!("genesis is immutable");
            return false;
        }
        if block.height > tip.height + MAX_HEIGHT_JUMP {
            debug!(
                candidate = block.height,
                tip = tip.height,
                "too far ahead, caller must resync"
            );
            return false;
        }
        if block.height != tip.height + 1 {
            debug!(
                candidate = block.height,
                tip = tip.height,
                "not a direct child by height"
            );
            return false;
        }

        let candidate_weight = children_height_sum(&block);
        let tip_weight = children_height_sum(&tip);
        if candidate_weight < tip_weight {
            debug!(candidate_weight, tip_weight, "lighter child-chain weight");
            return false;
        }
        if candidate_weight == tip_weight {
            let candidate_newest = get_newest_header(&block).map(|h| h.timestamp);
            let tip_newest = get_newest_header(&tip).map(|h| h.timestamp);
            if candidate_newest < tip_newest {
                debug!("equal weight but older anchored headers");
                return false;
            }
        }

        if block.hash == tip.hash
            || block.total_distance < tip.total_distance
            || block.height < tip.height
        {
            debug!("candidate does not improve on the tip");
            return false;
        }
        if block.blockchain_headers_count == 0 {
            debug!("candidate anchors no child headers");
            return false;
        }
        if block.timestamp + TIP_TIMESTAMP_SLACK_SECS <= tip.timestamp {
            debug!("candidate timestamp behind the tip");
            return false;
        }
        if block.timestamp + MAX_BLOCK_AGE_SECS < now() {
            debug!("candidate too old against local clock");
            return false;
        }

        if block.previous_hash != tip.hash {
            debug!(height = block.height, "right height, wrong parent; trying best-block swap");
            return self.add_best_block(block);
        }
        if block.height > 2 && self.strict_sequence_check {
            if let Err(e) = validate_block_sequence(&[block.clone(), tip.clone()]) {
                debug!("sequence check failed ({e}); trying best-block swap");
                return self.add_best_block(block);
            }
        }

        info!(height = block.height, hash = %block.hash, "extending tip");
        self.blocks.insert(0, block);
        self.blocks.truncate(WINDOW_SIZE);
        true
    }

    /// Decide whether the node should pause mining and fetch a range from
    /// peers. First matching rule wins. `strict` additionally requires the
    /// candidate's anchored headers to be verifiable against the local
    /// child-header records before a short window grants a resync.
    pub fn add_resync_request(&mut self, block: &CompositeBlock, strict: bool) -> bool {
        // A live synclock blocks concurrent resyncs; a stale one is reset
        // to the genesis sentinel and evaluation continues.
        if let Ok(Some(lock)) = self.store.get_block(keys::SYNCLOCK, true) {
            if lock.height != GENESIS_HEIGHT {
                if now() - lock.timestamp > SYNCLOCK_STALE_SECS {
                    warn!(locked_height = lock.height, "stale synclock, resetting");
                    if let Err(e) = self.store.put_block(keys::SYNCLOCK, &self.genesis) {
                        warn!("failed to reset synclock: {e}");
                        return false;
                    }
                } else {
                    debug!(locked_height = lock.height, "resync already in flight");
                    return false;
                }
            }
        }

        let tip = self.store.get_block(keys::LATEST, true).ok().flatten();

        if let Some(ref tip) = tip {
            if !self.is_valid_block_cached(tip) && is_valid_block(block) {
                info!("local tip invalid and candidate valid; resync granted");
                return true;
            }
        }

        let Some(tip) = tip else {
            info!("no persisted tip; resync granted");
            return true;
        };
        if self.blocks.is_empty() {
            info!("empty window; resync granted");
            return true;
        }
        if tip.height == GENESIS_HEIGHT && block.height > GENESIS_HEIGHT {
            info!("still at genesis; resync granted");
            return true;
        }
        if block.hash == tip.hash {
            debug!("candidate is the tip");
            return false;
        }
        if block.height > HIGH_HEIGHT_THRESHOLD
            && (block.timestamp - now()).abs() > HIGH_HEIGHT_CLOCK_SKEW_SECS
        {
            debug!("high-height candidate off local clock");
            return false;
        }
        if tip.timestamp + STALE_TIP_SECS < now() && block.total_distance > tip.total_distance {
            info!(tip_age = now() - tip.timestamp, "stale tip; resync granted");
            return true;
        }
        if self.blocks.len() < 2
            && block.total_distance > tip.total_distance
            && children_height_sum(block) > children_height_sum(&tip)
            && (!strict || self.validate_rovered_blocks(block))
        {
            info!("short window and heavier candidate; resync granted");
            return true;
        }
        if block.total_distance < tip.total_distance {
            debug!("candidate carries less distance");
            return false;
        }
        if children_height_sum(block) <= children_height_sum(&tip) {
            let granted = self.validate_rovered_blocks(block) && !self.validate_rovered_blocks(&tip);
            if granted {
                info!("candidate headers persisted locally but tip headers are not; resync granted");
            }
            return granted;
        }
        false
    }

    /// Verify a downloaded highest-first range internally and against the
    /// persisted record just below its lowest block.
    pub fn validate_block_sequence_inline(
        &self,
        blocks: &[CompositeBlock],
    ) -> Result<(), ValidationError> {
        validate_block_sequence(blocks)?;
        let lowest = blocks.last().expect("validated sequence is non-empty");
        if lowest.height <= GENESIS_HEIGHT {
            return Ok(());
        }
        let boundary = self
            .store
            .get_block(&keys::block(lowest.height - 1), true)
            .ok()
            .flatten();
        match boundary {
            Some(boundary) if boundary.hash == lowest.previous_hash => Ok(()),
            _ => Err(ValidationError::NoPersistedBoundary(lowest.height)),
        }
    }

    /// Every child header the block anchors must already be persisted by the
    /// rovers under `{chain}.block.{height}`, with a matching child hash.
    pub fn validate_rovered_blocks(&self, block: &CompositeBlock) -> bool {
        for headers in block.blockchain_headers.values() {
            for header in headers {
                let key = keys::child_block(&header.blockchain, header.height);
                let Ok(Some(raw)) = self.store.get_raw(&key, true) else {
                    debug!(%key, "anchored child header not persisted");
                    return false;
                };
                if let Ok(stored) = bincode::deserialize::<ChildHeader>(&raw) {
                    if stored.hash != header.hash {
                        debug!(%key, "anchored child header disagrees with rover record");
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use std::collections::BTreeMap;

    fn raw_block(height: u64, hash: &str, prev: &str, total_distance: u64) -> CompositeBlock {
        let mut headers = BTreeMap::new();
        headers.insert(
            "btc".to_string(),
            vec![ChildHeader {
                blockchain: "btc".to_string(),
                height: height * 2,
                hash: format!("btc-{height}"),
                merkle_root: "m".to_string(),
                timestamp: now() - 1,
            }],
        );
        CompositeBlock {
            hash: hash.to_string(),
            previous_hash: prev.to_string(),
            height,
            timestamp: now(),
            difficulty: crate::block::validator::minimum_difficulty(),
            distance: BigUint::from(1u8),
            total_distance: BigUint::from(total_distance),
            blockchain_headers: headers,
            blockchain_headers_count: 1,
            miner_key: "k".to_string(),
        }
    }

    fn fixture() -> (Multiverse, CompositeBlock) {
        let store = Arc::new(KvStore::open_temporary().unwrap());
        let genesis = CompositeBlock::genesis("testnet");
        let tip = raw_block(10, "h10", "h9", 100);
        store.put_block(keys::LATEST, &tip).unwrap();
        let mut mv = Multiverse::new(store, genesis, false);
        mv.blocks.push(tip.clone());
        (mv, tip)
    }

    #[test]
    fn direct_child_is_adopted() {
        let (mut mv, tip) = fixture();
        let mut child = raw_block(11, "h11", "h10", 110);
        child.timestamp = tip.timestamp + 4;
        assert!(mv.add_next_block(child.clone()));
        assert_eq!(mv.get_highest().unwrap().hash, child.hash);
        assert_eq!(mv.get_parent_highest().unwrap().hash, tip.hash);
    }

    #[test]
    fn wrong_height_is_rejected() {
        let (mut mv, _) = fixture();
        assert!(!mv.add_next_block(raw_block(13, "h13", "h12", 200)));
        assert!(!mv.add_next_block(raw_block(20, "h20", "h19", 900)));
        assert!(!mv.add_next_block(raw_block(1, "g", "0", 1)));
    }

    #[test]
    fn lighter_or_equal_distance_is_rejected() {
        let (mut mv, _) = fixture();
        let light = raw_block(11, "h11", "h10", 90);
        assert!(!mv.add_next_block(light));
    }

    #[test]
    fn headerless_candidate_is_rejected() {
        let (mut mv, _) = fixture();
        let mut bare = raw_block(11, "h11", "h10", 110);
        bare.blockchain_headers.clear();
        bare.blockchain_headers_count = 0;
        assert!(!mv.add_next_block(bare));
    }

    #[test]
    fn window_is_bounded() {
        let (mut mv, mut tip) = fixture();
        for i in 0..10u64 {
            let height = 11 + i;
            let mut b = raw_block(height, &format!("h{height}"), &tip.hash.clone(), 110 + i * 10);
            b.timestamp = now();
            mv.store.put_block(keys::LATEST, &tip).unwrap();
            // each accepted block becomes the next persisted tip
            assert!(mv.add_next_block(b.clone()), "height {height} should extend");
            tip = b;
            mv.store.put_block(keys::LATEST, &tip).unwrap();
        }
        assert_eq!(mv.len(), WINDOW_SIZE);
        for pair in mv.blocks.windows(2) {
            assert_eq!(pair[0].height, pair[1].height + 1);
        }
    }

    #[test]
    fn resync_blocked_by_fresh_synclock() {
        let (mut mv, _) = fixture();
        let mut lock = raw_block(50, "locked", "x", 500);
        lock.timestamp = now();
        mv.store.put_block(keys::SYNCLOCK, &lock).unwrap();
        let far = raw_block(20, "h20", "h19", 900);
        assert!(!mv.add_resync_request(&far, false));
    }

    #[test]
    fn stale_synclock_is_reset_and_evaluation_continues() {
        let (mut mv, _) = fixture();
        let mut lock = raw_block(50, "locked", "x", 500);
        lock.timestamp = now() - SYNCLOCK_STALE_SECS - 5;
        mv.store.put_block(keys::SYNCLOCK, &lock).unwrap();

        let far = raw_block(20, "h20", "h19", 900);
        // short window + heavier candidate, non-strict: granted
        assert!(mv.add_resync_request(&far, false));
        let reset = mv
            .store
            .get_block(keys::SYNCLOCK, false)
            .unwrap()
            .unwrap();
        assert_eq!(reset.height, GENESIS_HEIGHT);
    }

    #[test]
    fn resync_strict_requires_persisted_child_headers() {
        let (mut mv, _) = fixture();
        let far = raw_block(20, "h20", "h19", 900);
        assert!(!mv.add_resync_request(&far, true));

        let header = &far.blockchain_headers["btc"][0];
        let key = keys::child_block("btc", header.height);
        mv.store
            .put_raw(&key, &bincode::serialize(header).unwrap())
            .unwrap();
        assert!(mv.add_resync_request(&far, true));
    }

    #[test]
    fn inline_sequence_needs_a_persisted_boundary() {
        let (mv, _) = fixture();
        let lower = raw_block(12, "h12", "h11", 120);
        let mut upper = raw_block(13, "h13", "h12", 130);
        upper.timestamp = lower.timestamp + 100;
        assert!(matches!(
            mv.validate_block_sequence_inline(&[upper.clone(), lower.clone()]),
            Err(ValidationError::NoPersistedBoundary(12))
        ));

        let boundary = raw_block(11, "h11", "h10", 110);
        mv.store.put_block(&keys::block(11), &boundary).unwrap();
        assert!(mv
            .validate_block_sequence_inline(&[upper, lower])
            .is_ok());
    }
}
