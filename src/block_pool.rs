//! Candidate buffer for blocks that arrive while a resync is in flight.
//!
//! Blocks gossiped during a sync cannot be adopted out of order, so they
//! park here keyed by height and are released as an ascending run once the
//! gap below them has been filled from peers.

use crate::block::types::CompositeBlock;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Default)]
pub struct BlockPool {
    buffered: BTreeMap<u64, CompositeBlock>,
    /// Heights at or below this are already persisted.
    checkpoint: u64,
    syncing: bool,
}

impl BlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    pub fn begin_sync(&mut self, checkpoint: u64) {
        self.syncing = true;
        self.checkpoint = checkpoint;
        self.prune_below(checkpoint + 1);
    }

    /// Leave sync mode. Buffered blocks stay parked for draining.
    pub fn end_sync(&mut self) {
        self.syncing = false;
    }

    /// Park a candidate. Only buffers while syncing and above the
    /// checkpoint; a second candidate at the same height wins only if it
    /// carries more total distance.
    pub fn buffer(&mut self, block: CompositeBlock) -> bool {
        if !self.syncing || block.height <= self.checkpoint {
            return false;
        }
        match self.buffered.get(&block.height) {
            Some(existing) if existing.total_distance >= block.total_distance => {
                debug!(height = block.height, "already holding a heavier candidate");
                false
            }
            _ => {
                self.buffered.insert(block.height, block);
                true
            }
        }
    }

    /// Release the consecutive run starting at `from`, ascending. Stops at
    /// the first gap; whatever is above the gap stays parked.
    pub fn drain_sequence(&mut self, from: u64) -> Vec<CompositeBlock> {
        let mut released = Vec::new();
        let mut next = from;
        while let Some(block) = self.buffered.remove(&next) {
            released.push(block);
            next += 1;
        }
        released
    }

    pub fn prune_below(&mut self, height: u64) {
        self.buffered = self.buffered.split_off(&height);
    }

    pub fn max_height(&self) -> Option<u64> {
        self.buffered.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    fn block(height: u64, total_distance: u64) -> CompositeBlock {
        let mut b = CompositeBlock::genesis("testnet");
        b.height = height;
        b.total_distance = BigUint::from(total_distance);
        b.seal();
        b
    }

    #[test]
    fn buffers_only_while_syncing() {
        let mut pool = BlockPool::new();
        assert!(!pool.buffer(block(5, 50)));
        pool.begin_sync(3);
        assert!(pool.buffer(block(5, 50)));
        assert!(!pool.buffer(block(3, 30)), "at the checkpoint");
    }

    #[test]
    fn heavier_candidate_replaces_lighter_at_same_height() {
        let mut pool = BlockPool::new();
        pool.begin_sync(0);
        assert!(pool.buffer(block(5, 50)));
        assert!(!pool.buffer(block(5, 40)));
        assert!(pool.buffer(block(5, 60)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn drains_a_consecutive_run_and_stops_at_gaps() {
        let mut pool = BlockPool::new();
        pool.begin_sync(3);
        for h in [4u64, 5, 6, 8, 9] {
            pool.buffer(block(h, h * 10));
        }
        let run = pool.drain_sequence(4);
        let heights: Vec<u64> = run.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![4, 5, 6]);
        assert_eq!(pool.max_height(), Some(9));

        // after the gap is filled externally, the rest drains
        let rest = pool.drain_sequence(8);
        assert_eq!(rest.len(), 2);
        assert!(pool.is_empty());
    }
}
