//! Pure validation functions over composite blocks.
//!
//! Nothing in this module touches storage or panics; every check returns
//! `bool` or `Result` and leaves the decision to the caller.

use crate::block::types::{ChildHeader, CompositeBlock};
use crate::constants::chain::TARGET_BLOCK_SECS;
use crate::error::ValidationError;
use num_bigint::BigUint;

/// Floor for composite difficulty. Blocks below it are structurally invalid.
pub fn minimum_difficulty() -> BigUint {
    BigUint::from(290_112_262_029_012u64)
}

/// Structural validity of a single block: digest integrity, linkage fields
/// present, header count consistent, difficulty above the floor.
pub fn is_valid_block(block: &CompositeBlock) -> bool {
    if block.hash.is_empty() || block.previous_hash.is_empty() {
        return false;
    }
    if block.height == 0 || block.timestamp <= 0 {
        return false;
    }
    if block.hash != block.compute_hash() {
        return false;
    }
    let counted: u64 = block
        .blockchain_headers
        .values()
        .map(|v| v.len() as u64)
        .sum();
    if counted != block.blockchain_headers_count {
        return false;
    }
    if block.difficulty < minimum_difficulty() {
        return false;
    }
    // distance is a delta of total_distance, never larger than it
    block.total_distance >= block.distance
}

/// Difficulty relation between a parent and its direct child. A child mined
/// faster than the target spacing may not lower the difficulty.
pub fn validate_sequence_difficulty(prev: &CompositeBlock, block: &CompositeBlock) -> bool {
    if block.difficulty < minimum_difficulty() {
        return false;
    }
    let elapsed = block.timestamp - prev.timestamp;
    if elapsed < TARGET_BLOCK_SECS {
        block.difficulty >= prev.difficulty
    } else {
        true
    }
}

/// Validate a highest-first run of blocks: hash linkage, contiguous heights,
/// strictly increasing total distance, difficulty relation, and anchored
/// child-header ordering between neighbours.
pub fn validate_block_sequence(blocks: &[CompositeBlock]) -> Result<(), ValidationError> {
    if blocks.is_empty() {
        return Err(ValidationError::EmptySequence);
    }
    for pair in blocks.windows(2) {
        let (upper, lower) = (&pair[0], &pair[1]);
        if upper.previous_hash != lower.hash {
            return Err(ValidationError::BrokenLink {
                hash: upper.hash.clone(),
                height: upper.height,
                expected: lower.hash.clone(),
            });
        }
        if upper.height != lower.height + 1 {
            return Err(ValidationError::HeightGap {
                upper: upper.height,
                lower: lower.height,
            });
        }
        if upper.total_distance <= lower.total_distance {
            return Err(ValidationError::DistanceNotIncreasing(upper.height));
        }
        if !validate_sequence_difficulty(lower, upper) {
            return Err(ValidationError::DifficultyOutOfBounds(upper.height));
        }
    }
    validate_rovered_sequences(blocks)
}

/// Anchored child headers must never regress between a block and its parent:
/// for every chain both blocks reference, the child heights the upper block
/// anchors start at or above where the lower block left off.
pub fn validate_rovered_sequences(blocks: &[CompositeBlock]) -> Result<(), ValidationError> {
    for pair in blocks.windows(2) {
        let (upper, lower) = (&pair[0], &pair[1]);
        for (chain, upper_headers) in &upper.blockchain_headers {
            let Some(lower_headers) = lower.blockchain_headers.get(chain) else {
                continue;
            };
            let Some(first_upper) = upper_headers.first() else {
                continue;
            };
            if let Some(last_lower) = lower_headers.last() {
                if first_upper.height < last_lower.height {
                    return Err(ValidationError::ChildSequenceRegressed(chain.clone()));
                }
            }
        }
    }
    Ok(())
}

/// Newest anchored child header by timestamp, across all chains.
pub fn get_newest_header(block: &CompositeBlock) -> Option<&ChildHeader> {
    block
        .blockchain_headers
        .values()
        .flatten()
        .max_by_key(|h| h.timestamp)
}

/// Sum over child chains of the highest child height the block anchors.
/// The first tiebreaker after height in chain adoption.
pub fn children_height_sum(block: &CompositeBlock) -> u64 {
    block
        .blockchain_headers
        .values()
        .map(|headers| headers.iter().map(|h| h.height).max().unwrap_or(0))
        .sum()
}
