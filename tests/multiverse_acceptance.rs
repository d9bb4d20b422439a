//! Chain-adoption scenarios: extending the tip, stale candidates, hotswap,
//! too-far-ahead blocks and the resync grant that follows them.

use latticed::block::types::{ChildHeader, CompositeBlock};
use latticed::block::validator::{self, children_height_sum};
use latticed::multiverse::Multiverse;
use latticed::store::{keys, KvStore};
use num_bigint::BigUint;
use std::collections::BTreeMap;
use std::sync::Arc;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn child(chain: &str, height: u64, timestamp: i64) -> ChildHeader {
    ChildHeader {
        blockchain: chain.to_string(),
        height,
        hash: format!("{chain}-{height}"),
        merkle_root: format!("m-{chain}-{height}"),
        timestamp,
    }
}

/// A window block with a hand-picked hash, the way gossip delivers them.
fn block(
    height: u64,
    hash: &str,
    prev: &str,
    total_distance: u64,
    children: Vec<ChildHeader>,
) -> CompositeBlock {
    let mut map: BTreeMap<String, Vec<ChildHeader>> = BTreeMap::new();
    for c in children {
        map.entry(c.blockchain.clone()).or_default().push(c);
    }
    let count = map.values().map(|v| v.len() as u64).sum();
    CompositeBlock {
        hash: hash.to_string(),
        previous_hash: prev.to_string(),
        height,
        timestamp: now(),
        difficulty: validator::minimum_difficulty(),
        distance: BigUint::from(1u8),
        total_distance: BigUint::from(total_distance),
        blockchain_headers: map,
        blockchain_headers_count: count,
        miner_key: "miner".to_string(),
    }
}

/// Multiverse over a throwaway store, seeded with `tip` as window head and
/// persisted tip.
fn seeded(tip: &CompositeBlock) -> (Multiverse, Arc<KvStore>) {
    let store = Arc::new(KvStore::open_temporary().unwrap());
    let genesis = CompositeBlock::genesis("testnet");
    let mut mv = Multiverse::new(store.clone(), genesis, false);
    assert!(mv.add_next_block(tip.clone()), "seeding an empty window");
    store.put_block(keys::LATEST, tip).unwrap();
    (mv, store)
}

#[test]
fn accept_next_extends_the_window() {
    let tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 9)]);
    let (mut mv, _store) = seeded(&tip);

    let mut next = block(11, "h11", "h10", 110, vec![child("btc", 25, now() - 4)]);
    next.timestamp = tip.timestamp + 4;

    assert!(mv.add_next_block(next.clone()));
    assert_eq!(mv.get_highest().unwrap().hash, "h11");
    assert_eq!(mv.get_parent_highest().unwrap().hash, "h10");
    assert!(mv.has_block(&next));
}

#[test]
fn reject_stale_candidate() {
    // same child weight as the tip but older anchored headers and an older
    // timestamp: the tiebreakers all point backwards
    let tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 5)]);
    let (mut mv, _store) = seeded(&tip);

    let mut stale = block(11, "h11", "h10", 110, vec![child("btc", 20, now() - 60)]);
    stale.timestamp = tip.timestamp - 1;

    assert!(!mv.add_next_block(stale));
    assert_eq!(mv.get_highest().unwrap().hash, "h10");
}

#[test]
fn hotswap_replaces_a_corrupt_tip() {
    let tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 9)]);
    let (mut mv, store) = seeded(&tip);

    // the persisted parent does not match the tip's linkage
    let mut parent = block(9, "h9-real", "h8", 90, vec![]);
    parent.timestamp = tip.timestamp - 100;
    store.put_block(keys::PARENT, &parent).unwrap();

    let mut replacement = block(10, "h10-fixed", "h9-real", 120, vec![child("btc", 21, now() - 5)]);
    replacement.timestamp = tip.timestamp + 1;

    assert!(mv.add_next_block(replacement.clone()));
    assert_eq!(mv.get_highest().unwrap().hash, "h10-fixed");
}

#[test]
fn too_far_ahead_rejects_then_grants_resync() {
    let tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 9)]);
    let (mut mv, store) = seeded(&tip);

    let far = block(20, "h20", "h19", 900, vec![child("btc", 50, now() - 2)]);
    assert!(!mv.add_next_block(far.clone()), "ten heights ahead of the tip");

    // strict resync wants the candidate's anchors verifiable locally
    assert!(!mv.add_resync_request(&far, true));
    let header = &far.blockchain_headers["btc"][0];
    store
        .put_raw(
            &keys::child_block("btc", header.height),
            &bincode::serialize(header).unwrap(),
        )
        .unwrap();
    assert!(mv.add_resync_request(&far, true));
}

#[test]
fn genesis_and_wrong_heights_never_extend() {
    let tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 9)]);
    let (mut mv, _store) = seeded(&tip);

    assert!(!mv.add_next_block(block(1, "g", "0", 1, vec![])));
    assert!(!mv.add_next_block(block(10, "h10b", "h9", 150, vec![child("btc", 30, now())])));
    assert!(!mv.add_next_block(block(13, "h13", "h12", 300, vec![child("btc", 30, now())])));
}

#[test]
fn window_heights_stay_contiguous_and_bounded() {
    let mut tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 9)]);
    let (mut mv, store) = seeded(&tip);

    let mut weights = vec![children_height_sum(&tip)];
    for i in 0..10u64 {
        let height = 11 + i;
        let next = block(
            height,
            &format!("h{height}"),
            &tip.hash,
            110 + i * 10,
            vec![child("btc", 21 + i, now() - 1)],
        );
        assert!(mv.add_next_block(next.clone()), "height {height}");
        store.put_block(keys::LATEST, &next).unwrap();
        weights.push(children_height_sum(mv.get_highest().unwrap()));
        tip = next;
    }

    // at most the window size, strictly descending by one
    assert_eq!(mv.len(), 7);
    assert_eq!(mv.get_highest().unwrap().height, 20);
    assert_eq!(mv.get_lowest().unwrap().height, 14);
    for pair in weights.windows(2) {
        assert!(pair[1] >= pair[0], "child weight must never regress");
    }
}

#[test]
fn duplicate_and_lighter_candidates_are_rejected() {
    let tip = block(10, "h10", "h9", 100, vec![child("btc", 20, now() - 9)]);
    let (mut mv, _store) = seeded(&tip);

    // same hash as the tip
    let mut dup = tip.clone();
    dup.height = 11;
    assert!(!mv.add_next_block(dup));

    // less total distance
    assert!(!mv.add_next_block(block(
        11,
        "h11",
        "h10",
        90,
        vec![child("btc", 25, now())]
    )));

    // anchors nothing
    let mut bare = block(11, "h11", "h10", 110, vec![]);
    bare.blockchain_headers_count = 0;
    assert!(!mv.add_next_block(bare));
}
