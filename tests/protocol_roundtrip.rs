//! Wire-level properties: bit-exact tags, frame round-trips, range serving
//! and the continuation-chunk reassembly contract.

use latticed::block::types::{ChildHeader, CompositeBlock};
use latticed::block::validator;
use latticed::engine::{Event, EventEnvelope};
use latticed::network::frame::ChunkAssembler;
use latticed::network::message::ProtocolMessage;
use latticed::network::protocol::{
    handle_message, serve_range, ConnectionInfo, LocalNode, ProtocolContext,
};
use latticed::peer_manager::PeerManager;
use latticed::store::{keys, KvStore};
use num_bigint::BigUint;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

fn sample_block(height: u64) -> CompositeBlock {
    let mut headers = BTreeMap::new();
    headers.insert(
        "eth".to_string(),
        vec![ChildHeader {
            blockchain: "eth".to_string(),
            height: height * 3,
            hash: format!("eth-{height}"),
            merkle_root: "root".to_string(),
            timestamp: 1_600_000_000,
        }],
    );
    let mut b = CompositeBlock {
        hash: String::new(),
        previous_hash: "ff".repeat(32),
        height,
        timestamp: 1_600_000_000 + height as i64,
        difficulty: validator::minimum_difficulty(),
        distance: BigUint::from(7u8),
        total_distance: BigUint::from(height * 1000),
        blockchain_headers: headers,
        blockchain_headers_count: 0,
        miner_key: "miner".to_string(),
    };
    b.seal();
    b
}

fn context() -> (ProtocolContext, mpsc::Receiver<EventEnvelope>) {
    let store = Arc::new(KvStore::open_temporary().unwrap());
    let peers = Arc::new(PeerManager::new(store.clone(), 1, false));
    let (tx, rx) = mpsc::channel(16);
    (
        ProtocolContext {
            store,
            peers,
            events: tx,
            local: LocalNode {
                host: "127.0.0.1".to_string(),
                port: 16161,
                peer_id: "self".to_string(),
            },
        },
        rx,
    )
}

fn conn() -> ConnectionInfo {
    ConnectionInfo {
        id: 1,
        remote_host: "10.1.1.1".to_string(),
        remote_port: 16061,
    }
}

#[test]
fn every_message_round_trips() {
    let messages = vec![
        ProtocolMessage::Intro {
            host: "203.0.113.9".to_string(),
            port: 16061,
            peer_id: "3QJmnh".to_string(),
        },
        ProtocolMessage::ListServices,
        ProtocolMessage::GetBlockRange { low: 2, high: 4096 },
        ProtocolMessage::BlockList(vec![sample_block(3), sample_block(2)]),
        ProtocolMessage::GetHighest,
        ProtocolMessage::Highest(sample_block(42)),
        ProtocolMessage::GetMultiverse { low: 7, high: 11 },
        ProtocolMessage::MultiverseList(vec![sample_block(11)]),
    ];
    for message in messages {
        let wire = message.encode().unwrap();
        assert_eq!(ProtocolMessage::decode(&wire).unwrap(), message);
    }
}

#[test]
fn frames_are_bit_exact_on_the_wire() {
    let wire = ProtocolMessage::GetBlockRange { low: 5, high: 8 }
        .encode()
        .unwrap();
    assert_eq!(&wire[..], b"0006R01[*]5[*]8" as &[u8]);

    let announce = ProtocolMessage::Highest(sample_block(42)).encode().unwrap();
    assert_eq!(&announce[..7], b"0008W01");
    assert_eq!(&announce[7..10], b"[*]");
}

#[tokio::test]
async fn served_range_is_distinct_descending_and_bounded() {
    let (ctx, _rx) = context();
    for height in [5u64, 6, 7] {
        let b = sample_block(height);
        ctx.store.put_block(&keys::block(height), &b).unwrap();
    }

    // heights 5..=8 requested, only 5..=7 persisted
    let reply = handle_message(&ctx, &conn(), b"0006R01[*]5[*]8")
        .await
        .unwrap()
        .expect("a range request always gets a reply");
    let blocks = match ProtocolMessage::decode(&reply).unwrap() {
        ProtocolMessage::BlockList(blocks) => blocks,
        other => panic!("expected BlockList, got {other:?}"),
    };

    assert_eq!(blocks.len(), 3);
    let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
    assert_eq!(heights, vec![7, 6, 5]);
    for block in &blocks {
        assert!((5..=8).contains(&block.height));
    }
}

#[tokio::test]
async fn selective_range_uses_the_multiverse_tag() {
    let (ctx, _rx) = context();
    ctx.store
        .put_block(&keys::block(3), &sample_block(3))
        .unwrap();
    let reply = handle_message(&ctx, &conn(), b"0009R01[*]2[*]3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply[..7], b"0010W01");
}

#[tokio::test]
async fn range_floor_protects_genesis() {
    let (ctx, _rx) = context();
    ctx.store
        .put_block(&keys::block(1), &sample_block(1))
        .unwrap();
    ctx.store
        .put_block(&keys::block(2), &sample_block(2))
        .unwrap();
    let blocks = serve_range(&ctx.store, 0, 2);
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].height, 2);
}

#[tokio::test]
async fn inbound_block_list_emits_sorted_event() {
    let (ctx, mut rx) = context();
    let wire = ProtocolMessage::BlockList(vec![sample_block(4), sample_block(9)])
        .encode()
        .unwrap();
    handle_message(&ctx, &conn(), &wire).await.unwrap();

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.remote_host, "10.1.1.1");
    assert_eq!(envelope.remote_port, 16061);
    match envelope.event {
        Event::PutBlockList(blocks) => {
            let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
            assert_eq!(heights, vec![9, 4]);
        }
        other => panic!("expected PutBlockList, got {other:?}"),
    }
}

#[test]
fn large_frames_survive_continuation_chunking() {
    // a block list big enough to span several continuation chunks
    let blocks: Vec<CompositeBlock> = (2..40).map(sample_block).collect();
    let message = ProtocolMessage::BlockList(blocks);
    let wire = message.encode().unwrap();
    assert!(wire.len() > 3 * 1382);

    let mut assembler = ChunkAssembler::new();
    let mut reassembled = None;
    for chunk in wire.chunks(1382) {
        if let Some(done) = assembler.push(chunk).unwrap() {
            reassembled = Some(done);
        }
    }
    // a trailing short chunk terminates; if the frame length was an exact
    // multiple, the sender's next message would have to flush it
    let reassembled = match reassembled {
        Some(done) => done,
        None => assembler.push(b"").unwrap().expect("flush terminates"),
    };
    assert_eq!(ProtocolMessage::decode(&reassembled).unwrap(), message);
}
