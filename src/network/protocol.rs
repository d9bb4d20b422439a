//! Frame routing: decode, serve reads, hand writes to the engine.
//!
//! Read-tagged requests are answered directly from the store; write-tagged
//! frames become events on the engine bus and are processed under the
//! engine's single-flight discipline.

use crate::block::types::CompositeBlock;
use crate::constants::protocol::RANGE_FLOOR;
use crate::engine::{Event, EventEnvelope};
use crate::error::CodecError;
use crate::network::frame::FrameTag;
use crate::network::message::ProtocolMessage;
use crate::peer_manager::PeerManager;
use crate::store::{keys, KvStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What this node tells dialing peers about itself.
#[derive(Clone, Debug)]
pub struct LocalNode {
    pub host: String,
    pub port: u16,
    pub peer_id: String,
}

#[derive(Clone)]
pub struct ProtocolContext {
    pub store: Arc<KvStore>,
    pub peers: Arc<PeerManager>,
    pub events: mpsc::Sender<EventEnvelope>,
    pub local: LocalNode,
}

/// One live session as the handler sees it.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ConnectionInfo {
    pub fn multiaddr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Serve `bc.block.{n}` for `n` in `[max(RANGE_FLOOR, low), high]`, highest
/// first. Missing heights shorten the list; they are never an error.
pub fn serve_range(store: &KvStore, low: u64, high: u64) -> Vec<CompositeBlock> {
    let low = low.max(RANGE_FLOOR);
    if high < low {
        return Vec::new();
    }
    let keys: Vec<String> = (low..=high).map(keys::block).collect();
    let mut blocks = store.get_bulk(&keys);
    blocks.sort_by(|a, b| b.height.cmp(&a.height));
    blocks
}

/// Handle one reassembled message. Returns the frame to write back, if the
/// message warrants a direct reply.
pub async fn handle_message(
    ctx: &ProtocolContext,
    conn: &ConnectionInfo,
    raw: &[u8],
) -> Result<Option<Vec<u8>>, CodecError> {
    let message = ProtocolMessage::decode(raw)?;
    let reply = match message {
        ProtocolMessage::Intro {
            host,
            port,
            peer_id,
        } => {
            debug!(%peer_id, %host, port, "peer introduced itself");
            ctx.peers
                .set_peer_identity(&conn.multiaddr(), peer_id)
                .await;
            None
        }
        ProtocolMessage::ListServices => {
            let tags = FrameTag::ALL
                .iter()
                .map(|t| String::from_utf8_lossy(t.as_bytes()).to_string())
                .collect();
            Some(ProtocolMessage::Services(tags))
        }
        ProtocolMessage::Services(tags) => {
            debug!(peer = %conn.multiaddr(), count = tags.len(), "peer services listed");
            None
        }
        ProtocolMessage::GetHighest => ctx
            .store
            .get_block(keys::LATEST, true)
            .ok()
            .flatten()
            .map(ProtocolMessage::Highest),
        ProtocolMessage::GetBlockRange { low, high } => Some(ProtocolMessage::BlockList(
            serve_range(&ctx.store, low, high),
        )),
        ProtocolMessage::GetMultiverse { low, high } => Some(ProtocolMessage::MultiverseList(
            serve_range(&ctx.store, low, high),
        )),
        ProtocolMessage::Highest(block) => {
            ctx.peers
                .set_peer_height(&conn.multiaddr(), block.height)
                .await;
            emit(ctx, conn, Event::PutBlock(block)).await;
            None
        }
        ProtocolMessage::BlockList(mut blocks) => {
            blocks.sort_by(|a, b| b.height.cmp(&a.height));
            emit(ctx, conn, Event::PutBlockList(blocks)).await;
            None
        }
        ProtocolMessage::MultiverseList(mut blocks) => {
            blocks.sort_by(|a, b| b.height.cmp(&a.height));
            emit(ctx, conn, Event::PutMultiverse(blocks)).await;
            None
        }
    };

    match reply {
        None => Ok(None),
        Some(message) => match message.encode() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                // our own state failed to serialize; drop the reply, not the peer
                warn!("failed to encode reply: {e}");
                Ok(None)
            }
        },
    }
}

async fn emit(ctx: &ProtocolContext, conn: &ConnectionInfo, event: Event) {
    let envelope = EventEnvelope {
        event,
        remote_host: conn.remote_host.clone(),
        remote_port: conn.remote_port,
        connection_id: conn.id,
    };
    if ctx.events.send(envelope).await.is_err() {
        warn!("engine bus closed, dropping inbound event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::types::CompositeBlock;

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
            id: 7,
            remote_host: "10.0.0.9".to_string(),
            remote_port: 16061,
        }
    }

    fn stored_block(store: &KvStore, height: u64) -> CompositeBlock {
        let mut b = CompositeBlock::genesis("testnet");
        b.height = height;
        b.seal();
        store.put_block(&keys::block(height), &b).unwrap();
        b
    }

    #[tokio::test]
    async fn range_request_serves_persisted_blocks_descending() {
        let (ctx, _rx) = context();
        for h in [5u64, 6, 7] {
            stored_block(&ctx.store, h);
        }
        // heights 5..=8 requested, 8 missing
        let request = ProtocolMessage::GetBlockRange { low: 5, high: 8 }
            .encode()
            .unwrap();
        let reply = handle_message(&ctx, &conn(), &request)
            .await
            .unwrap()
            .unwrap();
        match ProtocolMessage::decode(&reply).unwrap() {
            ProtocolMessage::BlockList(blocks) => {
                let heights: Vec<u64> = blocks.iter().map(|b| b.height).collect();
                assert_eq!(heights, vec![7, 6, 5]);
            }
            other => panic!("expected BlockList, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn range_floor_excludes_genesis() {
        let (ctx, _rx) = context();
        stored_block(&ctx.store, 2);
        let blocks = serve_range(&ctx.store, 0, 3);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].height, 2);
    }

    #[tokio::test]
    async fn get_highest_answers_with_the_tip() {
        let (ctx, _rx) = context();
        let tip = CompositeBlock::genesis("testnet");
        ctx.store.put_block(keys::LATEST, &tip).unwrap();

        let request = ProtocolMessage::GetHighest.encode().unwrap();
        let reply = handle_message(&ctx, &conn(), &request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ProtocolMessage::decode(&reply).unwrap(),
            ProtocolMessage::Highest(tip)
        );
    }

    #[tokio::test]
    async fn announce_becomes_a_put_block_event() {
        let (ctx, mut rx) = context();
        let block = CompositeBlock::genesis("testnet");
        let wire = ProtocolMessage::Highest(block.clone()).encode().unwrap();
        let reply = handle_message(&ctx, &conn(), &wire).await.unwrap();
        assert!(reply.is_none());

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.connection_id, 7);
        assert_eq!(envelope.remote_host, "10.0.0.9");
        match envelope.event {
            Event::PutBlock(b) => assert_eq!(b, block),
            other => panic!("expected PutBlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_lists_are_sorted_descending() {
        let (ctx, mut rx) = context();
        let mut low = CompositeBlock::genesis("testnet");
        low.height = 4;
        low.seal();
        let mut high = CompositeBlock::genesis("testnet");
        high.height = 9;
        high.seal();

        let wire = ProtocolMessage::BlockList(vec![low, high]).encode().unwrap();
        handle_message(&ctx, &conn(), &wire).await.unwrap();
        match rx.recv().await.unwrap().event {
            Event::PutBlockList(blocks) => {
                assert_eq!(blocks[0].height, 9);
                assert_eq!(blocks[1].height, 4);
            }
            other => panic!("expected PutBlockList, got {other:?}"),
        }
    }
}
