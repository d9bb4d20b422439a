//! Orchestrator: owns the multiverse, the pools, the peer book and the
//! event bus, and is the only writer of chain state.
//!
//! Every inbound frame and every mined solution funnels into the engine's
//! single event loop, which keeps `add_next_block` strictly serialized.
//! Collaborating tasks (listener, dial loop, worker readers) only ever talk
//! to the engine through channels.

use crate::block::types::{ChildHeader, CompositeBlock};
use crate::block_pool::BlockPool;
use crate::config::Config;
use crate::constants::protocol::{RANGE_FLOOR, TIP_PUSH_LEAD};
use crate::constants::worker::HEARTBEAT_INTERVAL;
use crate::error::{NodeError, StoreError};
use crate::identity::NodeIdentity;
use crate::multiverse::Multiverse;
use crate::network::message::ProtocolMessage;
use crate::network::protocol::{LocalNode, ProtocolContext};
use crate::network::server::ConnectionRegistry;
use crate::peer_manager::PeerManager;
use crate::store::{keys, KvStore};
use crate::worker::pool::{MinedSolution, WorkerPool};
use crate::worker::protocol::{WorkOrder, WorkerMessage};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything that travels on the internal bus.
#[derive(Clone, Debug)]
pub enum Event {
    /// A single block arrived (announce or tip response).
    PutBlock(CompositeBlock),
    /// A full-sync range arrived, highest first.
    PutBlockList(Vec<CompositeBlock>),
    /// A selective-sync range arrived, highest first.
    PutMultiverse(Vec<CompositeBlock>),
    /// Broadcast an adopted block to peers.
    AnnounceNewBlock(CompositeBlock),
    /// Queue a raw frame to one connection.
    Qsend(Vec<u8>),
    /// Request a full-sync range from a peer.
    GetBlockList { low: u64, high: u64 },
    /// Request a selective-sync range from a peer.
    GetMultiverse { low: u64, high: u64 },
}

/// Bus envelope; origin fields are zero for engine-internal events.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub event: Event,
    pub remote_host: String,
    pub remote_port: u16,
    pub connection_id: u64,
}

impl EventEnvelope {
    pub fn internal(event: Event) -> Self {
        Self {
            event,
            remote_host: String::new(),
            remote_port: 0,
            connection_id: 0,
        }
    }
}

enum Wake {
    Envelope(EventEnvelope),
    Worker(u32, WorkerMessage),
    Tick,
    Shutdown,
}

pub struct Engine {
    config: Config,
    store: Arc<KvStore>,
    multiverse: Multiverse,
    block_pool: BlockPool,
    worker_pool: WorkerPool,
    peers: Arc<PeerManager>,
    registry: Arc<ConnectionRegistry>,
    events_tx: mpsc::Sender<EventEnvelope>,
    events_rx: mpsc::Receiver<EventEnvelope>,
    genesis: CompositeBlock,
    local: LocalNode,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, NodeError> {
        let network_type = config.node.network_type();
        let data_dir = Path::new(&config.storage.data_dir);
        std::fs::create_dir_all(data_dir)?;

        let store = Arc::new(KvStore::open(&data_dir.join("db"))?);
        let genesis = ensure_genesis(&store, network_type.name())?;

        let identity = NodeIdentity::load_or_generate(data_dir)
            .map_err(|e| NodeError::Initialization(e.to_string()))?;
        let peer_id = identity.peer_id().to_string();
        let miner_key = config
            .mining
            .miner_key
            .clone()
            .unwrap_or_else(|| peer_id.clone());

        let listen = config.network.full_listen_address(&network_type);
        let (host, port) = split_host_port(&listen);
        let local = LocalNode {
            host,
            port,
            peer_id,
        };

        let quorum = config.network.effective_quorum(&network_type);
        let peers = Arc::new(PeerManager::new(
            store.clone(),
            quorum,
            config.network.low_health_net,
        ));

        let multiverse = Multiverse::new(
            store.clone(),
            genesis.clone(),
            config.node.strict_sequence_check,
        );
        let worker_pool = WorkerPool::new(
            data_dir,
            config.mining.effective_workers(),
            miner_key,
            config.node.rovers.iter().cloned().collect(),
        );

        let (events_tx, events_rx) = mpsc::channel(1024);
        Ok(Self {
            config,
            store,
            multiverse,
            block_pool: BlockPool::new(),
            worker_pool,
            peers,
            registry: Arc::new(ConnectionRegistry::new()),
            events_tx,
            events_rx,
            genesis,
            local,
            cancel,
        })
    }

    pub fn protocol_context(&self) -> ProtocolContext {
        ProtocolContext {
            store: self.store.clone(),
            peers: self.peers.clone(),
            events: self.events_tx.clone(),
            local: self.local.clone(),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<KvStore> {
        self.store.clone()
    }

    pub fn events_sender(&self) -> mpsc::Sender<EventEnvelope> {
        self.events_tx.clone()
    }

    /// Run the node until cancellation. Pool-init failure and a tip-write
    /// failure are the two fatal paths; everything else is absorbed.
    pub async fn run(mut self) -> Result<(), NodeError> {
        if let Some(tip) = self.store.get_block(keys::LATEST, true)? {
            info!(height = tip.height, hash = %tip.hash, "resuming from persisted tip");
            self.multiverse.adopt_sequence(vec![tip]);
        }
        for addr in self.config.network.bootstrap_peers.clone() {
            self.peers.add_discovered(addr).await;
        }

        self.worker_pool.init().await?;
        self.worker_pool.all_rise().await?;
        self.rearm_workers().await;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Shutdown,
                envelope = self.events_rx.recv() => match envelope {
                    Some(envelope) => Wake::Envelope(envelope),
                    None => Wake::Shutdown,
                },
                message = self.worker_pool.next_message() => match message {
                    Some((pid, message)) => Wake::Worker(pid, message),
                    None => Wake::Shutdown,
                },
                _ = heartbeat.tick() => Wake::Tick,
            };
            match wake {
                Wake::Envelope(envelope) => self.handle_event(envelope).await?,
                Wake::Worker(pid, message) => {
                    if let Some(solution) = self.worker_pool.handle_message(pid, message) {
                        self.handle_solution(solution).await?;
                    }
                }
                Wake::Tick => {
                    self.worker_pool.tick().await?;
                    if !self.worker_pool.health_check() {
                        warn!("worker pool unhealthy, restarting the session");
                        self.worker_pool.all_dismissed().await;
                        self.worker_pool.init().await?;
                        self.worker_pool.all_rise().await?;
                        self.rearm_workers().await;
                    }
                }
                Wake::Shutdown => break,
            }
        }

        info!("engine shutting down");
        self.worker_pool.all_dismissed().await;
        self.store.flush()?;
        Ok(())
    }

    /// Single dispatcher for the bus. Only fatal errors escape.
    pub async fn handle_event(&mut self, envelope: EventEnvelope) -> Result<(), NodeError> {
        let origin = envelope.connection_id;
        match envelope.event {
            Event::PutBlock(block) => self.process_block(block, origin).await?,
            Event::PutBlockList(blocks) => self.process_range(blocks, origin).await?,
            Event::PutMultiverse(blocks) => self.process_range(blocks, origin).await?,
            Event::AnnounceNewBlock(block) => {
                match ProtocolMessage::Highest(block).encode() {
                    Ok(frame) => {
                        let except = (origin != 0).then_some(origin);
                        let reached = self.registry.broadcast(&frame, except).await;
                        debug!(reached, "announced new tip");
                    }
                    Err(e) => warn!("failed to encode announcement: {e}"),
                }
            }
            Event::Qsend(frame) => {
                if let Err(e) = self.registry.send_to(origin, frame).await {
                    debug!("qsend dropped: {e}");
                }
            }
            Event::GetBlockList { low, high } => {
                self.enqueue_send(ProtocolMessage::GetBlockRange { low, high }, origin)
                    .await;
            }
            Event::GetMultiverse { low, high } => {
                self.enqueue_send(ProtocolMessage::GetMultiverse { low, high }, origin)
                    .await;
            }
        }
        Ok(())
    }

    /// Outbound requests go back over the bus as `Qsend` so every socket
    /// write funnels through the same dispatcher.
    async fn enqueue_send(&mut self, message: ProtocolMessage, connection_id: u64) {
        match message.encode() {
            Ok(frame) => {
                let envelope = EventEnvelope {
                    event: Event::Qsend(frame),
                    remote_host: String::new(),
                    remote_port: 0,
                    connection_id,
                };
                if self.events_tx.send(envelope).await.is_err() {
                    warn!("bus closed, outbound request dropped");
                }
            }
            Err(e) => warn!("failed to encode outbound request: {e}"),
        }
    }

    /// One arriving block: adopt, buffer, or trigger a resync.
    async fn process_block(&mut self, block: CompositeBlock, origin: u64) -> Result<(), NodeError> {
        // a peer far behind gets our tip pushed back instead
        if let Some(tip) = self.store.get_block(keys::LATEST, true)? {
            if origin != 0 && tip.height >= block.height + TIP_PUSH_LEAD {
                debug!(
                    peer_height = block.height,
                    local_height = tip.height,
                    "peer is behind, pushing our tip"
                );
                if let Ok(frame) = ProtocolMessage::Highest(tip).encode() {
                    let _ = self.registry.send_to(origin, frame).await;
                }
                return Ok(());
            }
        }

        if self.multiverse.has_block(&block) {
            return Ok(());
        }
        if self.block_pool.is_syncing() {
            if self.block_pool.buffer(block.clone()) {
                debug!(height = block.height, "buffered candidate during sync");
                if let Err(e) = self
                    .store
                    .put_block(&keys::pending_block(block.height), &block)
                {
                    warn!("failed to persist pending candidate: {e}");
                }
            }
            return Ok(());
        }

        if self.multiverse.add_next_block(block.clone()) {
            self.commit_and_announce(&block, origin).await?;
        } else if self.multiverse.add_resync_request(&block, true) {
            self.start_resync(&block, origin).await;
        }
        Ok(())
    }

    /// Persist the adopted tip and fan out. The tip write is the one store
    /// failure the node will not survive.
    async fn commit_and_announce(
        &mut self,
        block: &CompositeBlock,
        origin: u64,
    ) -> Result<(), NodeError> {
        let parent = self.multiverse.get_parent_highest().cloned();
        if let Err(e) = self.store.commit_tip(block, parent.as_ref()) {
            error!("tip write failed: {e}");
            return Err(e.into());
        }
        let envelope = EventEnvelope {
            event: Event::AnnounceNewBlock(block.clone()),
            remote_host: String::new(),
            remote_port: 0,
            connection_id: origin,
        };
        if self.events_tx.send(envelope).await.is_err() {
            warn!("bus closed, tip not announced");
        }
        self.rearm_workers().await;
        Ok(())
    }

    /// A downloaded range, highest first. Adopt it wholesale when it links
    /// back to a persisted boundary, then release anything parked above it.
    async fn process_range(
        &mut self,
        blocks: Vec<CompositeBlock>,
        origin: u64,
    ) -> Result<(), NodeError> {
        if blocks.is_empty() {
            debug!("peer served an empty range");
            self.finish_sync().await;
            return Ok(());
        }
        if let Err(e) = self.multiverse.validate_block_sequence_inline(&blocks) {
            warn!("rejecting served range: {e}");
            self.finish_sync().await;
            return Ok(());
        }

        for block in blocks.iter().rev() {
            self.store.put_block(&keys::block(block.height), block)?;
        }
        let tip = blocks[0].clone();
        self.multiverse.adopt_sequence(blocks);
        self.store
            .commit_tip(&tip, self.multiverse.get_parent_highest())?;
        info!(height = tip.height, hash = %tip.hash, "adopted synced range");

        self.finish_sync().await;

        // anything gossiped above the range while we were syncing
        let parked = self.block_pool.drain_sequence(tip.height + 1);
        for block in parked {
            if let Err(e) = self.store.del(&keys::pending_block(block.height)) {
                warn!("failed to drop pending candidate record: {e}");
            }
            if self.multiverse.add_next_block(block.clone()) {
                self.commit_and_announce(&block, 0).await?;
            }
        }

        let envelope = EventEnvelope {
            event: Event::AnnounceNewBlock(tip),
            remote_host: String::new(),
            remote_port: 0,
            connection_id: origin,
        };
        let _ = self.events_tx.send(envelope).await;
        self.rearm_workers().await;
        Ok(())
    }

    /// Grant a resync: stamp the synclock, pause mining, buffer gossip, and
    /// ask the announcing peer for the missing range.
    async fn start_resync(&mut self, boundary: &CompositeBlock, origin: u64) {
        if let Err(e) = self.store.put_block(keys::SYNCLOCK, boundary) {
            warn!("failed to stamp synclock, resync skipped: {e}");
            return;
        }
        let local_height = self
            .store
            .get_block(keys::LATEST, true)
            .ok()
            .flatten()
            .map(|tip| tip.height)
            .unwrap_or(crate::constants::chain::GENESIS_HEIGHT);

        info!(
            from = local_height,
            to = boundary.height,
            "pausing mining for resync"
        );
        self.worker_pool.abort_all().await;
        self.block_pool.begin_sync(local_height);

        let low = (local_height + 1).max(RANGE_FLOOR);
        let envelope = EventEnvelope {
            event: Event::GetBlockList {
                low,
                high: boundary.height,
            },
            remote_host: String::new(),
            remote_port: 0,
            connection_id: origin,
        };
        let _ = self.events_tx.send(envelope).await;
    }

    /// Leave sync mode and release the synclock sentinel.
    async fn finish_sync(&mut self) {
        if !self.block_pool.is_syncing() {
            return;
        }
        self.block_pool.end_sync();
        if let Err(e) = self.store.put_block(keys::SYNCLOCK, &self.genesis) {
            warn!("failed to release synclock: {e}");
        }
    }

    /// A worker found a block: run it through the same acceptance path as
    /// any gossiped block.
    async fn handle_solution(&mut self, solution: MinedSolution) -> Result<(), NodeError> {
        info!(
            pid = solution.pid,
            height = solution.block.height,
            iterations = solution.iterations,
            time_diff_ms = solution.time_diff,
            "worker found a block"
        );
        self.process_block(solution.block, 0).await
    }

    /// Assemble the next work order from the tip and the freshest rover
    /// headers, and hand it to the pool.
    async fn rearm_workers(&mut self) {
        if self.block_pool.is_syncing() {
            return;
        }
        let Ok(Some(tip)) = self.store.get_block(keys::LATEST, true) else {
            return;
        };
        let headers = self.collect_rover_headers();
        let order = WorkOrder {
            difficulty: tip.difficulty.clone(),
            miner_key: self.worker_pool.miner_key().to_string(),
            previous_block: tip,
            headers,
        };
        self.worker_pool.distribute_work(order).await;
    }

    /// Latest persisted header per rover chain, as the rovers left them.
    fn collect_rover_headers(&self) -> BTreeMap<String, Vec<ChildHeader>> {
        let mut headers = BTreeMap::new();
        for chain in self.worker_pool.rovers() {
            let key = keys::child_latest(chain);
            match self.store.get_raw(&key, true) {
                Ok(Some(raw)) => match bincode::deserialize::<ChildHeader>(&raw) {
                    Ok(header) => {
                        headers.insert(chain.clone(), vec![header]);
                    }
                    Err(e) => debug!(%chain, "undecodable rover tip: {e}"),
                },
                _ => debug!(%chain, "no rover tip yet"),
            }
        }
        headers
    }
}

/// Seed an empty store with the deterministic genesis block and an
/// unlocked synclock.
fn ensure_genesis(store: &KvStore, network: &str) -> Result<CompositeBlock, StoreError> {
    let genesis = CompositeBlock::genesis(network);
    if store.get_block(keys::LATEST, true)?.is_none() {
        store.put_block(&keys::block(genesis.height), &genesis)?;
        store.put_block(keys::LATEST, &genesis)?;
        store.put_block(keys::SYNCLOCK, &genesis)?;
        store.flush()?;
        info!(hash = %genesis.hash, "seeded genesis");
    }
    Ok(genesis)
}

fn split_host_port(listen: &str) -> (String, u16) {
    match listen.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>().unwrap_or_default(),
        ),
        None => (listen.to_string(), 0),
    }
}
