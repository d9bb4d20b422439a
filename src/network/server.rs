//! TCP transport for the block-exchange protocol.
//!
//! One accept loop, one task per connection. Each connection owns a
//! reassembly buffer and a writer task fed through the connection registry,
//! which is how the engine reaches peers for announcements and range
//! requests. Outbound dialing shares the same connection task.

use crate::constants::protocol::CONTINUATION_CHUNK_BYTES;
use crate::constants::sync::DIAL_INTERVAL_SECS;
use crate::error::TransportError;
use crate::network::frame::ChunkAssembler;
use crate::network::message::ProtocolMessage;
use crate::network::protocol::{handle_message, ConnectionInfo, ProtocolContext};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub multiaddr: String,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// Live connections, shared between the accept loop, the dial loop and the
/// engine.
pub struct ConnectionRegistry {
    connections: DashMap<u64, ConnectionHandle>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, multiaddr: String) -> (ConnectionHandle, mpsc::Receiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        let handle = ConnectionHandle {
            id,
            multiaddr,
            outbound: tx,
        };
        self.connections.insert(id, handle.clone());
        (handle, rx)
    }

    pub fn remove(&self, id: u64) {
        self.connections.remove(&id);
    }

    pub fn is_connected(&self, multiaddr: &str) -> bool {
        self.connections.iter().any(|c| c.multiaddr == multiaddr)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Queue a frame to one connection.
    pub async fn send_to(&self, id: u64, frame: Vec<u8>) -> Result<(), TransportError> {
        let handle = self
            .connections
            .get(&id)
            .map(|c| c.clone())
            .ok_or(TransportError::ConnectionGone(id))?;
        handle
            .outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionGone(id))
    }

    /// Queue a frame to every connection except `except`. Returns how many
    /// peers it reached.
    pub async fn broadcast(&self, frame: &[u8], except: Option<u64>) -> usize {
        let handles: Vec<ConnectionHandle> =
            self.connections.iter().map(|c| c.clone()).collect();
        let mut reached = 0;
        for handle in handles {
            if Some(handle.id) == except {
                continue;
            }
            if handle.outbound.send(frame.to_vec()).await.is_ok() {
                reached += 1;
            }
        }
        reached
    }
}

pub struct NetworkServer {
    listener: TcpListener,
    ctx: ProtocolContext,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
}

impl NetworkServer {
    pub async fn bind(
        bind_addr: &str,
        ctx: ProtocolContext,
        registry: Arc<ConnectionRegistry>,
        cancel: CancellationToken,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!(addr = %listener.local_addr()?, "p2p listener up");
        Ok(Self {
            listener,
            ctx,
            registry,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            if self.ctx.peers.is_banned(&addr.to_string()).await {
                debug!(%addr, "refusing banned peer");
                continue;
            }
            configure_socket(&stream, &addr);

            let ctx = self.ctx.clone();
            let registry = self.registry.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                connection_task(stream, ctx, registry, cancel).await;
            });
        }
        info!("p2p listener stopped");
    }
}

fn configure_socket(stream: &TcpStream, addr: &std::net::SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(std::time::Duration::from_secs(30))
        .with_interval(std::time::Duration::from_secs(10));
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP_KEEPALIVE for {}: {}", addr, e);
    }
}

/// Dial one peer and run a session over the resulting stream.
pub async fn dial(
    addr: &str,
    ctx: ProtocolContext,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    if let Ok(peer_addr) = stream.peer_addr() {
        configure_socket(&stream, &peer_addr);
    }
    tokio::spawn(async move {
        connection_task(stream, ctx, registry, cancel).await;
    });
    Ok(())
}

/// Dial discovered peers until quorum holds; re-armed whenever the peer
/// manager reactivates discovery.
pub async fn run_dial_loop(
    ctx: ProtocolContext,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(DIAL_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if ctx.peers.connected_count().await >= ctx.peers.quorum() {
            continue;
        }
        for addr in ctx.peers.dial_candidates().await {
            if registry.is_connected(&addr) {
                continue;
            }
            ctx.peers.record_dial_attempt(&addr).await;
            match dial(&addr, ctx.clone(), registry.clone(), cancel.clone()).await {
                Ok(()) => debug!(%addr, "dialed peer"),
                Err(e) => debug!(%addr, "dial failed: {e}"),
            }
        }
    }
}

/// One session: greet, then read chunks, reassemble, route, reply.
async fn connection_task(
    stream: TcpStream,
    ctx: ProtocolContext,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    let Ok(peer_addr) = stream.peer_addr() else {
        return;
    };
    let multiaddr = peer_addr.to_string();
    let (handle, mut outbound_rx) = registry.insert(multiaddr.clone());
    let conn = ConnectionInfo {
        id: handle.id,
        remote_host: peer_addr.ip().to_string(),
        remote_port: peer_addr.port(),
    };
    info!(peer = %multiaddr, id = conn.id, "peer session up");
    ctx.peers.on_peer_connected(&multiaddr).await;

    let (mut read_half, mut write_half) = stream.into_split();
    let writer_peer = multiaddr.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_half.write_all(&frame).await {
                debug!(peer = %writer_peer, "write failed: {e}");
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    greet(&ctx, &handle).await;

    let mut assembler = ChunkAssembler::new();
    let mut chunk = vec![0u8; CONTINUATION_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_half.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %multiaddr, "read failed: {e}");
                break;
            }
        };
        let message = match assembler.push(&chunk[..n]) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                warn!(peer = %multiaddr, "reassembly failed: {e}");
                if ctx.peers.record_codec_error(&multiaddr).await {
                    break;
                }
                continue;
            }
        };
        match handle_message(&ctx, &conn, &message).await {
            Ok(Some(reply)) => {
                if handle.outbound.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %multiaddr, "dropping undecodable message: {e}");
                if ctx.peers.record_codec_error(&multiaddr).await {
                    break;
                }
            }
        }
    }

    registry.remove(conn.id);
    ctx.peers.on_peer_disconnected(&multiaddr).await;
    writer.abort();
    info!(peer = %multiaddr, id = conn.id, "peer session down");
}

/// Introduce ourselves and ask for the peer's tip, as every session opens.
async fn greet(ctx: &ProtocolContext, handle: &ConnectionHandle) {
    let intro = ProtocolMessage::Intro {
        host: ctx.local.host.clone(),
        port: ctx.local.port,
        peer_id: ctx.local.peer_id.clone(),
    };
    for message in [intro, ProtocolMessage::GetHighest] {
        match message.encode() {
            Ok(frame) => {
                if handle.outbound.send(frame).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("failed to encode greeting: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EventEnvelope;
    use crate::network::protocol::LocalNode;
    use crate::peer_manager::PeerManager;
    use crate::store::KvStore;

    fn test_ctx() -> (ProtocolContext, mpsc::Receiver<EventEnvelope>) {
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
                    port: 0,
                    peer_id: "test-node".to_string(),
                },
            },
            rx,
        )
    }

    #[tokio::test]
    async fn sessions_greet_with_intro_and_get_highest() {
        let (ctx, _rx) = test_ctx();
        let registry = Arc::new(ConnectionRegistry::new());
        let cancel = CancellationToken::new();

        let server = NetworkServer::bind("127.0.0.1:0", ctx, registry, cancel.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let mut client = TcpStream::connect(addr).await.unwrap();
        // the two greeting frames may arrive in one read or two
        let mut greeting = Vec::new();
        let mut buf = vec![0u8; 4096];
        while !greeting.ends_with(b"0008R01[*]") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the greeting completed");
            greeting.extend_from_slice(&buf[..n]);
        }
        assert!(greeting.starts_with(b"0000R01[*]127.0.0.1[*]0[*]test-node"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn registry_broadcast_skips_the_origin() {
        let registry = ConnectionRegistry::new();
        let (a, mut a_rx) = registry.insert("a:1".to_string());
        let (_b, mut b_rx) = registry.insert("b:1".to_string());

        let reached = registry.broadcast(b"frame", Some(a.id)).await;
        assert_eq!(reached, 1);
        assert_eq!(b_rx.recv().await.unwrap(), b"frame".to_vec());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unknown_connection_errors() {
        let registry = ConnectionRegistry::new();
        assert!(matches!(
            registry.send_to(99, b"frame".to_vec()).await,
            Err(TransportError::ConnectionGone(99))
        ));
    }
}
