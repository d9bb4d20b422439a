//! Peer book and quorum policy for the overlay.
//!
//! Peers move between three partitions: `discovered` (dialable candidates),
//! `connected` (live sessions), and `banned`. The connected count is
//! measured against the network quorum; discovery runs only while the node
//! is below quorum.

use crate::constants::protocol::CODEC_ERROR_LIMIT;
use crate::constants::sync::MAX_DIAL_ATTEMPTS;
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Base58 peer identity; unknown until the peer introduces itself.
    pub id: Option<String>,
    pub multiaddr: String,
    pub connected_at: i64,
    #[serde(default)]
    pub meta: PeerMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerMeta {
    /// Height the peer last advertised.
    pub best_height: u64,
    pub codec_errors: u32,
    pub dial_attempts: u32,
    pub last_attempt: i64,
}

impl Peer {
    fn candidate(multiaddr: String) -> Self {
        Self {
            id: None,
            multiaddr,
            connected_at: 0,
            meta: PeerMeta::default(),
        }
    }
}

pub struct PeerManager {
    discovered: RwLock<HashMap<String, Peer>>,
    connected: RwLock<HashMap<String, Peer>>,
    banned: RwLock<HashSet<String>>,
    store: Arc<KvStore>,
    quorum: u64,
    low_health: bool,
    discovery_active: AtomicBool,
}

impl PeerManager {
    pub fn new(store: Arc<KvStore>, quorum: u64, low_health: bool) -> Self {
        Self {
            discovered: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
            banned: RwLock::new(HashSet::new()),
            store,
            quorum,
            low_health,
            discovery_active: AtomicBool::new(true),
        }
    }

    pub fn quorum(&self) -> u64 {
        self.quorum
    }

    pub fn discovery_active(&self) -> bool {
        self.discovery_active.load(Ordering::SeqCst)
    }

    /// Add a dialable candidate. Returns false for known or banned peers.
    pub async fn add_discovered(&self, multiaddr: String) -> bool {
        if self.banned.read().await.contains(&multiaddr) {
            return false;
        }
        if self.connected.read().await.contains_key(&multiaddr) {
            return false;
        }
        let mut discovered = self.discovered.write().await;
        if discovered.contains_key(&multiaddr) {
            return false;
        }
        discovered.insert(multiaddr.clone(), Peer::candidate(multiaddr));
        true
    }

    /// Candidates still worth dialing this pass.
    pub async fn dial_candidates(&self) -> Vec<String> {
        if !self.discovery_active() {
            return Vec::new();
        }
        self.discovered
            .read()
            .await
            .values()
            .filter(|p| p.meta.dial_attempts < MAX_DIAL_ATTEMPTS)
            .map(|p| p.multiaddr.clone())
            .collect()
    }

    pub async fn record_dial_attempt(&self, multiaddr: &str) {
        if let Some(peer) = self.discovered.write().await.get_mut(multiaddr) {
            peer.meta.dial_attempts += 1;
            peer.meta.last_attempt = chrono::Utc::now().timestamp();
        }
    }

    /// A session came up. The first connected peer seeds the persisted
    /// quorum at 1; a low-health overlay pins it there on every connect.
    /// Discovery pauses once the connected count reaches quorum.
    pub async fn on_peer_connected(&self, multiaddr: &str) {
        let mut peer = self
            .discovered
            .write()
            .await
            .remove(multiaddr)
            .unwrap_or_else(|| Peer::candidate(multiaddr.to_string()));
        peer.connected_at = chrono::Utc::now().timestamp();

        let mut connected = self.connected.write().await;
        connected.insert(multiaddr.to_string(), peer);
        let count = connected.len() as u64;
        drop(connected);

        if self.low_health {
            if let Err(e) = self.store.put_quorum(1) {
                warn!("failed to pin low-health quorum: {e}");
            }
        } else if count == 1 {
            match self.store.get_quorum() {
                Ok(Some(_)) => {}
                _ => {
                    if let Err(e) = self.store.put_quorum(1) {
                        warn!("failed to seed quorum: {e}");
                    }
                }
            }
        }

        if count >= self.quorum && self.discovery_active.swap(false, Ordering::SeqCst) {
            info!(count, quorum = self.quorum, "quorum reached, pausing discovery");
        }
    }

    /// A session dropped. Returns true when the loss broke quorum and
    /// discovery was restarted.
    pub async fn on_peer_disconnected(&self, multiaddr: &str) -> bool {
        let mut connected = self.connected.write().await;
        let dropped = connected.remove(multiaddr);
        let count = connected.len() as u64;
        drop(connected);

        if let Some(peer) = dropped {
            // keep the address dialable unless it was banned
            if !self.banned.read().await.contains(multiaddr) {
                self.discovered
                    .write()
                    .await
                    .entry(multiaddr.to_string())
                    .or_insert(peer);
            }
        }

        if count < self.quorum && !self.discovery_active.swap(true, Ordering::SeqCst) {
            warn!(count, quorum = self.quorum, "quorum lost, restarting discovery");
            return true;
        }
        false
    }

    /// Record the identity a peer introduced itself with.
    pub async fn set_peer_identity(&self, multiaddr: &str, id: String) {
        if let Some(peer) = self.connected.write().await.get_mut(multiaddr) {
            peer.id = Some(id);
        }
    }

    pub async fn set_peer_height(&self, multiaddr: &str, height: u64) {
        if let Some(peer) = self.connected.write().await.get_mut(multiaddr) {
            peer.meta.best_height = peer.meta.best_height.max(height);
        }
    }

    /// Count one codec error against a peer. Returns true once the peer
    /// crossed the limit and was banned; the caller drops the connection.
    pub async fn record_codec_error(&self, multiaddr: &str) -> bool {
        let mut connected = self.connected.write().await;
        let Some(peer) = connected.get_mut(multiaddr) else {
            return false;
        };
        peer.meta.codec_errors += 1;
        let over_limit = peer.meta.codec_errors >= CODEC_ERROR_LIMIT;
        if over_limit {
            debug!(%multiaddr, errors = peer.meta.codec_errors, "codec error limit reached");
        }
        drop(connected);
        if over_limit {
            self.ban(multiaddr).await;
        }
        over_limit
    }

    pub async fn ban(&self, multiaddr: &str) {
        warn!(%multiaddr, "banning peer");
        self.banned.write().await.insert(multiaddr.to_string());
        self.discovered.write().await.remove(multiaddr);
        self.connected.write().await.remove(multiaddr);
    }

    pub async fn is_banned(&self, multiaddr: &str) -> bool {
        self.banned.read().await.contains(multiaddr)
    }

    pub async fn connected_count(&self) -> u64 {
        self.connected.read().await.len() as u64
    }

    pub async fn connected_peers(&self) -> Vec<Peer> {
        self.connected.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(quorum: u64, low_health: bool) -> PeerManager {
        let store = Arc::new(KvStore::open_temporary().unwrap());
        PeerManager::new(store, quorum, low_health)
    }

    #[tokio::test]
    async fn first_peer_seeds_quorum() {
        let pm = manager(3, false);
        pm.add_discovered("10.0.0.1:16061".to_string()).await;
        pm.on_peer_connected("10.0.0.1:16061").await;
        assert_eq!(pm.store.get_quorum().unwrap(), Some(1));
        assert!(pm.discovery_active(), "one of three is below quorum");
    }

    #[tokio::test]
    async fn low_health_pins_quorum_on_every_connect() {
        let pm = manager(3, true);
        pm.store.put_quorum(3).unwrap();
        pm.on_peer_connected("10.0.0.1:16061").await;
        assert_eq!(pm.store.get_quorum().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn discovery_pauses_at_quorum_and_resumes_on_loss() {
        let pm = manager(2, false);
        pm.on_peer_connected("a:1").await;
        assert!(pm.discovery_active());
        pm.on_peer_connected("b:1").await;
        assert!(!pm.discovery_active());

        assert!(pm.on_peer_disconnected("a:1").await);
        assert!(pm.discovery_active());
        // the dropped peer is dialable again
        assert!(pm.dial_candidates().await.contains(&"a:1".to_string()));
    }

    #[tokio::test]
    async fn repeated_codec_errors_ban_the_peer() {
        let pm = manager(1, false);
        pm.on_peer_connected("bad:1").await;
        for _ in 0..CODEC_ERROR_LIMIT - 1 {
            assert!(!pm.record_codec_error("bad:1").await);
        }
        assert!(pm.record_codec_error("bad:1").await);
        assert!(pm.is_banned("bad:1").await);
        assert!(!pm.add_discovered("bad:1".to_string()).await);
    }

    #[tokio::test]
    async fn exhausted_candidates_are_not_redialed() {
        let pm = manager(2, false);
        pm.add_discovered("slow:1".to_string()).await;
        for _ in 0..MAX_DIAL_ATTEMPTS {
            pm.record_dial_attempt("slow:1").await;
        }
        assert!(pm.dial_candidates().await.is_empty());
    }
}
