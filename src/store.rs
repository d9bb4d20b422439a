//! Namespaced key-value facade over sled.
//!
//! Every durable record the node touches goes through this facade; callers
//! never see the underlying tree. Reads can be soft-failed: a read error is
//! logged and reported as absence instead of propagating, which keeps a
//! wedged disk from corrupting chain decisions.

use crate::block::types::CompositeBlock;
use crate::error::StoreError;
use std::path::Path;
use tracing::warn;

/// Well-known keys and key builders. The dotted namespaces are part of the
/// on-disk contract shared with the rover processes.
pub mod keys {
    /// Current composite tip.
    pub const LATEST: &str = "bc.block.latest";
    /// The tip's parent; read soft-fail, may lag the tip by one write.
    pub const PARENT: &str = "bc.block.parent";
    /// String-encoded peer quorum.
    pub const QUORUM: &str = "bc.dht.quorum";
    /// Resync sentinel; a record at genesis height means "unlocked".
    pub const SYNCLOCK: &str = "synclock";

    /// Historical composite block by height.
    pub fn block(height: u64) -> String {
        format!("bc.block.{height}")
    }

    /// Pending candidate at a height during sync.
    pub fn pending_block(height: u64) -> String {
        format!("pending.bc.block.{height}")
    }

    /// Child header persisted by a rover, by chain name and child height.
    pub fn child_block(chain: &str, height: u64) -> String {
        format!("{chain}.block.{height}")
    }

    /// The newest header a rover has persisted for its chain.
    pub fn child_latest(chain: &str) -> String {
        format!("{chain}.block.latest")
    }
}

pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(1000))
            .mode(sled::Mode::HighThroughput)
            .open()
            .map_err(|source| StoreError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { db })
    }

    /// Open a throwaway store for tests.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get_raw(&self, key: &str, soft_fail: bool) -> Result<Option<sled::IVec>, StoreError> {
        match self.db.get(key.as_bytes()) {
            Ok(value) => Ok(value),
            Err(e) if soft_fail => {
                warn!("soft-fail read of {key}: {e}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn del(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Typed block read. Records that fail to deserialize are treated the
    /// same as read errors under the soft-fail policy.
    pub fn get_block(&self, key: &str, soft_fail: bool) -> Result<Option<CompositeBlock>, StoreError> {
        let Some(raw) = self.get_raw(key, soft_fail)? else {
            return Ok(None);
        };
        match bincode::deserialize(&raw) {
            Ok(block) => Ok(Some(block)),
            Err(e) if soft_fail => {
                warn!("soft-fail decode of {key}: {e}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn put_block(&self, key: &str, block: &CompositeBlock) -> Result<(), StoreError> {
        let value = bincode::serialize(block)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Bulk block fetch. Missing or undecodable keys shorten the result;
    /// they are never an error.
    pub fn get_bulk(&self, keys: &[String]) -> Vec<CompositeBlock> {
        keys.iter()
            .filter_map(|key| self.get_block(key, true).ok().flatten())
            .collect()
    }

    pub fn get_quorum(&self) -> Result<Option<u64>, StoreError> {
        let Some(raw) = self.get_raw(keys::QUORUM, true)? else {
            return Ok(None);
        };
        Ok(std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<u64>().ok()))
    }

    pub fn put_quorum(&self, quorum: u64) -> Result<(), StoreError> {
        self.put_raw(keys::QUORUM, quorum.to_string().as_bytes())
    }

    /// Persist the adopted tip: latest pointer, parent pointer, and the
    /// height-indexed record. The tip write is flushed; losing it would
    /// orphan the whole window on restart.
    pub fn commit_tip(
        &self,
        block: &CompositeBlock,
        parent: Option<&CompositeBlock>,
    ) -> Result<(), StoreError> {
        self.put_block(&keys::block(block.height), block)?;
        if let Some(parent) = parent {
            self.put_block(keys::PARENT, parent)?;
        }
        self.put_block(keys::LATEST, block)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
