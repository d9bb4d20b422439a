//! Durable guard file for mining worker sessions.
//!
//! The supervisor records every spawned PID in a JSON document next to the
//! data store. After a crash the next session finds the record, kills any
//! PID still alive, and starts clean. Only the supervisor writes this file.

use crate::constants::worker::KILL_RETRY_TIMEOUT;
use crate::error::WorkerError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const GUARD_FILE: &str = "worker_guard.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GuardRecord {
    pub session: String,
    pub timestamp: i64,
    pub workers: Vec<GuardWorker>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardWorker {
    pub pid: u32,
}

pub struct WorkerGuard {
    path: PathBuf,
    record: GuardRecord,
}

impl WorkerGuard {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(GUARD_FILE),
            record: GuardRecord::default(),
        }
    }

    /// The record a previous session left behind, if any.
    pub fn load_previous(&self) -> Result<Option<GuardRecord>, WorkerError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| WorkerError::Guard(e.to_string()))?;
        match serde_json::from_str::<GuardRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // an unreadable guard is treated as no survivors
                warn!("discarding corrupt worker guard: {e}");
                Ok(None)
            }
        }
    }

    /// Kill every PID the record names and wait for each to die. A PID that
    /// outlives the retry window is reported, not retried forever.
    pub async fn reap_stale(&self, record: &GuardRecord) {
        for worker in &record.workers {
            if !pid_alive(worker.pid) {
                continue;
            }
            info!(
                pid = worker.pid,
                session = %record.session,
                "killing worker left over from a previous session"
            );
            kill_pid(worker.pid);
            let deadline = tokio::time::Instant::now() + KILL_RETRY_TIMEOUT;
            while pid_alive(worker.pid) {
                if tokio::time::Instant::now() >= deadline {
                    warn!(pid = worker.pid, "stale worker survived SIGKILL window");
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }

    /// Start a fresh session record with a random 256-bit id.
    pub fn begin_session(&mut self) -> Result<String, WorkerError> {
        let seed: [u8; 32] = rand::random();
        self.record = GuardRecord {
            session: hex::encode(seed),
            timestamp: chrono::Utc::now().timestamp(),
            workers: Vec::new(),
        };
        self.persist()?;
        Ok(self.record.session.clone())
    }

    pub fn record_spawn(&mut self, pid: u32) -> Result<(), WorkerError> {
        if !self.record.workers.iter().any(|w| w.pid == pid) {
            self.record.workers.push(GuardWorker { pid });
        }
        self.persist()
    }

    pub fn record_kill(&mut self, pid: u32) -> Result<(), WorkerError> {
        self.record.workers.retain(|w| w.pid != pid);
        self.persist()
    }

    pub fn clear(&mut self) -> Result<(), WorkerError> {
        self.record.workers.clear();
        self.persist()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.record.workers.iter().map(|w| w.pid).collect()
    }

    pub fn session(&self) -> &str {
        &self.record.session
    }

    fn persist(&self) -> Result<(), WorkerError> {
        let raw = serde_json::to_string_pretty(&self.record)
            .map_err(|e| WorkerError::Guard(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| WorkerError::Guard(e.to_string()))
    }
}

pub fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Signal 0 probes for existence without sending anything.
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
