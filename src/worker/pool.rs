//! Supervisor for the mining worker processes.
//!
//! Workers are separate processes of this same executable, re-run in worker
//! mode and spoken to over length-prefixed typed frames on stdio. The
//! supervisor enforces the readiness barrier, heartbeats every worker,
//! replaces the silent ones, and escalates to a pool failure when the
//! replacements themselves keep dying.

use crate::block::types::CompositeBlock;
use crate::constants::worker::{
    ABORT_ACK_TIMEOUT, HEARTBEAT_MISS, MAX_RESPAWNS, READY_TIMEOUT, RESPAWN_WINDOW,
};
use crate::error::WorkerError;
use crate::worker::guard::WorkerGuard;
use crate::worker::protocol::{
    new_msg_id, read_frame, write_frame, PoolMessage, WorkOrder, WorkerMessage,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A block a worker found, routed back to the engine.
#[derive(Clone, Debug)]
pub struct MinedSolution {
    pub pid: u32,
    pub block: CompositeBlock,
    pub iterations: u64,
    pub time_diff: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Dead,
}

pub struct WorkerState {
    pub pid: u32,
    pub last_heartbeat_ts: i64,
    /// Requests in flight: msg_id -> send time.
    pub outstanding: HashMap<String, i64>,
    pub status: WorkerStatus,
}

struct WorkerHandle {
    /// None for channel-attached workers (test harness).
    child: Option<Child>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    state: WorkerState,
    reader: tokio::task::JoinHandle<()>,
    /// Set while an abort awaits acknowledgement.
    abort_deadline: Option<Instant>,
}

pub struct WorkerPool {
    data_dir: PathBuf,
    worker_count: usize,
    miner_key: String,
    rovers: BTreeSet<String>,
    guard: WorkerGuard,
    session_id: String,
    started_at: i64,
    workers: HashMap<u32, WorkerHandle>,
    inbox_tx: mpsc::Sender<(u32, WorkerMessage)>,
    inbox_rx: mpsc::Receiver<(u32, WorkerMessage)>,
    respawns: VecDeque<Instant>,
    current_work: Option<WorkOrder>,
    paused: bool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl WorkerPool {
    pub fn new(
        data_dir: &Path,
        worker_count: usize,
        miner_key: String,
        rovers: BTreeSet<String>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(256);
        Self {
            data_dir: data_dir.to_path_buf(),
            worker_count,
            miner_key,
            rovers,
            guard: WorkerGuard::open(data_dir),
            session_id: String::new(),
            started_at: 0,
            workers: HashMap::new(),
            inbox_tx,
            inbox_rx,
            respawns: VecDeque::new(),
            current_work: None,
            paused: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn miner_key(&self) -> &str {
        &self.miner_key
    }

    pub fn rovers(&self) -> &BTreeSet<String> {
        &self.rovers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Heartbeat timestamps per live worker.
    pub fn heartbeats(&self) -> HashMap<u32, i64> {
        self.workers
            .iter()
            .map(|(pid, h)| (*pid, h.state.last_heartbeat_ts))
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.workers
            .values()
            .filter(|h| matches!(h.state.status, WorkerStatus::Ready | WorkerStatus::Busy))
            .count()
    }

    /// Open the guard, kill survivors of a crashed session, start a fresh
    /// session record.
    pub async fn init(&mut self) -> Result<(), WorkerError> {
        if let Some(previous) = self.guard.load_previous()? {
            if !previous.workers.is_empty() {
                warn!(
                    session = %previous.session,
                    count = previous.workers.len(),
                    "previous mining session left workers behind"
                );
                self.guard.reap_stale(&previous).await;
            }
        }
        self.session_id = self.guard.begin_session()?;
        self.started_at = now();
        info!(session = %self.session_id, workers = self.worker_count, "mining session opened");
        Ok(())
    }

    /// Bring the pool to strength and hold until every worker has
    /// heartbeated, or fail after the readiness window.
    pub async fn all_rise(&mut self) -> Result<(), WorkerError> {
        for _ in self.workers.len()..self.worker_count {
            self.spawn_worker().await?;
        }
        self.await_ready().await
    }

    async fn await_ready(&mut self) -> Result<(), WorkerError> {
        let deadline = Instant::now() + READY_TIMEOUT;
        while self.ready_count() < self.worker_count {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(WorkerError::ReadyTimeout(READY_TIMEOUT))?;
            match tokio::time::timeout(remaining, self.inbox_rx.recv()).await {
                Ok(Some((pid, message))) => {
                    self.handle_message(pid, message);
                }
                Ok(None) => return Err(WorkerError::Channel("worker inbox closed".to_string())),
                Err(_) => return Err(WorkerError::ReadyTimeout(READY_TIMEOUT)),
            }
        }
        info!(count = self.worker_count, "all workers ready");
        Ok(())
    }

    /// Register a worker over an established channel and ping it. Process
    /// spawning funnels through here; harness tests attach duplex pipes.
    pub async fn attach_worker<R, W>(
        &mut self,
        pid: u32,
        child: Option<Child>,
        reader: R,
        writer: W,
    ) -> Result<(), WorkerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.guard.record_spawn(pid)?;

        let inbox = self.inbox_tx.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match read_frame::<_, WorkerMessage>(&mut reader).await {
                    Ok(Some(message)) => {
                        if inbox.send((pid, message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(pid, "worker channel read failed: {e}");
                        break;
                    }
                }
            }
        });

        let mut handle = WorkerHandle {
            child,
            writer: Box::new(writer),
            state: WorkerState {
                pid,
                last_heartbeat_ts: now(),
                outstanding: HashMap::new(),
                status: WorkerStatus::Starting,
            },
            reader: reader_task,
            abort_deadline: None,
        };

        let msg_id = new_msg_id(pid);
        handle.state.outstanding.insert(msg_id.clone(), now());
        write_frame(&mut handle.writer, &PoolMessage::Heartbeat { msg_id }).await?;
        self.workers.insert(pid, handle);
        Ok(())
    }

    async fn spawn_worker(&mut self) -> Result<u32, WorkerError> {
        let exe = std::env::current_exe().map_err(WorkerError::Spawn)?;
        let mut child = Command::new(exe)
            .arg("--mine-worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(WorkerError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| WorkerError::Channel("spawned worker has no pid".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Channel("worker stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Channel("worker stdout not piped".to_string()))?;
        info!(pid, "worker spawned");
        self.attach_worker(pid, Some(child), stdout, stdin).await?;
        Ok(pid)
    }

    /// Next message off the worker channel; await this from the engine's
    /// select loop.
    pub async fn next_message(&mut self) -> Option<(u32, WorkerMessage)> {
        self.inbox_rx.recv().await
    }

    /// Fold one worker message into pool state. Solutions are returned for
    /// the engine to evaluate.
    pub fn handle_message(&mut self, pid: u32, message: WorkerMessage) -> Option<MinedSolution> {
        let Some(handle) = self.workers.get_mut(&pid) else {
            debug!(pid, "message from unknown worker");
            return None;
        };
        handle.state.outstanding.remove(message.msg_id());
        handle.state.last_heartbeat_ts = now();
        match message {
            WorkerMessage::Heartbeat { .. } => {
                if handle.state.status == WorkerStatus::Starting {
                    handle.state.status = WorkerStatus::Ready;
                }
                None
            }
            WorkerMessage::Solution {
                block,
                iterations,
                time_diff,
                ..
            } => {
                handle.state.status = WorkerStatus::Ready;
                Some(MinedSolution {
                    pid,
                    block,
                    iterations,
                    time_diff,
                })
            }
            WorkerMessage::AbortAck { .. } => {
                handle.abort_deadline = None;
                handle.state.status = WorkerStatus::Ready;
                None
            }
            WorkerMessage::Error { message, .. } => {
                warn!(pid, "worker reported: {message}");
                None
            }
        }
    }

    /// Periodic supervision pass: ping everyone, replace the silent and the
    /// abort-deaf, escalate on a respawn storm.
    pub async fn tick(&mut self) -> Result<(), WorkerError> {
        let ts = now();
        let mut casualties = Vec::new();
        for (pid, handle) in self.workers.iter_mut() {
            if let Some(deadline) = handle.abort_deadline {
                if Instant::now() >= deadline {
                    warn!(pid, "worker ignored abort");
                    casualties.push(*pid);
                    continue;
                }
            }
            if ts - handle.state.last_heartbeat_ts > HEARTBEAT_MISS.as_secs() as i64 {
                warn!(pid, "worker missed its heartbeat window");
                casualties.push(*pid);
                continue;
            }
            let msg_id = new_msg_id(*pid);
            handle.state.outstanding.insert(msg_id.clone(), ts);
            if write_frame(&mut handle.writer, &PoolMessage::Heartbeat { msg_id })
                .await
                .is_err()
            {
                warn!(pid, "worker channel went away");
                casualties.push(*pid);
            }
        }

        for pid in casualties {
            self.dismiss(pid).await;
            self.note_respawn()?;
            let replacement = self.spawn_worker().await?;
            if !self.paused {
                if let Some(order) = self.current_work.clone() {
                    self.send_work_to(replacement, &order).await;
                }
            }
        }
        Ok(())
    }

    fn note_respawn(&mut self) -> Result<(), WorkerError> {
        self.respawns.push_back(Instant::now());
        while self
            .respawns
            .front()
            .is_some_and(|t| t.elapsed() > RESPAWN_WINDOW)
        {
            self.respawns.pop_front();
        }
        if self.respawns.len() >= MAX_RESPAWNS {
            return Err(WorkerError::RespawnStorm {
                count: self.respawns.len(),
                window: RESPAWN_WINDOW,
            });
        }
        Ok(())
    }

    /// Hand the same work order to every worker.
    pub async fn distribute_work(&mut self, order: WorkOrder) {
        self.current_work = Some(order.clone());
        self.paused = false;
        let pids: Vec<u32> = self.workers.keys().copied().collect();
        for pid in pids {
            self.send_work_to(pid, &order).await;
        }
    }

    async fn send_work_to(&mut self, pid: u32, order: &WorkOrder) {
        let Some(handle) = self.workers.get_mut(&pid) else {
            return;
        };
        let msg_id = new_msg_id(pid);
        handle.state.outstanding.insert(msg_id.clone(), now());
        let message = PoolMessage::Work {
            msg_id,
            order: order.clone(),
        };
        match write_frame(&mut handle.writer, &message).await {
            Ok(()) => handle.state.status = WorkerStatus::Busy,
            Err(e) => {
                warn!(pid, "failed to send work: {e}");
                handle.state.status = WorkerStatus::Dead;
            }
        }
    }

    /// Cancel in-flight work everywhere. Workers must acknowledge within
    /// the abort window or the next tick replaces them.
    pub async fn abort_all(&mut self) {
        self.paused = true;
        self.current_work = None;
        for (pid, handle) in self.workers.iter_mut() {
            if handle.state.status != WorkerStatus::Busy {
                continue;
            }
            let msg_id = new_msg_id(*pid);
            handle.state.outstanding.insert(msg_id.clone(), now());
            if write_frame(&mut handle.writer, &PoolMessage::Abort { msg_id })
                .await
                .is_ok()
            {
                handle.abort_deadline = Some(Instant::now() + ABORT_ACK_TIMEOUT);
            } else {
                handle.state.status = WorkerStatus::Dead;
            }
        }
    }

    /// Tear one worker down: channel, listeners, process, guard entry.
    /// Safe to call for unknown pids.
    pub async fn dismiss(&mut self, pid: u32) {
        let Some(mut handle) = self.workers.remove(&pid) else {
            return;
        };
        handle.reader.abort();
        if let Some(child) = handle.child.as_mut() {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), child.wait()).await;
        }
        if let Err(e) = self.guard.record_kill(pid) {
            warn!(pid, "failed to update guard: {e}");
        }
        info!(pid, "worker dismissed");
    }

    pub async fn all_dismissed(&mut self) {
        let pids: Vec<u32> = self.workers.keys().copied().collect();
        for pid in pids {
            self.dismiss(pid).await;
        }
        if let Err(e) = self.guard.clear() {
            warn!("failed to clear guard: {e}");
        }
        info!(session = %self.session_id, "mining session closed");
    }

    /// The guard and the live worker set must agree; divergence means a
    /// worker died outside the supervisor's control.
    pub fn health_check(&mut self) -> bool {
        let guarded: BTreeSet<u32> = self.guard.pids().into_iter().collect();
        let live: BTreeSet<u32> = self.workers.keys().copied().collect();
        if guarded != live {
            warn!(?guarded, ?live, "guard and worker set diverged");
            return false;
        }
        for handle in self.workers.values_mut() {
            if let Some(child) = handle.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    warn!(pid = handle.state.pid, ?status, "worker exited unsupervised");
                    return false;
                }
            }
        }
        true
    }

    /// The directory this session's guard lives in.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
