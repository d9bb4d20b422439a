//! Worker-side mining loop.
//!
//! Runs inside a child process of the daemon (worker mode). The supervisor
//! speaks over stdio; the search itself runs on a plain thread so the
//! channel stays responsive to heartbeats and aborts. The search target is
//! a blake3 threshold over the work preimage; the interesting part is the
//! supervision contract around it, not the puzzle.

use crate::block::types::CompositeBlock;
use crate::constants::worker::HEARTBEAT_INTERVAL;
use crate::worker::protocol::{
    new_msg_id, read_frame, write_frame, PoolMessage, WorkOrder, WorkerMessage,
};
use num_bigint::BigUint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct FoundBlock {
    block: CompositeBlock,
    iterations: u64,
    time_diff: u64,
}

/// Entry point for `--mine-worker` mode. Returns the process exit code.
pub async fn run() -> i32 {
    let pid = std::process::id();
    let mut stdout = tokio::io::stdout();

    // dedicated reader task; read_exact is not cancel-safe inside select
    let (order_tx, mut order_rx) = mpsc::channel::<PoolMessage>(16);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        loop {
            match read_frame::<_, PoolMessage>(&mut stdin).await {
                Ok(Some(message)) => {
                    if order_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("worker channel read failed: {e}");
                    break;
                }
            }
        }
    });

    let (solution_tx, mut solution_rx) = mpsc::channel::<FoundBlock>(4);
    let mut stop_flag: Option<Arc<AtomicBool>> = None;
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            incoming = order_rx.recv() => {
                match incoming {
                    Some(PoolMessage::Heartbeat { msg_id }) => {
                        let reply = WorkerMessage::Heartbeat { msg_id, pid };
                        if write_frame(&mut stdout, &reply).await.is_err() {
                            return 1;
                        }
                    }
                    Some(PoolMessage::Work { order, .. }) => {
                        if let Some(flag) = stop_flag.take() {
                            flag.store(true, Ordering::SeqCst);
                        }
                        let flag = Arc::new(AtomicBool::new(false));
                        stop_flag = Some(flag.clone());
                        let tx = solution_tx.clone();
                        std::thread::spawn(move || {
                            if let Some(found) = search(&order, &flag) {
                                let _ = tx.blocking_send(found);
                            }
                        });
                    }
                    Some(PoolMessage::Abort { msg_id }) => {
                        if let Some(flag) = stop_flag.take() {
                            flag.store(true, Ordering::SeqCst);
                        }
                        let reply = WorkerMessage::AbortAck { msg_id };
                        if write_frame(&mut stdout, &reply).await.is_err() {
                            return 1;
                        }
                    }
                    // supervisor closed the channel; we are dismissed
                    None => return 0,
                }
            }
            Some(found) = solution_rx.recv() => {
                let message = WorkerMessage::Solution {
                    msg_id: new_msg_id(pid),
                    block: found.block,
                    iterations: found.iterations,
                    time_diff: found.time_diff,
                };
                if write_frame(&mut stdout, &message).await.is_err() {
                    return 1;
                }
            }
            _ = ticker.tick() => {
                let beat = WorkerMessage::Heartbeat { msg_id: new_msg_id(pid), pid };
                if write_frame(&mut stdout, &beat).await.is_err() {
                    return 1;
                }
            }
        }
    }
}

/// Search nonces until the work digest clears the difficulty, or the stop
/// flag is raised by a newer order or an abort.
fn search(order: &WorkOrder, stop: &AtomicBool) -> Option<FoundBlock> {
    let started = std::time::Instant::now();
    let parent = &order.previous_block;
    let mut nonce: u64 = rand::random();
    let mut iterations: u64 = 0;
    let mut timestamp = chrono::Utc::now().timestamp();

    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        iterations += 1;
        if iterations % 4096 == 0 {
            timestamp = chrono::Utc::now().timestamp();
        }

        let digest = work_digest(order, timestamp, nonce);
        let distance = BigUint::from_bytes_be(&digest[..16]);
        if distance >= order.difficulty {
            let mut block = CompositeBlock {
                hash: String::new(),
                previous_hash: parent.hash.clone(),
                height: parent.height + 1,
                timestamp,
                difficulty: order.difficulty.clone(),
                distance: distance.clone(),
                total_distance: &parent.total_distance + &distance,
                blockchain_headers: order.headers.clone(),
                blockchain_headers_count: 0,
                miner_key: order.miner_key.clone(),
            };
            block.seal();
            return Some(FoundBlock {
                block,
                iterations,
                time_diff: started.elapsed().as_millis() as u64,
            });
        }
        nonce = nonce.wrapping_add(1);
    }
}

fn work_digest(order: &WorkOrder, timestamp: i64, nonce: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(order.previous_block.hash.as_bytes());
    for (chain, headers) in &order.headers {
        hasher.update(chain.as_bytes());
        for header in headers {
            hasher.update(header.hash.as_bytes());
            hasher.update(header.merkle_root.as_bytes());
        }
    }
    hasher.update(order.miner_key.as_bytes());
    hasher.update(&timestamp.to_be_bytes());
    hasher.update(&nonce.to_be_bytes());
    *hasher.finalize().as_bytes()
}
