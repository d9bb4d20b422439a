//! Typed channel between the pool supervisor and its worker processes.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode payload], carried
//! over the worker's stdio. Requests carry a `msg_id` of the form
//! `"{pid}@{128-bit hex}"`; the supervisor keeps the send time in an outbox
//! and resolves the waiter when the matching reply arrives.

use crate::block::types::{ChildHeader, CompositeBlock};
use crate::error::WorkerError;
use num_bigint::BigUint;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed channel frame (8MB); a work order carries a full block.
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

/// Everything a worker needs to search for the next block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkOrder {
    pub previous_block: CompositeBlock,
    pub headers: BTreeMap<String, Vec<ChildHeader>>,
    pub difficulty: BigUint,
    pub miner_key: String,
}

/// Supervisor to worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PoolMessage {
    Heartbeat { msg_id: String },
    Work { msg_id: String, order: WorkOrder },
    Abort { msg_id: String },
}

/// Worker to supervisor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerMessage {
    Heartbeat {
        msg_id: String,
        pid: u32,
    },
    Solution {
        msg_id: String,
        block: CompositeBlock,
        iterations: u64,
        time_diff: u64,
    },
    AbortAck {
        msg_id: String,
    },
    Error {
        msg_id: String,
        message: String,
    },
}

impl WorkerMessage {
    pub fn msg_id(&self) -> &str {
        match self {
            WorkerMessage::Heartbeat { msg_id, .. }
            | WorkerMessage::Solution { msg_id, .. }
            | WorkerMessage::AbortAck { msg_id }
            | WorkerMessage::Error { msg_id, .. } => msg_id,
        }
    }
}

/// `"{pid}@{128-bit hex}"`, unique per request.
pub fn new_msg_id(pid: u32) -> String {
    let nonce: [u8; 16] = rand::random();
    format!("{pid}@{}", hex::encode(nonce))
}

/// Serialize a message and write it as a length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        bincode::serialize(message).map_err(|e| WorkerError::Channel(e.to_string()))?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(WorkerError::Channel(format!(
            "frame too large: {len} bytes"
        )));
    }
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| WorkerError::Channel(e.to_string()))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|e| WorkerError::Channel(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| WorkerError::Channel(e.to_string()))?;
    Ok(())
}

/// Read a length-prefixed frame. Returns Ok(None) on clean EOF (channel
/// closed, worker gone).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WorkerError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WorkerError::Channel(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(WorkerError::Channel(format!(
            "frame too large: {len} bytes"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| WorkerError::Channel(e.to_string()))?;
    let message =
        bincode::deserialize(&payload).map_err(|e| WorkerError::Channel(e.to_string()))?;
    Ok(Some(message))
}
