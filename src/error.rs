use thiserror::Error;

/// Failure decoding a wire frame or a serialized block record.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown frame tag: {0:?}")]
    UnknownTag(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("truncated block record: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("block record too large: {0} bytes")]
    Oversized(u32),

    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("non-numeric field: {0}")]
    BadNumber(String),
}

/// A chain-adoption rule failing. Validation never panics; offending blocks
/// are rejected and the reason is logged.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("block {hash} at height {height} does not link to {expected}")]
    BrokenLink {
        hash: String,
        height: u64,
        expected: String,
    },

    #[error("heights not contiguous: {upper} does not follow {lower}")]
    HeightGap { upper: u64, lower: u64 },

    #[error("total distance not increasing at height {0}")]
    DistanceNotIncreasing(u64),

    #[error("difficulty out of bounds at height {0}")]
    DifficultyOutOfBounds(u64),

    #[error("child header sequence regressed for chain {0}")]
    ChildSequenceRegressed(String),

    #[error("sequence does not reach a persisted boundary below height {0}")]
    NoPersistedBoundary(u64),

    #[error("empty block sequence")]
    EmptySequence,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: sled::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("peer {0} disconnected mid-frame")]
    Disconnected(String),

    #[error("connection {0} is gone")]
    ConnectionGone(u64),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker {pid} missed its heartbeat window")]
    HeartbeatMissed { pid: u32 },

    #[error("worker {pid} exited with status {status:?}")]
    Exited { pid: u32, status: Option<i32> },

    #[error("worker pool not ready within {0:?}")]
    ReadyTimeout(std::time::Duration),

    #[error("{count} worker respawns within {window:?}; escalating to pool failure")]
    RespawnStorm {
        count: usize,
        window: std::time::Duration,
    },

    #[error("worker channel error: {0}")]
    Channel(String),

    #[error("worker guard error: {0}")]
    Guard(String),
}

/// Top-level daemon error; everything the engine cannot absorb.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("initialization error: {0}")]
    Initialization(String),
}
