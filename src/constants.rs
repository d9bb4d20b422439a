//! Global constants for the lattice node
//!
//! Centralizes all magic numbers and configuration constants to improve
//! code maintainability and readability.

/// Chain adoption constants
pub mod chain {
    /// Number of composite blocks held in the in-memory multiverse window
    pub const WINDOW_SIZE: usize = 7;

    /// Genesis height; a synclock record at this height means "unlocked"
    pub const GENESIS_HEIGHT: u64 = 1;

    /// A block more than this many heights above the local tip forces a resync
    pub const MAX_HEIGHT_JUMP: u64 = 6;

    /// A candidate at least this many seconds older than the tip is rejected
    pub const TIP_TIMESTAMP_SLACK_SECS: i64 = 3;

    /// A candidate older than this relative to local wall clock is rejected
    pub const MAX_BLOCK_AGE_SECS: i64 = 27;

    /// A local tip untouched for this long is considered stale during resync checks
    pub const STALE_TIP_SECS: i64 = 32;

    /// Above this height, candidate timestamps must track the local clock
    pub const HIGH_HEIGHT_THRESHOLD: u64 = 100_000;

    /// Allowed clock divergence for candidates above HIGH_HEIGHT_THRESHOLD
    pub const HIGH_HEIGHT_CLOCK_SKEW_SECS: i64 = 15;

    /// Target spacing between composite blocks in seconds
    pub const TARGET_BLOCK_SECS: i64 = 64;

    /// Entries kept in the block-validity LRU cache
    pub const VALIDITY_CACHE_SIZE: usize = 512;
}

/// Wire protocol constants
pub mod protocol {
    /// Every frame starts with a tag of exactly this many ASCII bytes
    pub const TAG_LEN: usize = 7;

    /// Field separator; tag and payload fields are joined with this sequence
    pub const SEPARATOR: &[u8; 3] = b"[*]";

    /// A transport chunk of exactly this size is a continuation fragment;
    /// any other length terminates the buffered message
    pub const CONTINUATION_CHUNK_BYTES: usize = 1382;

    /// Maximum size of a single serialized block record (4MB)
    pub const MAX_BLOCK_BYTES: u32 = 4 * 1024 * 1024;

    /// Maximum size of a reassembled message (64MB)
    pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

    /// Range requests never reach below this height (genesis is immutable)
    pub const RANGE_FLOOR: u64 = 2;

    /// Push our tip to a fresh peer when we lead its height by this many blocks
    pub const TIP_PUSH_LEAD: u64 = 3;

    /// Codec errors tolerated from one connection before the peer is dropped
    pub const CODEC_ERROR_LIMIT: u32 = 5;
}

/// Sync and quorum constants
pub mod sync {
    /// A synclock record older than this is stale and reset to the sentinel
    pub const SYNCLOCK_STALE_SECS: i64 = 18;

    /// Peers required before discovery pauses on mainnet
    pub const QUORUM_MAINNET: u64 = 3;

    /// Peers required before discovery pauses on testnet
    pub const QUORUM_TESTNET: u64 = 1;

    /// Seconds between dial passes over the discovered peer set
    pub const DIAL_INTERVAL_SECS: u64 = 10;

    /// Dial attempts per peer before it is dropped from the candidate set
    pub const MAX_DIAL_ATTEMPTS: u32 = 5;
}

/// Mining worker supervision constants
pub mod worker {
    use std::time::Duration;

    /// All workers must heartbeat within this window after all_rise
    pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Interval between supervisor heartbeat pings
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

    /// A worker silent for this long is killed and replaced
    pub const HEARTBEAT_MISS: Duration = Duration::from_secs(15);

    /// A worker must acknowledge an abort within this window or be killed
    pub const ABORT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Time allowed for a recorded stale PID to die after SIGKILL
    pub const KILL_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Respawn-storm window: MAX_RESPAWNS within this window is fatal
    pub const RESPAWN_WINDOW: Duration = Duration::from_secs(60);

    /// Respawns tolerated inside RESPAWN_WINDOW before pool failure
    pub const MAX_RESPAWNS: usize = 3;
}
