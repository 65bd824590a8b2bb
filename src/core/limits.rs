/// Default capacity of the transaction slot arena.
pub const DEFAULT_MAX_OPEN: usize = 16_384;

/// Default number of GXID advances between control-record checkpoints.
pub const DEFAULT_CONTROL_INTERVAL: u32 = 8_192;

/// Longest accepted global session identifier.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// Longest accepted 2PC identifier (GID).
pub const MAX_GID_LEN: usize = 256;

/// Longest accepted participating-node list.
pub const MAX_NODESTRING_LEN: usize = 1_024;

/// Added to the restored control GXID on startup so that identifiers handed
/// out after the last checkpoint (but before shutdown) are never re-issued.
pub const RESTORE_SAFETY_MARGIN: u32 = 2_000;

/// Client identifier used for transactions no connection owns, such as the
/// commit-driver transaction minted while resolving a prepared GID.
pub const CLIENT_ID_ANONYMOUS: u64 = 0;

/// Mirror calls are retried this many times (with reconnect) before the
/// standby is declared lost.
pub const MIRROR_MAX_RETRIES: u32 = 3;

/// A request that takes longer than this has its connection closed, which
/// reaps the client's unprepared transactions.
pub const REQUEST_DEADLINE_SECS: u64 = 60;
