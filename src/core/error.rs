use thiserror::Error;

use crate::core::gxid::Gxid;

/// Every failure the transaction manager can report.
///
/// Handle-validation misses and index misses are ordinary statuses as far as
/// clients are concerned; the dispatcher converts them into protocol error
/// replies. Only `WrapAroundStop` and persistent control-store failures
/// escalate beyond a single request.
#[derive(Error, Debug)]
pub enum GtmError {
    #[error("Invalid transaction handle: {0}")]
    InvalidHandle(usize),
    #[error("No transaction found for gxid {0}")]
    UnknownGxid(Gxid),
    #[error("No transaction found for prepared transaction ID '{0}'")]
    UnknownGid(String),
    #[error("No transaction found for global session '{0}'")]
    UnknownSession(String),
    #[error("Prepared transaction ID '{0}' already exists")]
    DuplicateGid(String),
    #[error("Not accepting commands to avoid wraparound data loss")]
    WrapAroundStop,
    #[error("Max global transactions limit reached ({0})")]
    CapacityExhausted(usize),
    #[error("Running in standby mode -- operation requires the primary")]
    StandbyReadOnly,
    #[error("Shutting down -- can not issue new transaction ids")]
    Shutdown,
    #[error("Standby mirroring failed after {0} attempts")]
    StandbyLost(u32),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server error: {0}")]
    Remote(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Binary serialization error: {0}")]
    BinarySerialization(String),
}
