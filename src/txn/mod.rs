// Transaction table: slot arena, lookup indexes, GXID generator,
// per-transaction lifecycle (including 2PC), session reaper.

pub mod generator;
pub mod lifecycle;
pub mod sequences;
pub mod slot;
pub mod snapshot;
pub mod table;
pub mod xmin;

pub use lifecycle::BeginRequest;
pub use sequences::{NoopSequenceHooks, SeqHandle, SequenceHooks};
pub use slot::{IsolationLevel, TxnState};
pub use snapshot::TableSnapshot;
pub use table::{TableOptions, TableState, TransactionTable};

/// Per-transaction outcome of a commit/rollback request.
///
/// `Delayed` is not a failure: the commit depends on transactions that are
/// still in progress and the client is expected to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Ok,
    Error,
    Delayed,
}

impl TxnStatus {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::Delayed => 2,
        }
    }

    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            2 => Self::Delayed,
            _ => Self::Error,
        }
    }
}
