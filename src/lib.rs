// RustGTM - Global Transaction Manager for distributed PostgreSQL-style clusters
// Modular architecture for maintainability and extensibility

// Clippy configuration - allow non-critical warnings
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::items_after_statements)]

// Core types (errors, GXID arithmetic, tunable limits)
pub mod core;

// Transaction table (slot arena, indexes, lifecycle engine, reaper)
pub mod txn;

// Durable control record (periodic GXID checkpoints)
pub mod storage;

// Network layer (wire protocol, client, dispatcher, TCP server)
pub mod network;

// Hot-standby mirroring (backup calls, retry, sync ack)
pub mod standby;

// Re-export commonly used types for convenience
pub use crate::core::{GtmError, Gxid};
pub use network::{GtmClient, Server, ServerOptions};
pub use standby::MirrorClient;
pub use txn::{
    BeginRequest, IsolationLevel, SequenceHooks, TableOptions, TableSnapshot, TransactionTable,
    TxnState, TxnStatus,
};
