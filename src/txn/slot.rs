use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::core::gxid::{self, Gxid};
use crate::txn::sequences::SeqHandle;

/// Lifecycle state of a single global transaction.
///
/// `Starting` at allocation, `Running` once a GXID is bound, the two
/// `*InProgress` states while a commit/abort/prepare is being applied, and
/// `Aborted` as the terminal state when the slot is returned to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Starting,
    Running,
    PrepareInProgress,
    Prepared,
    CommitInProgress,
    AbortInProgress,
    Aborted,
}

/// Isolation level requested at begin. Fixed for the transaction's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::RepeatableRead,
            2 => Self::Serializable,
            _ => Self::ReadCommitted,
        }
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::ReadCommitted => 0,
            Self::RepeatableRead => 1,
            Self::Serializable => 2,
        }
    }
}

/// Mutable contents of a transaction slot, protected by the slot lock.
#[derive(Debug)]
pub struct SlotData {
    pub in_use: bool,
    pub gxid: Gxid,
    /// Minimum GXID the participant reported for this transaction. Consumed
    /// by the snapshot subsystem; opaque here.
    pub xmin: Gxid,
    pub state: TxnState,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Identifier of the owning network client, for reaping on disconnect.
    pub client_id: u64,
    /// Sub-identifier assigned by a proxy; -1 when there is no proxy.
    pub proxy_client_id: i32,
    pub session_id: String,
    /// 2PC identifier, set by start-prepared.
    pub gid: Option<String>,
    /// Participating nodes, set by start-prepared.
    pub node_string: Option<String>,
    /// Lazy-vacuum transactions are skipped by snapshot builders.
    pub do_vacuum: bool,
    pub created_seqs: Vec<SeqHandle>,
    pub dropped_seqs: Vec<SeqHandle>,
    pub altered_seqs: Vec<SeqHandle>,
}

impl SlotData {
    fn empty() -> Self {
        Self {
            in_use: false,
            gxid: gxid::INVALID_GXID,
            xmin: gxid::INVALID_GXID,
            state: TxnState::Aborted,
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            client_id: 0,
            proxy_client_id: -1,
            session_id: String::new(),
            gid: None,
            node_string: None,
            do_vacuum: false,
            created_seqs: Vec::new(),
            dropped_seqs: Vec::new(),
            altered_seqs: Vec::new(),
        }
    }

    /// Reinitialize for a freshly begun transaction.
    pub fn init(
        &mut self,
        isolation: IsolationLevel,
        read_only: bool,
        session_id: &str,
        client_id: u64,
        proxy_client_id: i32,
    ) {
        self.in_use = true;
        self.gxid = gxid::INVALID_GXID;
        self.xmin = gxid::INVALID_GXID;
        self.state = TxnState::Starting;
        self.isolation = isolation;
        self.read_only = read_only;
        self.client_id = client_id;
        self.proxy_client_id = proxy_client_id;
        self.session_id.clear();
        self.session_id.push_str(session_id);
        self.gid = None;
        self.node_string = None;
        self.do_vacuum = false;
        self.created_seqs.clear();
        self.dropped_seqs.clear();
        self.altered_seqs.clear();
    }

    /// Mark the slot empty and release the 2PC strings. Sequence lists are
    /// expected to have been reconciled by the removal pass already.
    pub fn clear(&mut self) {
        self.state = TxnState::Aborted;
        self.in_use = false;
        self.gid = None;
        self.node_string = None;
        self.session_id.clear();
        self.created_seqs.clear();
        self.dropped_seqs.clear();
        self.altered_seqs.clear();
    }
}

/// One element of the slot arena.
///
/// The handle (array index) is the slot's stable identity; the lock covers
/// every mutable field. State transitions always take the lock in write mode.
#[derive(Debug)]
pub struct TransactionSlot {
    handle: usize,
    data: RwLock<SlotData>,
}

impl TransactionSlot {
    #[must_use]
    pub fn new(handle: usize) -> Self {
        Self {
            handle,
            data: RwLock::new(SlotData::empty()),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> usize {
        self.handle
    }

    pub fn read(&self) -> std::sync::RwLockReadGuard<'_, SlotData> {
        self.data.read().expect("RwLock poisoned")
    }

    pub fn write(&self) -> std::sync::RwLockWriteGuard<'_, SlotData> {
        self.data.write().expect("RwLock poisoned")
    }
}
