use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::error::GtmError;
use crate::core::gxid::{self, Gxid};
use crate::core::limits::{DEFAULT_CONTROL_INTERVAL, DEFAULT_MAX_OPEN};
use crate::txn::sequences::{NoopSequenceHooks, SequenceHooks};
use crate::txn::slot::{SlotData, TransactionSlot, TxnState};
use crate::txn::xmin::XminTracker;

/// Coarse state of the whole transaction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Starting,
    Running,
    ShuttingDown,
}

/// Slot-array bookkeeping, protected by the array lock.
///
/// `open_list` contains the handle of every slot with `in_use == true`,
/// exactly once, in allocation order. Occupancy and list membership change
/// only while this lock is held in write mode, which is what keeps the two
/// views in agreement.
#[derive(Debug)]
pub(crate) struct ArrayState {
    pub open_list: Vec<usize>,
    /// Cursor for the next free-slot search. Freshly freed slots are avoided
    /// so the typical churn pattern touches distinct slots.
    pub last_slot: Option<usize>,
    pub latest_completed_gxid: Gxid,
}

/// Generator bookkeeping, protected by the generator lock.
#[derive(Debug)]
pub(crate) struct GenState {
    pub next_gxid: Gxid,
    pub oldest_gxid: Gxid,
    pub xid_vac_limit: Gxid,
    pub xid_warn_limit: Gxid,
    pub xid_stop_limit: Gxid,
    pub xid_wrap_limit: Gxid,
    pub backed_up_gxid: Gxid,
    /// Last GXID written to the control record.
    pub control_gxid: Gxid,
    pub control_interval: u32,
    pub state: TableState,
}

impl GenState {
    /// Decide whether the control record must be rewritten after assigning
    /// `xid`. `xid < control_gxid` in plain integer terms means the counter
    /// wrapped since the last checkpoint.
    pub fn control_due(&mut self, xid: Gxid) -> bool {
        if !gxid::is_valid(xid) {
            return false;
        }
        if xid.wrapping_sub(self.control_gxid) > self.control_interval || xid < self.control_gxid {
            self.control_gxid = xid;
            return true;
        }
        false
    }
}

/// Construction-time options for the transaction table.
pub struct TableOptions {
    pub max_open: usize,
    pub control_interval: u32,
    pub standby: bool,
    pub hooks: Arc<dyn SequenceHooks>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN,
            control_interval: DEFAULT_CONTROL_INTERVAL,
            standby: false,
            hooks: Arc::new(NoopSequenceHooks),
        }
    }
}

/// The process-wide transaction table.
///
/// A dense arena of `max_open` slots plus the list of currently open
/// transactions, the GXID generator counters, and the xmin registry. Slots
/// are owned by the table for the whole process lifetime; request-scoped
/// strings are copied into slot storage at begin/prepare time.
///
/// Lock order is strict: array lock, then generator lock, then a slot lock.
/// The control checkpoint and standby mirror calls happen with no lock held.
pub struct TransactionTable {
    slots: Box<[TransactionSlot]>,
    array: RwLock<ArrayState>,
    r#gen: RwLock<GenState>,
    xmin: RwLock<XminTracker>,
    standby: AtomicBool,
    hooks: Arc<dyn SequenceHooks>,
}

impl TransactionTable {
    #[must_use]
    pub fn new(options: TableOptions) -> Self {
        let slots = (0..options.max_open)
            .map(TransactionSlot::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            array: RwLock::new(ArrayState {
                open_list: Vec::new(),
                last_slot: None,
                latest_completed_gxid: gxid::FIRST_NORMAL_GXID,
            }),
            r#gen: RwLock::new(GenState {
                next_gxid: gxid::FIRST_NORMAL_GXID,
                oldest_gxid: gxid::FIRST_NORMAL_GXID,
                xid_vac_limit: gxid::INVALID_GXID,
                xid_warn_limit: gxid::INVALID_GXID,
                xid_stop_limit: gxid::INVALID_GXID,
                xid_wrap_limit: gxid::INVALID_GXID,
                backed_up_gxid: gxid::INVALID_GXID,
                control_gxid: gxid::FIRST_NORMAL_GXID,
                control_interval: options.control_interval,
                state: TableState::Starting,
            }),
            xmin: RwLock::new(XminTracker::new()),
            standby: AtomicBool::new(options.standby),
            hooks: options.hooks,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }

    /// Switch a standby table to the primary role (failover promotion).
    pub fn promote(&self) {
        self.standby.store(false, Ordering::SeqCst);
    }

    pub(crate) fn array_read(&self) -> RwLockReadGuard<'_, ArrayState> {
        self.array.read().expect("RwLock poisoned")
    }

    pub(crate) fn array_write(&self) -> RwLockWriteGuard<'_, ArrayState> {
        self.array.write().expect("RwLock poisoned")
    }

    pub(crate) fn gen_read(&self) -> RwLockReadGuard<'_, GenState> {
        self.r#gen.read().expect("RwLock poisoned")
    }

    pub(crate) fn gen_write(&self) -> RwLockWriteGuard<'_, GenState> {
        self.r#gen.write().expect("RwLock poisoned")
    }

    pub(crate) fn xmin_read(&self) -> RwLockReadGuard<'_, XminTracker> {
        self.xmin.read().expect("RwLock poisoned")
    }

    pub(crate) fn xmin_write(&self) -> RwLockWriteGuard<'_, XminTracker> {
        self.xmin.write().expect("RwLock poisoned")
    }

    pub(crate) fn slots(&self) -> &[TransactionSlot] {
        &self.slots
    }

    /// Resolve a handle to its slot, failing when the handle is out of range
    /// or the slot is not in use.
    pub fn slot(&self, handle: usize) -> Result<&TransactionSlot, GtmError> {
        let slot = self
            .slots
            .get(handle)
            .ok_or(GtmError::InvalidHandle(handle))?;
        if !slot.read().in_use {
            return Err(GtmError::InvalidHandle(handle));
        }
        Ok(slot)
    }

    /// Find the open transaction holding `gxid`, walking the open list.
    #[must_use]
    pub fn handle_by_gxid(&self, target: Gxid, warn: bool) -> Option<usize> {
        if !gxid::is_valid(target) {
            return None;
        }
        let arr = self.array_read();
        for &handle in &arr.open_list {
            if self.slots[handle].read().gxid == target {
                return Some(handle);
            }
        }
        drop(arr);
        if warn {
            eprintln!("✗ No transaction handle for gxid {target}");
        }
        None
    }

    /// True while the transaction holding `gxid` is still open.
    #[must_use]
    pub fn is_gxid_in_progress(&self, target: Gxid) -> bool {
        self.handle_by_gxid(target, false).is_some()
    }

    /// Find the prepared transaction registered under `gid`.
    #[must_use]
    pub fn handle_by_gid(&self, gid: &str) -> Option<usize> {
        let arr = self.array_read();
        for &handle in &arr.open_list {
            if self.slots[handle].read().gid.as_deref() == Some(gid) {
                return Some(handle);
            }
        }
        None
    }

    /// Find the open transaction bound to a global session. Empty and
    /// unknown session ids both miss.
    #[must_use]
    pub fn handle_by_session(&self, session_id: &str) -> Option<usize> {
        if session_id.is_empty() {
            return None;
        }
        let arr = self.array_read();
        Self::session_handle_in(&self.slots, &arr, session_id)
    }

    /// Session scan usable while the array lock is already held.
    pub(crate) fn session_handle_in(
        slots: &[TransactionSlot],
        arr: &ArrayState,
        session_id: &str,
    ) -> Option<usize> {
        if session_id.is_empty() {
            return None;
        }
        arr.open_list
            .iter()
            .copied()
            .find(|&handle| slots[handle].read().session_id == session_id)
    }

    /// Claim a free slot, starting the scan one past the allocation cursor.
    /// Must be called with the array lock held in write mode.
    pub(crate) fn alloc_in(&self, arr: &mut ArrayState) -> Result<usize, GtmError> {
        let cap = self.slots.len();
        let start = arr.last_slot.map_or(0, |last| (last + 1) % cap);

        for step in 0..cap {
            let candidate = (start + step) % cap;
            if !self.slots[candidate].read().in_use {
                arr.last_slot = Some(candidate);
                return Ok(candidate);
            }
        }
        Err(GtmError::CapacityExhausted(cap))
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.array_read().open_list.len()
    }

    /// GXIDs of every open transaction, in allocation order.
    #[must_use]
    pub fn open_gxids(&self) -> Vec<Gxid> {
        let arr = self.array_read();
        arr.open_list
            .iter()
            .map(|&handle| self.slots[handle].read().gxid)
            .collect()
    }

    #[must_use]
    pub fn latest_completed_gxid(&self) -> Gxid {
        self.array_read().latest_completed_gxid
    }

    /// Largest client identifier among open transactions. Consulted when a
    /// promoted standby resumes issuing client identifiers.
    #[must_use]
    pub fn last_client_id(&self) -> u64 {
        let arr = self.array_read();
        arr.open_list
            .iter()
            .map(|&handle| self.slots[handle].read().client_id)
            .max()
            .unwrap_or(0)
    }

    /// Reconcile a finished transaction's side effects and empty its slot.
    /// Runs inside the array write lock so a concurrent begin cannot reuse
    /// the slot before its sequences are dealt with.
    fn clean_slot(&self, data: &mut SlotData) {
        match data.state {
            TxnState::AbortInProgress => {
                // Created sequences go first: a new sequence may have reused
                // the name of one we are about to restore.
                for &seq in &data.created_seqs {
                    self.hooks.remove_created(seq);
                }
                for &seq in &data.dropped_seqs {
                    self.hooks.restore_dropped(seq);
                }
                for &seq in &data.altered_seqs {
                    self.hooks.restore_altered(seq);
                }
            }
            TxnState::CommitInProgress => {
                for &seq in &data.dropped_seqs {
                    self.hooks.remove_dropped(seq);
                }
                for &seq in &data.altered_seqs {
                    self.hooks.remove_altered(seq);
                }
            }
            _ => {}
        }
        data.clear();
    }

    /// The removal pass: take every handle out of the open list, advance
    /// `latest_completed_gxid`, run the cleanup hooks, and return the slots
    /// to the pool. One array write lock covers the whole batch.
    pub(crate) fn remove_multi(&self, handles: &[usize]) {
        let mut arr = self.array_write();

        for &handle in handles {
            let Some(pos) = arr.open_list.iter().position(|&h| h == handle) else {
                continue;
            };
            arr.open_list.remove(pos);

            let mut data = self.slots[handle].write();
            if gxid::is_normal(data.gxid)
                && gxid::follows_or_equals(data.gxid, arr.latest_completed_gxid)
            {
                arr.latest_completed_gxid = data.gxid;
            }
            self.clean_slot(&mut data);
        }
    }

    /// Purge every transaction owned by a disconnected client.
    ///
    /// `proxy_client_id == -1` matches any proxy sub-connection. Prepared and
    /// preparing transactions survive: a different client will finish them by
    /// GID. Returns the GXIDs of the removed transactions.
    pub fn reap(&self, client_id: u64, proxy_client_id: i32) -> Vec<Gxid> {
        let mut arr = self.array_write();
        let open = std::mem::take(&mut arr.open_list);
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(open.len());

        for handle in open {
            let mut data = self.slots[handle].write();
            let matches = data.in_use
                && data.state != TxnState::Prepared
                && data.state != TxnState::PrepareInProgress
                && data.client_id == client_id
                && (proxy_client_id == -1 || data.proxy_client_id == proxy_client_id);

            if matches {
                if gxid::is_normal(data.gxid)
                    && gxid::follows_or_equals(data.gxid, arr.latest_completed_gxid)
                {
                    arr.latest_completed_gxid = data.gxid;
                }
                removed.push(data.gxid);
                data.state = TxnState::AbortInProgress;
                self.clean_slot(&mut data);
            } else {
                kept.push(handle);
            }
        }

        arr.open_list = kept;
        removed
    }
}
