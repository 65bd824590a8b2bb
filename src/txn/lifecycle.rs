use crate::core::error::GtmError;
use crate::core::gxid::Gxid;
use crate::txn::TxnStatus;
use crate::txn::sequences::SeqHandle;
use crate::txn::slot::{IsolationLevel, TxnState};
use crate::txn::table::TransactionTable;

/// Parameters of a begin operation.
#[derive(Debug, Clone)]
pub struct BeginRequest {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    /// Global session id; an empty string means the transaction is not bound
    /// to a session.
    pub session_id: String,
    pub client_id: u64,
    /// Proxy sub-connection id; -1 when the client is not behind a proxy.
    pub proxy_conn_id: i32,
}

impl Default for BeginRequest {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            session_id: String::new(),
            client_id: 0,
            proxy_conn_id: -1,
        }
    }
}

/// Everything a commit driver needs to finish a prepared transaction.
#[derive(Debug)]
pub struct GidData {
    pub prepared_handle: usize,
    pub prepared_gxid: Gxid,
    pub node_string: Option<String>,
}

impl TransactionTable {
    /// Start transactions for a batch of requests.
    ///
    /// A request whose session already has an open transaction reuses that
    /// transaction's handle unchanged; everything else claims a fresh slot.
    /// One array write lock covers the whole batch.
    pub fn begin_multi(&self, requests: &[BeginRequest]) -> Result<Vec<usize>, GtmError> {
        let mut arr = self.array_write();
        let mut handles = Vec::with_capacity(requests.len());

        for request in requests {
            if let Some(existing) =
                Self::session_handle_in(self.slots(), &arr, &request.session_id)
            {
                handles.push(existing);
                continue;
            }

            let handle = self.alloc_in(&mut arr)?;
            self.slots()[handle].write().init(
                request.isolation,
                request.read_only,
                &request.session_id,
                request.client_id,
                request.proxy_conn_id,
            );
            arr.open_list.push(handle);
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Start a single transaction, reusing the session's open transaction
    /// when there is one.
    pub fn begin(&self, request: &BeginRequest) -> Result<usize, GtmError> {
        Ok(self.begin_multi(std::slice::from_ref(request))?[0])
    }

    /// Standby-side begin: replay transactions with the GXIDs the primary
    /// assigned, then advance the local counter past the newest of them.
    ///
    /// Replaying the same call twice is a no-op: a GXID that is already open
    /// is skipped. Returns a control value to persist, if one is due.
    pub fn bkup_begin_multi(
        &self,
        items: &[(Gxid, BeginRequest)],
    ) -> Result<Option<Gxid>, GtmError> {
        let mut received = Vec::with_capacity(items.len());
        {
            let mut arr = self.array_write();
            for (incoming, request) in items {
                received.push(*incoming);

                let replayed = arr
                    .open_list
                    .iter()
                    .any(|&handle| self.slots()[handle].read().gxid == *incoming);
                if replayed {
                    continue;
                }

                let handle = match Self::session_handle_in(
                    self.slots(),
                    &arr,
                    &request.session_id,
                ) {
                    Some(existing) => existing,
                    None => {
                        let fresh = self.alloc_in(&mut arr)?;
                        self.slots()[fresh].write().init(
                            request.isolation,
                            request.read_only,
                            &request.session_id,
                            request.client_id,
                            request.proxy_conn_id,
                        );
                        arr.open_list.push(fresh);
                        fresh
                    }
                };

                let mut data = self.slots()[handle].write();
                data.gxid = *incoming;
                if data.state == TxnState::Starting {
                    data.state = TxnState::Running;
                }
            }
        }

        Ok(self.advance_to(&received))
    }

    /// Single-transaction form of `bkup_begin_multi`.
    pub fn bkup_begin(
        &self,
        incoming: Gxid,
        request: &BeginRequest,
    ) -> Result<Option<Gxid>, GtmError> {
        self.bkup_begin_multi(&[(incoming, request.clone())])
    }

    /// Commit a batch of transactions.
    ///
    /// A `None` handle (a lookup that already failed) yields `Error`. When
    /// any of `waited_xids` is still open, the transaction is not committed
    /// and its status is `Delayed` -- the client retries once the
    /// dependencies finish. Everything else is switched to
    /// `CommitInProgress` and taken out by one removal pass.
    pub fn commit_multi(
        &self,
        handles: &[Option<usize>],
        waited_xids: &[Gxid],
    ) -> Vec<TxnStatus> {
        let mut statuses = Vec::with_capacity(handles.len());
        let mut removal = Vec::with_capacity(handles.len());

        for entry in handles {
            let Some(handle) = *entry else {
                statuses.push(TxnStatus::Error);
                continue;
            };
            let Ok(slot) = self.slot(handle) else {
                statuses.push(TxnStatus::Error);
                continue;
            };

            let waiting = waited_xids
                .iter()
                .any(|&dependency| self.is_gxid_in_progress(dependency));
            if waiting {
                statuses.push(TxnStatus::Delayed);
                continue;
            }

            slot.write().state = TxnState::CommitInProgress;
            statuses.push(TxnStatus::Ok);
            removal.push(handle);
        }

        self.remove_multi(&removal);
        statuses
    }

    /// Commit a single transaction, optionally waiting on dependencies.
    pub fn commit(&self, handle: Option<usize>, waited_xids: &[Gxid]) -> TxnStatus {
        self.commit_multi(&[handle], waited_xids)[0]
    }

    /// Roll back a batch of transactions. Same structure as `commit_multi`,
    /// without the dependency check.
    pub fn rollback_multi(&self, handles: &[Option<usize>]) -> Vec<TxnStatus> {
        let mut statuses = Vec::with_capacity(handles.len());
        let mut removal = Vec::with_capacity(handles.len());

        for entry in handles {
            let Some(handle) = *entry else {
                statuses.push(TxnStatus::Error);
                continue;
            };
            let Ok(slot) = self.slot(handle) else {
                statuses.push(TxnStatus::Error);
                continue;
            };

            slot.write().state = TxnState::AbortInProgress;
            statuses.push(TxnStatus::Ok);
            removal.push(handle);
        }

        self.remove_multi(&removal);
        statuses
    }

    /// Roll back a single transaction.
    pub fn rollback(&self, handle: Option<usize>) -> TxnStatus {
        self.rollback_multi(&[handle])[0]
    }

    /// Phase-one prepare: `PrepareInProgress` to `Prepared`. Calling this on
    /// a transaction start-prepared never saw is a programming error.
    pub fn prepare(&self, handle: usize) -> Result<(), GtmError> {
        let slot = self.slot(handle)?;
        let mut data = slot.write();
        let previous = data.state;
        data.state = TxnState::Prepared;
        drop(data);

        debug_assert_eq!(previous, TxnState::PrepareInProgress);
        Ok(())
    }

    /// Register a transaction for 2PC under a user-visible GID and record
    /// the participating nodes. The GID must be unique among open
    /// transactions; both strings are copied into table-owned storage.
    pub fn start_prepared(
        &self,
        handle: usize,
        gid: &str,
        node_string: &str,
    ) -> Result<(), GtmError> {
        match self.handle_by_gid(gid) {
            // Replaying the registration for the same transaction (a mirror
            // call applied twice) is a no-op.
            Some(owner) if owner == handle => return Ok(()),
            Some(_) => return Err(GtmError::DuplicateGid(gid.to_string())),
            None => {}
        }

        let slot = self.slot(handle)?;
        let mut data = slot.write();
        data.state = TxnState::PrepareInProgress;
        data.gid = Some(gid.to_string());
        data.node_string = Some(node_string.to_string());
        Ok(())
    }

    /// Resolve a GID to the prepared transaction's GXID and node list.
    pub fn get_gid_data(&self, gid: &str) -> Result<GidData, GtmError> {
        let handle = self
            .handle_by_gid(gid)
            .ok_or_else(|| GtmError::UnknownGid(gid.to_string()))?;
        let data = self.slot(handle)?.read();
        Ok(GidData {
            prepared_handle: handle,
            prepared_gxid: data.gxid,
            node_string: data.node_string.clone(),
        })
    }

    /// Mark a transaction as a lazy vacuum; snapshot builders skip it.
    pub fn set_do_vacuum(&self, handle: usize) -> Result<(), GtmError> {
        self.slot(handle)?.write().do_vacuum = true;
        Ok(())
    }

    /// Record the participant-reported xmin for a transaction.
    pub fn set_reported_xmin(&self, handle: usize, xmin: Gxid) -> Result<(), GtmError> {
        self.slot(handle)?.write().xmin = xmin;
        Ok(())
    }

    /// Track a sequence created by the transaction holding `target`.
    /// Unknown GXIDs are ignored, matching the registration contract: the
    /// sequence subsystem may race with a completing transaction.
    pub fn remember_created_sequence(&self, target: Gxid, seq: SeqHandle) {
        if let Some(handle) = self.handle_by_gxid(target, true) {
            self.slots()[handle].write().created_seqs.push(seq);
        }
    }

    /// Stop tracking a sequence that was created and then dropped inside the
    /// same transaction.
    pub fn forget_created_sequence(&self, target: Gxid, seq: SeqHandle) {
        if let Some(handle) = self.handle_by_gxid(target, true) {
            let mut data = self.slots()[handle].write();
            if let Some(pos) = data.created_seqs.iter().position(|&s| s == seq) {
                data.created_seqs.remove(pos);
            }
        }
    }

    /// Track a sequence dropped by the transaction holding `target`.
    pub fn remember_dropped_sequence(&self, target: Gxid, seq: SeqHandle) {
        if let Some(handle) = self.handle_by_gxid(target, true) {
            self.slots()[handle].write().dropped_seqs.push(seq);
        }
    }

    /// Track the pre-image of a sequence altered by the transaction holding
    /// `target`. Newest first, so restores undo alterations in reverse.
    pub fn remember_altered_sequence(&self, target: Gxid, seq: SeqHandle) {
        if let Some(handle) = self.handle_by_gxid(target, true) {
            self.slots()[handle].write().altered_seqs.insert(0, seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gxid;
    use crate::txn::table::TableOptions;

    fn running_table() -> TransactionTable {
        let table = TransactionTable::new(TableOptions {
            max_open: 16,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);
        table
    }

    fn request(session: &str) -> BeginRequest {
        BeginRequest {
            session_id: session.to_string(),
            client_id: 1,
            ..BeginRequest::default()
        }
    }

    #[test]
    fn test_session_reuse_until_commit() {
        let table = running_table();
        let first = table.begin(&request("S1")).expect("begin failed");
        let again = table.begin(&request("S1")).expect("begin failed");
        assert_eq!(first, again);
        assert_eq!(table.open_count(), 1);

        assert_eq!(table.commit(Some(first), &[]), TxnStatus::Ok);

        let fresh = table.begin(&request("S1")).expect("begin failed");
        assert_ne!(fresh, first);
    }

    #[test]
    fn test_commit_unknown_handle_is_error() {
        let table = running_table();
        assert_eq!(table.commit(None, &[]), TxnStatus::Error);
        assert_eq!(table.commit(Some(9999), &[]), TxnStatus::Error);
    }

    #[test]
    fn test_dependent_commit_is_delayed_until_dependency_finishes() {
        let table = running_table();
        let h1 = table.begin(&request("S1")).expect("begin failed");
        let h2 = table.begin(&request("S2")).expect("begin failed");
        let (g1, _) = table.assign_gxid(h1).expect("assign failed");
        table.assign_gxid(h2).expect("assign failed");

        assert_eq!(table.commit(Some(h2), &[g1]), TxnStatus::Delayed);
        assert_eq!(table.open_count(), 2);

        assert_eq!(table.commit(Some(h1), &[]), TxnStatus::Ok);
        assert_eq!(table.commit(Some(h2), &[g1]), TxnStatus::Ok);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_commit_prepared_pair_shares_outcome() {
        let table = running_table();
        let blocker = table.begin(&request("S0")).expect("begin failed");
        let (blocker_gxid, _) = table.assign_gxid(blocker).expect("assign failed");

        let prepared = table.begin(&request("S1")).expect("begin failed");
        let (prepared_gxid, _) = table.assign_gxid(prepared).expect("assign failed");
        table
            .start_prepared(prepared, "GID-1", "dn1,dn2")
            .expect("start_prepared failed");
        table.prepare(prepared).expect("prepare failed");

        let driver = table.begin(&request("")).expect("begin failed");
        table.assign_gxid(driver).expect("assign failed");

        // Both delayed while the dependency is open.
        let statuses =
            table.commit_multi(&[Some(prepared), Some(driver)], &[blocker_gxid]);
        assert_eq!(statuses, vec![TxnStatus::Delayed, TxnStatus::Delayed]);
        assert!(table.is_gxid_in_progress(prepared_gxid));

        table.commit(Some(blocker), &[]);

        // Both commit together on retry.
        let statuses =
            table.commit_multi(&[Some(prepared), Some(driver)], &[blocker_gxid]);
        assert_eq!(statuses, vec![TxnStatus::Ok, TxnStatus::Ok]);
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_duplicate_gid_rejected() {
        let table = running_table();
        let h1 = table.begin(&request("S1")).expect("begin failed");
        let h2 = table.begin(&request("S2")).expect("begin failed");
        table.assign_gxids(&[h1, h2]).expect("assign failed");

        table
            .start_prepared(h1, "GID-1", "dn1")
            .expect("start_prepared failed");
        assert!(matches!(
            table.start_prepared(h2, "GID-1", "dn2"),
            Err(GtmError::DuplicateGid(_))
        ));
    }

    #[test]
    fn test_get_gid_data_returns_prepared_transaction() {
        let table = running_table();
        let handle = table.begin(&request("S1")).expect("begin failed");
        let (assigned, _) = table.assign_gxid(handle).expect("assign failed");
        table
            .start_prepared(handle, "GID-1", "dn1,co1")
            .expect("start_prepared failed");
        table.prepare(handle).expect("prepare failed");

        let data = table.get_gid_data("GID-1").expect("get_gid_data failed");
        assert_eq!(data.prepared_handle, handle);
        assert_eq!(data.prepared_gxid, assigned);
        assert_eq!(data.node_string.as_deref(), Some("dn1,co1"));

        assert!(matches!(
            table.get_gid_data("GID-unknown"),
            Err(GtmError::UnknownGid(_))
        ));
    }

    #[test]
    fn test_bkup_begin_is_idempotent() {
        let table = TransactionTable::new(TableOptions {
            max_open: 8,
            standby: true,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);

        let req = request("S1");
        table.bkup_begin(500, &req).expect("bkup begin failed");
        table.bkup_begin(500, &req).expect("bkup begin failed");

        assert_eq!(table.open_count(), 1);
        assert_eq!(table.open_gxids(), vec![500]);
        assert_eq!(table.read_next_gxid(), 501);
    }

    #[test]
    fn test_bkup_begin_anonymous_sessions_stay_distinct() {
        let table = TransactionTable::new(TableOptions {
            max_open: 8,
            standby: true,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);

        table
            .bkup_begin(500, &request(""))
            .expect("bkup begin failed");
        table
            .bkup_begin(501, &request(""))
            .expect("bkup begin failed");
        assert_eq!(table.open_count(), 2);
        assert_eq!(table.read_next_gxid(), 502);
    }

    #[test]
    fn test_do_vacuum_flag() {
        let table = running_table();
        let handle = table.begin(&request("")).expect("begin failed");
        table.set_do_vacuum(handle).expect("set_do_vacuum failed");
        assert!(table.slot(handle).unwrap().read().do_vacuum);
    }

    #[test]
    fn test_forget_created_sequence() {
        let table = running_table();
        let handle = table.begin(&request("S1")).expect("begin failed");
        let (assigned, _) = table.assign_gxid(handle).expect("assign failed");

        table.remember_created_sequence(assigned, 5);
        table.remember_created_sequence(assigned, 6);
        table.forget_created_sequence(assigned, 5);

        assert_eq!(table.slot(handle).unwrap().read().created_seqs, vec![6]);
    }
}
