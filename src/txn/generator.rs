use crate::core::error::GtmError;
use crate::core::gxid::{self, Gxid};
use crate::txn::slot::TxnState;
use crate::txn::table::{TableState, TransactionTable};

/// Result of a batched GXID assignment.
pub struct AssignOutcome {
    /// GXID for every input handle, including those that already had one.
    pub gxids: Vec<Gxid>,
    /// Handles that received a GXID in this call.
    pub new_handles: Vec<usize>,
    /// When set, the caller must persist this value through the control
    /// store -- with no table lock held.
    pub save_control: Option<Gxid>,
}

impl TransactionTable {
    /// Assign GXIDs to every handle that does not have one yet.
    ///
    /// Handles with an existing GXID keep it and are skipped. The wrap-limit
    /// ladder is checked for every fresh assignment: past the stop limit no
    /// identifiers are issued at all, past the warn limit a warning is
    /// emitted. The control-checkpoint decision is made once, at the end.
    ///
    /// Standbys receive GXIDs from the primary instead of generating them.
    pub fn assign_gxids(&self, handles: &[usize]) -> Result<AssignOutcome, GtmError> {
        if self.is_standby() {
            return Err(GtmError::StandbyReadOnly);
        }

        let mut generator = self.gen_write();
        if generator.state == TableState::ShuttingDown {
            return Err(GtmError::Shutdown);
        }

        let mut gxids = Vec::with_capacity(handles.len());
        let mut new_handles = Vec::new();
        let mut last_assigned = gxid::INVALID_GXID;

        for &handle in handles {
            let slot = self.slot(handle)?;
            let mut data = slot.write();

            if gxid::is_valid(data.gxid) {
                gxids.push(data.gxid);
                continue;
            }

            let xid = generator.next_gxid;

            // Wrap protection. The test falls out fast in normal operation,
            // when the vac limit is unset or far away.
            if gxid::follows_or_equals(xid, generator.xid_vac_limit)
                && gxid::is_valid(generator.xid_vac_limit)
            {
                if gxid::follows_or_equals(xid, generator.xid_stop_limit) {
                    return Err(GtmError::WrapAroundStop);
                } else if gxid::follows_or_equals(xid, generator.xid_warn_limit) {
                    eprintln!(
                        "✗ warning: only {} transaction ids left before wraparound",
                        generator.xid_wrap_limit.wrapping_sub(xid)
                    );
                }
            }

            generator.next_gxid = gxid::advance(generator.next_gxid);

            data.gxid = xid;
            if data.state == TxnState::Starting {
                data.state = TxnState::Running;
            }
            last_assigned = xid;
            gxids.push(xid);
            new_handles.push(handle);
        }

        let save_control = generator.control_due(last_assigned).then_some(last_assigned);
        drop(generator);

        Ok(AssignOutcome {
            gxids,
            new_handles,
            save_control,
        })
    }

    /// Single-handle form of `assign_gxids`.
    pub fn assign_gxid(&self, handle: usize) -> Result<(Gxid, Option<Gxid>), GtmError> {
        let outcome = self.assign_gxids(std::slice::from_ref(&handle))?;
        Ok((outcome.gxids[0], outcome.save_control))
    }

    /// Read the next GXID without allocating it.
    #[must_use]
    pub fn read_next_gxid(&self) -> Gxid {
        self.gen_read().next_gxid
    }

    /// Seed the generator from the restored control record and switch the
    /// table from `Starting` to `Running`. Startup only.
    pub fn set_next_gxid(&self, next: Gxid) {
        let mut generator = self.gen_write();
        debug_assert_eq!(generator.state, TableState::Starting);
        generator.next_gxid = next;
        generator.state = TableState::Running;
    }

    /// Stop issuing GXIDs so the last checkpointed value stays sane across
    /// the shutdown.
    pub fn set_shutting_down(&self) {
        self.gen_write().state = TableState::ShuttingDown;
    }

    #[must_use]
    pub fn table_state(&self) -> TableState {
        self.gen_read().state
    }

    /// Install the wraparound thresholds. An invalid vac limit disables the
    /// whole ladder.
    pub fn set_wrap_limits(&self, vac: Gxid, warn: Gxid, stop: Gxid, wrap: Gxid) {
        let mut generator = self.gen_write();
        generator.xid_vac_limit = vac;
        generator.xid_warn_limit = warn;
        generator.xid_stop_limit = stop;
        generator.xid_wrap_limit = wrap;
    }

    /// Standby-side counter feed: after replaying GXIDs received from the
    /// primary, push `next_gxid` to one past the newest of them, wrapping
    /// below the reserved floor. Returns a control value to persist, if due.
    pub(crate) fn advance_to(&self, received: &[Gxid]) -> Option<Gxid> {
        let mut generator = self.gen_write();
        let mut newest = gxid::INVALID_GXID;

        for &incoming in received {
            if !gxid::is_valid(incoming) {
                continue;
            }
            if gxid::precedes_or_equals(generator.next_gxid, incoming) {
                generator.next_gxid = gxid::advance(incoming);
            }
            newest = generator.next_gxid;
        }

        generator.control_due(newest).then_some(newest)
    }

    #[must_use]
    pub fn oldest_gxid(&self) -> Gxid {
        self.gen_read().oldest_gxid
    }

    #[must_use]
    pub fn control_gxid(&self) -> Gxid {
        self.gen_read().control_gxid
    }

    /// Remember the counter image the standby has confirmed.
    pub fn set_backed_up_gxid(&self, backed_up: Gxid) {
        self.gen_write().backed_up_gxid = backed_up;
    }

    /// True when the standby's counter image is behind the live counter and
    /// a promotion would need a fresh restore point.
    #[must_use]
    pub fn needs_restore_update(&self) -> bool {
        let generator = self.gen_read();
        gxid::precedes_or_equals(generator.backed_up_gxid, generator.next_gxid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::lifecycle::BeginRequest;
    use crate::txn::table::TableOptions;

    fn running_table(control_interval: u32) -> TransactionTable {
        let table = TransactionTable::new(TableOptions {
            max_open: 32,
            control_interval,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);
        table
    }

    fn begin(table: &TransactionTable, session: &str) -> usize {
        table
            .begin(&BeginRequest {
                session_id: session.to_string(),
                client_id: 1,
                ..BeginRequest::default()
            })
            .expect("begin failed")
    }

    #[test]
    fn test_gxids_strictly_advance_and_never_repeat() {
        let table = running_table(1_000_000);
        let mut seen = Vec::new();
        for ii in 0..20 {
            let handle = begin(&table, &format!("S{ii}"));
            let (assigned, _) = table.assign_gxid(handle).expect("assign failed");
            for &earlier in &seen {
                assert_ne!(assigned, earlier);
                assert!(gxid::follows(assigned, earlier));
            }
            seen.push(assigned);
        }
        assert_eq!(table.read_next_gxid(), *seen.last().unwrap() + 1);
    }

    #[test]
    fn test_assign_skips_handles_with_gxid() {
        let table = running_table(1_000_000);
        let h1 = begin(&table, "S1");
        let h2 = begin(&table, "S2");
        let (g1, _) = table.assign_gxid(h1).expect("assign failed");

        let outcome = table.assign_gxids(&[h1, h2]).expect("assign failed");
        assert_eq!(outcome.gxids[0], g1);
        assert_eq!(outcome.new_handles, vec![h2]);
        assert_eq!(outcome.gxids[1], g1 + 1);
    }

    #[test]
    fn test_refuses_when_shutting_down() {
        let table = running_table(1_000_000);
        let handle = begin(&table, "S1");
        table.set_shutting_down();
        assert!(matches!(
            table.assign_gxid(handle),
            Err(GtmError::Shutdown)
        ));
    }

    #[test]
    fn test_refuses_on_standby() {
        let table = TransactionTable::new(TableOptions {
            max_open: 8,
            standby: true,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);
        let handle = begin(&table, "S1");
        assert!(matches!(
            table.assign_gxid(handle),
            Err(GtmError::StandbyReadOnly)
        ));
    }

    #[test]
    fn test_wrap_stop_limit_refuses_assignment() {
        let table = running_table(1_000_000);
        table.set_wrap_limits(
            gxid::FIRST_NORMAL_GXID,
            gxid::FIRST_NORMAL_GXID,
            gxid::FIRST_NORMAL_GXID,
            gxid::FIRST_NORMAL_GXID + 10,
        );
        let handle = begin(&table, "S1");
        assert!(matches!(
            table.assign_gxid(handle),
            Err(GtmError::WrapAroundStop)
        ));
        // The counter did not move and the slot stayed unassigned.
        assert_eq!(table.read_next_gxid(), gxid::FIRST_NORMAL_GXID);
        assert_eq!(
            table.slot(handle).unwrap().read().gxid,
            gxid::INVALID_GXID
        );
    }

    #[test]
    fn test_control_checkpoint_cadence() {
        let table = running_table(8);
        let mut saves = Vec::new();
        for ii in 0..20 {
            let handle = begin(&table, &format!("S{ii}"));
            let (_, save) = table.assign_gxid(handle).expect("assign failed");
            if let Some(value) = save {
                saves.push(value);
            }
            table.commit(Some(handle), &[]);
        }
        assert!(saves.len() >= 2);
        for pair in saves.windows(2) {
            assert!(gxid::follows(pair[1], pair[0]));
        }
    }

    #[test]
    fn test_standby_advance_to_received() {
        let table = TransactionTable::new(TableOptions {
            max_open: 8,
            standby: true,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);

        table.advance_to(&[100]);
        assert_eq!(table.read_next_gxid(), 101);

        // Stale replays do not move the counter backwards.
        table.advance_to(&[50]);
        assert_eq!(table.read_next_gxid(), 101);
    }

    #[test]
    fn test_promotion_enables_assignment() {
        let table = TransactionTable::new(TableOptions {
            max_open: 8,
            standby: true,
            ..TableOptions::default()
        });
        table.set_next_gxid(500);

        let handle = begin(&table, "S1");
        assert!(matches!(
            table.assign_gxid(handle),
            Err(GtmError::StandbyReadOnly)
        ));

        table.promote();
        let (assigned, _) = table.assign_gxid(handle).expect("assign after promote");
        assert_eq!(assigned, 500);
    }

    #[test]
    fn test_backed_up_xid_tracking() {
        let table = running_table(1_000_000);
        // Nothing confirmed yet, so a restore point would be needed.
        assert!(table.needs_restore_update());

        table.set_backed_up_gxid(table.read_next_gxid() + 100);
        assert!(!table.needs_restore_update());

        let handle = begin(&table, "S1");
        table.assign_gxid(handle).expect("assign failed");
        assert!(!table.needs_restore_update());
    }

    #[test]
    fn test_standby_advance_wraps_to_reserved_floor() {
        let table = TransactionTable::new(TableOptions {
            max_open: 8,
            standby: true,
            ..TableOptions::default()
        });
        table.set_next_gxid(u32::MAX - 5);

        table.advance_to(&[u32::MAX]);
        assert_eq!(table.read_next_gxid(), gxid::FIRST_NORMAL_GXID);
    }
}
