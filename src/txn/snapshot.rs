use serde::{Deserialize, Serialize};

use crate::core::error::GtmError;
use crate::core::gxid::Gxid;
use crate::txn::slot::{IsolationLevel, TxnState};
use crate::txn::table::{TableState, TransactionTable};

/// Serialized image of one open transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub gxid: Gxid,
    pub xmin: Gxid,
    pub state: TxnState,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub client_id: u64,
    pub proxy_client_id: i32,
    pub session_id: String,
    pub gid: Option<String>,
    pub node_string: Option<String>,
    pub do_vacuum: bool,
}

/// Serialized image of the whole transaction table.
///
/// This is the payload of a `TXN_GXID_LIST` reply: applied to a fresh
/// standby it reproduces the open-transaction set and the generator
/// counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub next_gxid: Gxid,
    pub oldest_gxid: Gxid,
    pub latest_completed_gxid: Gxid,
    pub recent_global_xmin: Gxid,
    pub open: Vec<SlotSnapshot>,
}

impl TableSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, GtmError> {
        bincode::serialize(self).map_err(|e| GtmError::BinarySerialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, GtmError> {
        bincode::deserialize(data).map_err(|e| GtmError::BinarySerialization(e.to_string()))
    }
}

impl TransactionTable {
    /// Capture a consistent image of the table. Refused on a standby, which
    /// has no authoritative image to offer.
    pub fn capture_snapshot(&self) -> Result<TableSnapshot, GtmError> {
        if self.is_standby() {
            return Err(GtmError::StandbyReadOnly);
        }

        let arr = self.array_read();
        let generator = self.gen_read();

        let open = arr
            .open_list
            .iter()
            .map(|&handle| {
                let data = self.slots()[handle].read();
                SlotSnapshot {
                    gxid: data.gxid,
                    xmin: data.xmin,
                    state: data.state,
                    isolation: data.isolation,
                    read_only: data.read_only,
                    client_id: data.client_id,
                    proxy_client_id: data.proxy_client_id,
                    session_id: data.session_id.clone(),
                    gid: data.gid.clone(),
                    node_string: data.node_string.clone(),
                    do_vacuum: data.do_vacuum,
                }
            })
            .collect();

        let snapshot = TableSnapshot {
            next_gxid: generator.next_gxid,
            oldest_gxid: generator.oldest_gxid,
            latest_completed_gxid: arr.latest_completed_gxid,
            recent_global_xmin: self.xmin_read().recent_global_xmin,
            open,
        };

        drop(generator);
        drop(arr);
        Ok(snapshot)
    }

    /// Populate a freshly started table from a primary's snapshot. The table
    /// ends up `Running` with the same open set and counters.
    pub fn apply_snapshot(&self, snapshot: &TableSnapshot) -> Result<(), GtmError> {
        {
            let mut arr = self.array_write();
            if !arr.open_list.is_empty() {
                return Err(GtmError::Protocol(
                    "snapshot applied to a non-empty transaction table".to_string(),
                ));
            }

            for image in &snapshot.open {
                let handle = self.alloc_in(&mut arr)?;
                let mut data = self.slots()[handle].write();
                data.init(
                    image.isolation,
                    image.read_only,
                    &image.session_id,
                    image.client_id,
                    image.proxy_client_id,
                );
                data.gxid = image.gxid;
                data.xmin = image.xmin;
                data.state = image.state;
                data.gid = image.gid.clone();
                data.node_string = image.node_string.clone();
                data.do_vacuum = image.do_vacuum;
                drop(data);
                arr.open_list.push(handle);
            }

            arr.latest_completed_gxid = snapshot.latest_completed_gxid;
        }

        let mut generator = self.gen_write();
        generator.next_gxid = snapshot.next_gxid;
        generator.oldest_gxid = snapshot.oldest_gxid;
        generator.state = TableState::Running;
        drop(generator);

        self.xmin_write().recent_global_xmin = snapshot.recent_global_xmin;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gxid;
    use crate::txn::lifecycle::BeginRequest;
    use crate::txn::table::TableOptions;

    fn running_table(standby: bool) -> TransactionTable {
        let table = TransactionTable::new(TableOptions {
            max_open: 16,
            standby,
            ..TableOptions::default()
        });
        table.set_next_gxid(gxid::FIRST_NORMAL_GXID);
        table
    }

    #[test]
    fn test_snapshot_round_trip_onto_fresh_standby() {
        let primary = running_table(false);
        for (session, client) in [("S1", 1), ("S2", 1), ("S3", 2)] {
            let handle = primary
                .begin(&BeginRequest {
                    session_id: session.to_string(),
                    client_id: client,
                    ..BeginRequest::default()
                })
                .expect("begin failed");
            primary.assign_gxid(handle).expect("assign failed");
        }
        let prepared = primary.handle_by_session("S2").unwrap();
        primary
            .start_prepared(prepared, "GID-1", "dn1")
            .expect("start_prepared failed");
        primary.prepare(prepared).expect("prepare failed");

        let blob = primary
            .capture_snapshot()
            .expect("capture failed")
            .encode()
            .expect("encode failed");

        let standby = TransactionTable::new(TableOptions {
            max_open: 16,
            standby: true,
            ..TableOptions::default()
        });
        standby
            .apply_snapshot(&TableSnapshot::decode(&blob).expect("decode failed"))
            .expect("apply failed");

        let mut primary_open = primary.open_gxids();
        let mut standby_open = standby.open_gxids();
        primary_open.sort_unstable();
        standby_open.sort_unstable();
        assert_eq!(primary_open, standby_open);
        assert_eq!(primary.read_next_gxid(), standby.read_next_gxid());
        assert_eq!(
            primary.latest_completed_gxid(),
            standby.latest_completed_gxid()
        );
        assert!(standby.handle_by_gid("GID-1").is_some());
    }

    #[test]
    fn test_capture_refused_on_standby() {
        let standby = running_table(true);
        assert!(matches!(
            standby.capture_snapshot(),
            Err(GtmError::StandbyReadOnly)
        ));
    }

    #[test]
    fn test_apply_refused_on_populated_table() {
        let primary = running_table(false);
        primary
            .begin(&BeginRequest {
                session_id: "S1".to_string(),
                client_id: 1,
                ..BeginRequest::default()
            })
            .expect("begin failed");
        let snapshot = primary.capture_snapshot().expect("capture failed");

        assert!(matches!(
            primary.apply_snapshot(&snapshot),
            Err(GtmError::Protocol(_))
        ));
    }
}
