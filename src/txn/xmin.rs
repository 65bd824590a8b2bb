use std::collections::HashMap;

use crate::core::gxid::{self, Gxid};
use crate::txn::table::TransactionTable;

/// Report accepted, global xmin recomputed.
pub const XMIN_ERR_NONE: u32 = 0;
/// Report refused: it would move the node's xmin (or the global xmin)
/// backwards.
pub const XMIN_ERR_REGRESSION: u32 = 1;

/// Registry of the xmin each cluster node last reported.
///
/// The global xmin is the modular minimum over the node reports and the
/// xmin/GXID of every open transaction; vacuum on the data nodes must not
/// remove anything a still-running global transaction could see.
#[derive(Debug)]
pub struct XminTracker {
    reported: HashMap<(u32, String), Gxid>,
    pub recent_global_xmin: Gxid,
}

impl XminTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reported: HashMap::new(),
            recent_global_xmin: gxid::FIRST_NORMAL_GXID,
        }
    }
}

impl Default for XminTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of an xmin report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XminReply {
    pub latest_completed_gxid: Gxid,
    pub global_xmin: Gxid,
    pub errcode: u32,
}

impl TransactionTable {
    /// Handle a node's xmin report and recompute the cluster-wide xmin.
    ///
    /// A report that precedes the current global xmin is refused: the node
    /// is stale (for example it was partitioned away) and accepting it would
    /// drag the vacuum horizon backwards.
    pub fn report_xmin(&self, node_type: u32, node_name: &str, reported: Gxid) -> XminReply {
        // Collect the open-transaction floor first; the xmin registry lock
        // nests after the array lock.
        let (latest_completed, open_floor) = {
            let arr = self.array_read();
            let mut floor: Option<Gxid> = None;
            for &handle in &arr.open_list {
                let data = self.slots()[handle].read();
                let candidate = if gxid::is_valid(data.xmin) {
                    data.xmin
                } else {
                    data.gxid
                };
                if !gxid::is_valid(candidate) {
                    continue;
                }
                floor = Some(floor.map_or(candidate, |f| gxid::earlier(f, candidate)));
            }
            (arr.latest_completed_gxid, floor)
        };

        let mut tracker = self.xmin_write();

        if gxid::is_valid(reported) && gxid::precedes(reported, tracker.recent_global_xmin) {
            return XminReply {
                latest_completed_gxid: latest_completed,
                global_xmin: tracker.recent_global_xmin,
                errcode: XMIN_ERR_REGRESSION,
            };
        }

        if gxid::is_valid(reported) {
            tracker
                .reported
                .insert((node_type, node_name.to_string()), reported);
        }

        let mut global = open_floor;
        for &node_xmin in tracker.reported.values() {
            global = Some(global.map_or(node_xmin, |g| gxid::earlier(g, node_xmin)));
        }
        let global = global.unwrap_or(latest_completed);

        tracker.recent_global_xmin = global;
        drop(tracker);

        // The oldest-GXID counter trails the global xmin.
        self.gen_write().oldest_gxid = global;

        XminReply {
            latest_completed_gxid: latest_completed,
            global_xmin: global,
            errcode: XMIN_ERR_NONE,
        }
    }

    #[must_use]
    pub fn recent_global_xmin(&self) -> Gxid {
        self.xmin_read().recent_global_xmin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::lifecycle::BeginRequest;
    use crate::txn::table::TableOptions;

    fn running_table() -> TransactionTable {
        let table = TransactionTable::new(TableOptions {
            max_open: 16,
            ..TableOptions::default()
        });
        table.set_next_gxid(100);
        table
    }

    #[test]
    fn test_global_xmin_is_min_over_nodes_and_open_transactions() {
        let table = running_table();
        let handle = table
            .begin(&BeginRequest {
                session_id: "S1".to_string(),
                client_id: 1,
                ..BeginRequest::default()
            })
            .expect("begin failed");
        table.assign_gxid(handle).expect("assign failed"); // gxid 100

        let reply = table.report_xmin(1, "dn1", 140);
        assert_eq!(reply.errcode, XMIN_ERR_NONE);
        assert_eq!(reply.global_xmin, 100);

        table.commit(Some(handle), &[]);

        let reply = table.report_xmin(1, "dn1", 150);
        assert_eq!(reply.global_xmin, 150);
        assert_eq!(reply.latest_completed_gxid, 100);
        assert_eq!(table.oldest_gxid(), 150);
    }

    #[test]
    fn test_stale_report_refused() {
        let table = running_table();
        let reply = table.report_xmin(1, "dn1", 200);
        assert_eq!(reply.errcode, XMIN_ERR_NONE);

        let reply = table.report_xmin(2, "dn2", 150);
        assert_eq!(reply.errcode, XMIN_ERR_REGRESSION);
        assert_eq!(reply.global_xmin, 200);
        assert_eq!(table.recent_global_xmin(), 200);
    }

    #[test]
    fn test_newest_report_per_node_wins() {
        let table = running_table();
        table.report_xmin(1, "dn1", 200);
        let reply = table.report_xmin(1, "dn1", 250);
        assert_eq!(reply.errcode, XMIN_ERR_NONE);
        assert_eq!(reply.global_xmin, 250);
    }
}
