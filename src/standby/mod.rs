// Hot-standby mirroring: for every state-changing decision on the primary
// there is a matching backup call carrying enough context to replay the
// decision deterministically on the peer.

pub mod mirror;

pub use mirror::{BkupBeginItem, MirrorClient};

use crate::core::error::GtmError;
use crate::network::client::GtmClient;
use crate::txn::table::TransactionTable;

/// Bring a freshly started standby up to date from a running primary: fetch
/// the serialized transaction table and apply it locally. After this the
/// mirror stream keeps the two in lockstep.
pub async fn bootstrap_from_primary(
    table: &TransactionTable,
    primary_addr: &str,
) -> Result<(), GtmError> {
    let mut client = GtmClient::connect(primary_addr).await?;
    let snapshot = client.gxid_list().await?;
    table.apply_snapshot(&snapshot)?;
    println!(
        "✓ Bootstrapped from primary {primary_addr}: {} open transactions, next gxid {}",
        snapshot.open.len(),
        snapshot.next_gxid
    );
    Ok(())
}
