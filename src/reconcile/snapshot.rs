use tracing::{debug, instrument};

use crate::error::LedgerError;
use crate::ledger::connector::LedgerConnector;
use crate::ledger::models::{Snapshot, SENTINEL_ITEM_ID, UNMATCHED};

/// Read every item once and partition the unmatched ones by kind.
///
/// Returns `None` when the ledger holds nothing but the sentinel slot. Ids are
/// visited in ascending order, so both partitions come out sorted.
#[instrument(skip(connector))]
pub async fn collect(connector: &dyn LedgerConnector) -> Result<Option<Snapshot>, LedgerError> {
    let item_count = connector.item_count().await?;
    if item_count <= SENTINEL_ITEM_ID + 1 {
        debug!("Ledger holds no items (count {})", item_count);
        return Ok(None);
    }

    let mut snapshot = Snapshot {
        item_count,
        ..Snapshot::default()
    };

    for id in (SENTINEL_ITEM_ID + 1)..item_count {
        let counterpart = connector.match_status(id).await?;
        if counterpart != UNMATCHED {
            continue;
        }

        let item = connector.get_item(id).await?;
        if item.is_lost {
            snapshot.unmatched_lost.push(item);
        } else {
            snapshot.unmatched_found.push(item);
        }
    }

    debug!(
        "Snapshot: {} unmatched lost, {} unmatched found of {} slots",
        snapshot.unmatched_lost.len(),
        snapshot.unmatched_found.len(),
        item_count
    );

    Ok(Some(snapshot))
}
