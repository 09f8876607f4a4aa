use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::ledger::Ledger;
use crate::observability::WAL_COMPACTIONS_TOTAL;

/// Background task that rewrites the WAL once `threshold` events have been
/// appended since the last compaction.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&ledger, threshold).await {
            tracing::error!("compaction failed: {e}");
        }
    }
}

/// Returns the number of slots written, or `None` if the log was short enough.
pub async fn compact_if_due(ledger: &Ledger, threshold: u64) -> Result<Option<usize>, crate::ledger::LedgerError> {
    let appends = ledger.appends_since_compact().await?;
    if appends < threshold {
        return Ok(None);
    }
    let slots = ledger.compact().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    info!("compacted WAL: {appends} events -> {slots} slots");
    Ok(Some(slots))
}
