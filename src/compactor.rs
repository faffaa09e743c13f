use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{Engine, EngineError};

const COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the WAL if at least `threshold` records were appended since the
/// last rewrite. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    debug!("compacting wal after {appends} appends");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task: periodically compacts one tenant's WAL.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("wal compaction failed: {e}");
        }
    }
}
