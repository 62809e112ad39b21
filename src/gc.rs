//! Periodic garbage collection of version rows outside the retention
//! window. Each pass takes the store's writer lock, so collection and
//! block ingest never overlap; readers keep serving from the WAL snapshot
//! throughout.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{IndexStore, IndexerConfig};

/// Spawn the collector loop. Does nothing forever when the configured
/// retention window is zero. The task ends when `cancel` fires.
pub fn spawn_gc(
    store: Arc<IndexStore>,
    config: IndexerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if config.retention_blocks == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(config.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match store
                .collect_garbage(config.retention_blocks, config.gc_floor)
                .await
            {
                Ok(0) => {}
                Ok(removed) => info!(removed, "collected historical version rows"),
                Err(err) => warn!(%err, "garbage collection pass failed"),
            }
        }
    })
}
