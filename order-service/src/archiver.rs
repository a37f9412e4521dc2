use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::store::{CartStore, Store};

const BATCH_SIZE: i64 = 500;

/// Moves carts nobody has touched within the retention window into cold
/// storage. Consumed carts are never archived, and a cart that is paid for
/// mid-sweep is skipped by the store's own re-check.
pub struct CartArchiver {
    store: Arc<dyn Store>,
    retention: chrono::Duration,
    interval: Duration,
}

impl CartArchiver {
    pub fn new(store: Arc<dyn Store>, retention: chrono::Duration, interval: Duration) -> Self {
        Self {
            store,
            retention,
            interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.archive_stale_carts(Utc::now()).await {
                Ok(0) => debug!("No carts to archive"),
                Ok(archived) => info!(archived, "Archived stale carts"),
                Err(e) => error!("Error archiving carts: {}", e),
            }
        }
    }

    /// Archives carts last updated before `now - retention`. Individual
    /// failures are logged and left for the next run.
    pub async fn archive_stale_carts(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.retention;
        let candidates = self.store.archivable_carts(cutoff, BATCH_SIZE).await?;

        let mut archived = 0;
        for cart_id in candidates {
            match self.store.archive_cart(cart_id, cutoff).await {
                Ok(true) => archived += 1,
                Ok(false) => debug!(%cart_id, "Cart became active again; skipped"),
                Err(e) => warn!(%cart_id, error = %e, "Failed to archive cart"),
            }
        }

        Ok(archived)
    }
}
