use anyhow::Result;
use serde::Deserialize;
use shared::{OutboxEvent, ORDER_PLACED};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::notifier::Notifier;
use crate::queries::receipts;
use crate::store::{OrderStore, OutboxStore, Store};

const BATCH_SIZE: i64 = 100;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderPlacedData {
    order_id: Uuid,
}

/// Relays committed outbox events to the notifier. Events are marked
/// processed only after a successful send, so delivery is at-least-once.
pub struct OutboxProcessor {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    wake: Arc<Notify>,
    poll_interval: Duration,
}

impl OutboxProcessor {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, wake: Arc<Notify>, poll_interval: Duration) -> Self {
        Self {
            store,
            notifier,
            wake,
            poll_interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Returns how many events were marked processed.
    pub async fn process_outbox_events(&self) -> Result<usize> {
        let pending = self.store.pending_events(BATCH_SIZE).await?;
        let mut processed = 0;

        for event in pending {
            if let Err(e) = self.publish_event(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            self.store.mark_processed(event.id).await?;
            processed += 1;
            info!(event_id = %event.id, event_type = %event.event_type, "Published outbox event");
        }

        Ok(processed)
    }

    async fn publish_event(&self, event: &OutboxEvent) -> Result<()> {
        if event.event_type != ORDER_PLACED {
            warn!(event_id = %event.id, event_type = %event.event_type, "Dropping unknown outbox event");
            return Ok(());
        }

        let data: OrderPlacedData = serde_json::from_value(event.event_data.clone())?;
        let Some(order) = self.store.order(data.order_id).await? else {
            warn!(order_id = %data.order_id, "Order deleted before its confirmation was sent");
            return Ok(());
        };

        let receipt = receipts(self.store.as_ref(), std::slice::from_ref(&order))
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("no receipt built for order {}", order.id))?;
        self.notifier.order_placed(&receipt).await?;

        Ok(())
    }
}
