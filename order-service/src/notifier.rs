use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use shared::OrderReceipt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to publish notification: {0}")]
    Publish(String),
}

/// Customer-facing notifications. Delivery is at-least-once: callers may
/// retry after a failure, so a receipt can arrive twice.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn order_placed(&self, receipt: &OrderReceipt) -> Result<(), NotifyError>;

    async fn order_history(&self, email: &str, receipts: &[OrderReceipt]) -> Result<(), NotifyError>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Notification<'a> {
    #[serde(rename = "OrderConfirmation")]
    OrderConfirmation { receipt: &'a OrderReceipt },
    #[serde(rename = "OrderHistory")]
    OrderHistory {
        email: &'a str,
        orders: &'a [OrderReceipt],
    },
}

/// Publishes notifications as JSON for the email worker to pick up.
pub struct KafkaNotifier {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotifier {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    async fn publish(&self, key: &str, notification: &Notification<'_>) -> Result<(), NotifyError> {
        let json = serde_json::to_string(notification)?;
        let record = FutureRecord::to(&self.topic).payload(&json).key(key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotifyError::Publish(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Notifier for KafkaNotifier {
    async fn order_placed(&self, receipt: &OrderReceipt) -> Result<(), NotifyError> {
        self.publish(&receipt.email, &Notification::OrderConfirmation { receipt })
            .await?;
        info!(order_id = %receipt.order_id, topic = %self.topic, "Published order confirmation");
        Ok(())
    }

    async fn order_history(&self, email: &str, receipts: &[OrderReceipt]) -> Result<(), NotifyError> {
        self.publish(
            email,
            &Notification::OrderHistory {
                email,
                orders: receipts,
            },
        )
        .await?;
        info!(orders = receipts.len(), topic = %self.topic, "Published order history");
        Ok(())
    }
}

/// Used when no broker is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn order_placed(&self, receipt: &OrderReceipt) -> Result<(), NotifyError> {
        info!(
            order_id = %receipt.order_id,
            email = %receipt.email,
            total = receipt.total_in_pence,
            "Order confirmation (not sent, no broker configured)"
        );
        Ok(())
    }

    async fn order_history(&self, email: &str, receipts: &[OrderReceipt]) -> Result<(), NotifyError> {
        info!(%email, orders = receipts.len(), "Order history (not sent, no broker configured)");
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Captures everything it is asked to send.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub placed: Mutex<Vec<OrderReceipt>>,
        pub histories: Mutex<Vec<(String, Vec<OrderReceipt>)>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn order_placed(&self, receipt: &OrderReceipt) -> Result<(), NotifyError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(NotifyError::Publish("broker down".to_string()));
            }
            self.placed.lock().await.push(receipt.clone());
            Ok(())
        }

        async fn order_history(&self, email: &str, receipts: &[OrderReceipt]) -> Result<(), NotifyError> {
            self.histories
                .lock()
                .await
                .push((email.to_string(), receipts.to_vec()));
            Ok(())
        }
    }
}
