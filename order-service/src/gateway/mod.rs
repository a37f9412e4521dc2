//! Payment gateway: intent creation plus inbound webhook handling.

pub mod event;
pub mod signature;
mod stripe;

pub use stripe::StripeGateway;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment for `amount` minor units, tagged with `cart_id` so the
    /// success webhook can find the snapshot again.
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        cart_id: Uuid,
    ) -> Result<PaymentIntent, GatewayError>;
}

/// Local stand-in used when no Stripe key is configured.
#[derive(Debug, Default)]
pub struct OfflineGateway;

#[async_trait]
impl PaymentGateway for OfflineGateway {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        cart_id: Uuid,
    ) -> Result<PaymentIntent, GatewayError> {
        let id = format!("pi_{}", random_token(24));
        let client_secret = format!("{}_secret_{}", id, random_token(24));
        tracing::info!(%cart_id, amount, currency, payment_intent = %id, "Created offline payment intent");
        Ok(PaymentIntent { id, client_secret })
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
