use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use super::event::CART_ID_METADATA;
use super::{GatewayError, PaymentGateway, PaymentIntent};

const STRIPE_API: &str = "https://api.stripe.com";

/// Stripe REST client (form-encoded, basic auth with the secret key).
pub struct StripeGateway {
    client: reqwest::Client,
    secret_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct IntentResponse {
    id: Option<String>,
    client_secret: Option<String>,
    error: Option<StripeError>,
}

#[derive(Deserialize)]
struct StripeError {
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key: secret_key.into(),
            base_url: STRIPE_API.to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        cart_id: Uuid,
    ) -> Result<PaymentIntent, GatewayError> {
        let amount = amount.to_string();
        let cart_id = cart_id.to_string();
        let metadata_key = format!("metadata[{}]", CART_ID_METADATA);

        let resp: IntentResponse = self
            .client
            .post(format!("{}/v1/payment_intents", self.base_url))
            .basic_auth(&self.secret_key, None::<&str>)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", currency),
                (metadata_key.as_str(), cart_id.as_str()),
                ("automatic_payment_methods[enabled]", "true"),
            ])
            .send()
            .await?
            .json()
            .await?;

        match resp {
            IntentResponse {
                id: Some(id),
                client_secret: Some(client_secret),
                ..
            } => Ok(PaymentIntent { id, client_secret }),
            IntentResponse { error, .. } => Err(GatewayError::Rejected(
                error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "payment intent response missing id".to_string()),
            )),
        }
    }
}
