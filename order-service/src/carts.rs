use serde::Deserialize;
use shared::{CartError, CartLine, CartSnapshot};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gateway::{GatewayError, PaymentGateway};
use crate::store::{Catalog, CartStore, Store, StoreError};

/// One line of the shopper's cart as sent by the storefront. Prices are never
/// taken from the client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedLine {
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(default, alias = "color")]
    pub colour: Option<String>,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Cart(#[from] CartError),
    #[error("product {0} does not exist")]
    UnknownProduct(Uuid),
    #[error("product {0} is not available for sale")]
    Unavailable(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub cart_id: Uuid,
    pub client_secret: String,
}

pub struct Checkout {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    currency: String,
}

impl Checkout {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn PaymentGateway>, currency: impl Into<String>) -> Self {
        Self {
            store,
            gateway,
            currency: currency.into(),
        }
    }

    /// Freezes the requested cart into a snapshot and opens a payment for its
    /// total.
    pub async fn open(
        &self,
        lines: &[RequestedLine],
        user_id: Option<Uuid>,
        session_id: Option<String>,
    ) -> Result<CheckoutSession, CheckoutError> {
        let cart = create_snapshot(self.store.as_ref(), lines, user_id, session_id).await?;

        let intent = self
            .gateway
            .create_payment_intent(cart.total_amount, &self.currency, cart.id)
            .await?;

        if !self.store.attach_payment_intent(cart.id, &intent.id).await? {
            warn!(cart_id = %cart.id, "Cart left the open state before its payment intent was attached");
        }

        info!(
            cart_id = %cart.id,
            total = cart.total_amount,
            payment_intent = %intent.id,
            "Opened checkout"
        );

        Ok(CheckoutSession {
            cart_id: cart.id,
            client_secret: intent.client_secret,
        })
    }
}

/// Prices every line from the catalog and stores the resulting snapshot.
pub async fn create_snapshot(
    store: &dyn Store,
    lines: &[RequestedLine],
    user_id: Option<Uuid>,
    session_id: Option<String>,
) -> Result<CartSnapshot, CheckoutError> {
    let ids: Vec<Uuid> = lines.iter().map(|l| l.product_id).collect();
    let products = store.products(&ids).await?;

    let mut priced = Vec::with_capacity(lines.len());
    for line in lines {
        let product = products
            .iter()
            .find(|p| p.id == line.product_id)
            .ok_or(CheckoutError::UnknownProduct(line.product_id))?;
        if !product.is_available {
            return Err(CheckoutError::Unavailable(product.id));
        }
        priced.push(CartLine::new(
            product.id,
            line.quantity,
            line.colour.as_deref(),
            product.price_in_pence,
        ));
    }

    let cart = CartSnapshot::new(priced, user_id, session_id)?;
    store.insert_cart(&cart).await?;
    Ok(cart)
}
