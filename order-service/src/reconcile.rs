//! Turns a confirmed payment into exactly one order.
//!
//! The gateway delivers webhooks at-least-once, possibly concurrently and in
//! any order. Exactly-once order creation rests on two gates inside the store:
//! the cart is claimed (`consumed`) in the same transaction that inserts the
//! order, and `orders.cart_id` is unique.

use shared::{Incident, Order};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gateway::event::{parse_event, MalformedEvent, PaymentConfirmation, PaymentEvent};
use crate::gateway::signature::{SignatureError, WebhookVerifier};
use crate::store::{CartStore, LedgerError, Materialized, OrderStore, Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Reconciled { order_id: Uuid },
    /// Duplicate delivery; nothing was written.
    AlreadyReconciled,
    Ignored { event_type: String },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    #[error("{0}")]
    MalformedEvent(String),
    #[error("payment event carries no cart id")]
    MissingCartId,
    #[error("cart {0} not found")]
    CartNotFound(String),
    /// The customer has paid but the order cannot be fulfilled from stock.
    #[error("cart {cart_id} cannot be fulfilled: {source}")]
    Unfulfillable { cart_id: Uuid, source: LedgerError },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<MalformedEvent> for ReconcileError {
    fn from(e: MalformedEvent) -> Self {
        ReconcileError::MalformedEvent(e.to_string())
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    verifier: WebhookVerifier,
    outbox_wake: Arc<Notify>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, verifier: WebhookVerifier, outbox_wake: Arc<Notify>) -> Self {
        Self {
            store,
            verifier,
            outbox_wake,
        }
    }

    pub async fn handle_payment_event(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            warn!(error = %e, "Rejected webhook");
            return Err(e.into());
        }

        let confirmation = match parse_event(payload) {
            Ok(PaymentEvent::Succeeded(confirmation)) => confirmation,
            Ok(PaymentEvent::Other { event_type }) => {
                info!(%event_type, "Ignoring webhook event");
                return Ok(ReconcileOutcome::Ignored { event_type });
            }
            Err(e) => {
                error!(error = %e, "Unparseable webhook event");
                return Err(e.into());
            }
        };

        let result = self.reconcile(&confirmation).await;
        if let Err(e) = &result {
            error!(
                error = %e,
                event_id = confirmation.event_id.as_deref().unwrap_or("-"),
                cart = confirmation.cart_ref.as_deref().unwrap_or("-"),
                "Failed to reconcile payment"
            );
        }
        result
    }

    /// Reconciles an already verified payment confirmation.
    pub async fn reconcile(&self, confirmation: &PaymentConfirmation) -> Result<ReconcileOutcome, ReconcileError> {
        let cart_ref = confirmation.cart_ref.as_deref().ok_or(ReconcileError::MissingCartId)?;
        let cart_id = Uuid::parse_str(cart_ref).map_err(|_| ReconcileError::CartNotFound(cart_ref.to_string()))?;
        let cart = self
            .store
            .cart(cart_id)
            .await?
            .ok_or_else(|| ReconcileError::CartNotFound(cart_ref.to_string()))?;

        if let Some(order_id) = self.store.order_for_cart(cart.id).await? {
            info!(%cart_id, %order_id, "Cart already reconciled");
            return Ok(ReconcileOutcome::AlreadyReconciled);
        }
        if cart.is_consumed() {
            info!(%cart_id, "Cart already consumed");
            return Ok(ReconcileOutcome::AlreadyReconciled);
        }

        let purchaser = confirmation
            .purchaser()
            .ok_or_else(|| ReconcileError::MalformedEvent("payment event carries no purchaser email".to_string()))?;

        if confirmation.amount != cart.total_amount {
            warn!(
                %cart_id,
                paid = confirmation.amount,
                expected = cart.total_amount,
                "Payment amount differs from cart total"
            );
        }

        let order = Order::materialize(
            &cart,
            purchaser,
            confirmation.amount,
            confirmation.payment_reference.clone(),
        );

        match self.store.materialize_order(order).await {
            Ok(Materialized::Created(order)) => {
                info!(%cart_id, order_id = %order.id, lines = order.lines.len(), "Order placed");
                self.outbox_wake.notify_one();
                Ok(ReconcileOutcome::Reconciled { order_id: order.id })
            }
            Ok(Materialized::AlreadyReconciled) => {
                info!(%cart_id, "Lost reconciliation race; cart already claimed");
                Ok(ReconcileOutcome::AlreadyReconciled)
            }
            Err(LedgerError::Store(e)) => Err(e.into()),
            Err(source) => {
                let incident = Incident::new(cart_id, confirmation.payment_reference.clone(), source.to_string());
                if let Err(e) = self.store.record_incident(&incident).await {
                    error!(%cart_id, error = %e, "Failed to record incident");
                }
                Err(ReconcileError::Unfulfillable { cart_id, source })
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::store::{CartStore, InventoryLedger, MemoryStore, OrderStore, OutboxStore};
    use futures::future::join_all;
    use shared::{CartLine, CartSnapshot, Product};

    struct Harness {
        store: Arc<MemoryStore>,
        reconciler: Reconciler,
        wake: Arc<Notify>,
    }

    impl Harness {
        fn new(products: Vec<Product>) -> Self {
            let store = Arc::new(MemoryStore::with_products(products));
            let wake = Arc::new(Notify::new());
            let reconciler = Reconciler::new(store.clone(), verifier(), wake.clone());
            Self { store, reconciler, wake }
        }

        async fn cart(&self, lines: Vec<CartLine>) -> CartSnapshot {
            let cart = CartSnapshot::new(lines, None, None).unwrap();
            self.store.insert_cart(&cart).await.unwrap();
            cart
        }

        async fn pay(&self, cart: &CartSnapshot) -> Result<ReconcileOutcome, ReconcileError> {
            let payload = charge_succeeded(Some(cart.id), Some("Ada@Example.com "), cart.total_amount);
            self.reconciler
                .handle_payment_event(&payload, Some(&signed(&payload)))
                .await
        }

        async fn stock(&self, product_id: Uuid) -> i32 {
            self.store.available(product_id).await.unwrap().unwrap()
        }
    }

    fn product(available: i32) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Teapot".to_string(),
            description: "Glazed".to_string(),
            image_url: None,
            price_in_pence: 2_000,
            available_quantity: available,
            is_available: true,
        }
    }

    fn line(product: &Product, quantity: i32) -> CartLine {
        CartLine::new(product.id, quantity, Some("teal"), product.price_in_pence)
    }

    #[tokio::test]
    async fn paid_cart_becomes_an_order_and_decrements_stock() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 2)]).await;

        let ReconcileOutcome::Reconciled { order_id } = h.pay(&cart).await.unwrap() else {
            panic!("expected a new order");
        };

        assert_eq!(h.stock(teapot.id).await, 3);
        let order = h.store.order(order_id).await.unwrap().unwrap();
        assert_eq!(order.cart_id, cart.id);
        assert_eq!(order.email, "ada@example.com");
        assert_eq!(order.amount_paid, 4_000);
        assert_eq!(order.lines.len(), 1);
        assert_eq!(order.lines[0].colour, "teal");
        assert_eq!(order.lines[0].price_in_pence, 2_000);
        assert!(order.user_id.is_some());
        assert_eq!(order.shipping_address.unwrap().city.as_deref(), Some("London"));
        assert!(h.store.cart(cart.id).await.unwrap().unwrap().is_consumed());
        assert_eq!(h.store.pending_events(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_orders_wake_the_outbox() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;

        h.pay(&cart).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(100), h.wake.notified())
            .await
            .expect("outbox was not woken");
    }

    #[tokio::test]
    async fn duplicate_delivery_is_absorbed() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 2)]).await;

        assert!(matches!(h.pay(&cart).await, Ok(ReconcileOutcome::Reconciled { .. })));
        assert_eq!(h.pay(&cart).await.unwrap(), ReconcileOutcome::AlreadyReconciled);

        assert_eq!(h.stock(teapot.id).await, 3);
        assert_eq!(h.store.orders().await.unwrap().len(), 1);
        assert_eq!(h.store.pending_events(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_create_one_order() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;

        let outcomes = join_all((0..4).map(|_| h.pay(&cart))).await;

        let created = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(ReconcileOutcome::Reconciled { .. })))
            .count();
        assert_eq!(created, 1);
        assert!(outcomes.iter().all(|o| o.is_ok()));
        assert_eq!(h.stock(teapot.id).await, 4);
    }

    #[tokio::test]
    async fn insufficient_stock_creates_nothing_and_raises_an_incident() {
        let teapot = product(1);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 2)]).await;

        let err = h.pay(&cart).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Unfulfillable {
                source: LedgerError::InsufficientStock { requested: 2, .. },
                ..
            }
        ));

        assert_eq!(h.stock(teapot.id).await, 1);
        assert!(h.store.orders().await.unwrap().is_empty());
        assert!(h.store.pending_events(10).await.unwrap().is_empty());
        assert!(!h.store.cart(cart.id).await.unwrap().unwrap().is_consumed());

        let incidents = h.store.incidents().await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].cart_id, cart.id);
        assert!(incidents[0].payment_reference.as_deref().unwrap().starts_with("ch_"));
    }

    #[tokio::test]
    async fn retried_unfulfillable_delivery_keeps_one_incident() {
        let teapot = product(0);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;

        for _ in 0..3 {
            assert!(matches!(
                h.pay(&cart).await,
                Err(ReconcileError::Unfulfillable { .. })
            ));
        }

        let incidents = h.store.incidents().await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].cart_id, cart.id);
    }

    #[tokio::test]
    async fn competing_carts_never_oversell() {
        let teapot = product(1);
        let h = Harness::new(vec![teapot.clone()]);
        let first = h.cart(vec![line(&teapot, 1)]).await;
        let second = h.cart(vec![line(&teapot, 1)]).await;

        let (a, b) = tokio::join!(h.pay(&first), h.pay(&second));

        let created = [&a, &b]
            .iter()
            .filter(|o| matches!(o, Ok(ReconcileOutcome::Reconciled { .. })))
            .count();
        assert_eq!(created, 1);
        assert!(matches!(
            [a, b].into_iter().find(|o| o.is_err()),
            Some(Err(ReconcileError::Unfulfillable { .. }))
        ));
        assert_eq!(h.stock(teapot.id).await, 0);
        assert_eq!(h.store.orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multi_line_carts_are_all_or_nothing() {
        let teapot = product(5);
        let cups = product(0);
        let h = Harness::new(vec![teapot.clone(), cups.clone()]);
        let cart = h.cart(vec![line(&teapot, 2), line(&cups, 1)]).await;

        assert!(h.pay(&cart).await.is_err());

        assert_eq!(h.stock(teapot.id).await, 5);
        assert_eq!(h.stock(cups.id).await, 0);
        assert!(h.store.orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archived_cart_still_reconciles() {
        let teapot = product(2);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;
        assert!(h.store.archive_cart(cart.id, chrono::Utc::now() + chrono::Duration::days(1)).await.unwrap());

        assert!(matches!(h.pay(&cart).await, Ok(ReconcileOutcome::Reconciled { .. })));
        assert_eq!(h.stock(teapot.id).await, 1);
    }

    #[tokio::test]
    async fn amount_mismatch_still_reconciles_with_amount_paid() {
        let teapot = product(2);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;
        let payload = charge_succeeded(Some(cart.id), Some("ada@example.com"), 1_999);

        let ReconcileOutcome::Reconciled { order_id } = h
            .reconciler
            .handle_payment_event(&payload, Some(&signed(&payload)))
            .await
            .unwrap()
        else {
            panic!("expected a new order");
        };

        assert_eq!(h.store.order(order_id).await.unwrap().unwrap().amount_paid, 1_999);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_before_anything_happens() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;
        let payload = charge_succeeded(Some(cart.id), Some("ada@example.com"), cart.total_amount);
        let forged = WebhookVerifier::new("whsec_forged", 300).sign(&payload, chrono::Utc::now().timestamp());

        assert!(matches!(
            h.reconciler.handle_payment_event(&payload, Some(&forged)).await,
            Err(ReconcileError::InvalidSignature(SignatureError::Mismatch))
        ));
        assert!(matches!(
            h.reconciler.handle_payment_event(&payload, None).await,
            Err(ReconcileError::InvalidSignature(SignatureError::Missing))
        ));
        assert_eq!(h.stock(teapot.id).await, 5);
    }

    #[tokio::test]
    async fn unresolvable_carts_are_surfaced() {
        let h = Harness::new(vec![]);

        let payload = charge_succeeded(Some(Uuid::new_v4()), Some("ada@example.com"), 100);
        assert!(matches!(
            h.reconciler.handle_payment_event(&payload, Some(&signed(&payload))).await,
            Err(ReconcileError::CartNotFound(_))
        ));

        let payload = charge_succeeded(None, Some("ada@example.com"), 100);
        assert!(matches!(
            h.reconciler.handle_payment_event(&payload, Some(&signed(&payload))).await,
            Err(ReconcileError::MissingCartId)
        ));
    }

    #[tokio::test]
    async fn missing_email_is_malformed() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;
        let payload = charge_succeeded(Some(cart.id), None, cart.total_amount);

        assert!(matches!(
            h.reconciler.handle_payment_event(&payload, Some(&signed(&payload))).await,
            Err(ReconcileError::MalformedEvent(_))
        ));
        assert_eq!(h.stock(teapot.id).await, 5);
    }

    #[tokio::test]
    async fn unrelated_events_are_ignored() {
        let h = Harness::new(vec![]);
        let payload = br#"{"id":"evt_1","type":"payment_intent.created","data":{"object":{}}}"#;

        assert_eq!(
            h.reconciler.handle_payment_event(payload, Some(&signed(payload))).await.unwrap(),
            ReconcileOutcome::Ignored {
                event_type: "payment_intent.created".to_string()
            }
        );
    }

    #[tokio::test]
    async fn second_success_event_type_for_same_cart_is_a_duplicate() {
        let teapot = product(5);
        let h = Harness::new(vec![teapot.clone()]);
        let cart = h.cart(vec![line(&teapot, 1)]).await;
        h.pay(&cart).await.unwrap();

        let payload = serde_json::json!({
            "id": "evt_pi",
            "type": "payment_intent.succeeded",
            "data": { "object": {
                "id": "pi_1",
                "amount": cart.total_amount,
                "metadata": { "cartId": cart.id.to_string() }
            }}
        })
        .to_string();

        assert_eq!(
            h.reconciler
                .handle_payment_event(payload.as_bytes(), Some(&signed(payload.as_bytes())))
                .await
                .unwrap(),
            ReconcileOutcome::AlreadyReconciled
        );
        assert_eq!(h.stock(teapot.id).await, 4);
    }
}
