use shared::{normalize_email, Incident, Order, OrderReceipt, OrderStatus};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::notifier::{Notifier, NotifyError};
use crate::store::{Catalog, InventoryLedger, OrderStore, Store, StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Read and admin operations over placed orders. None of these touch the
/// reconciliation gates.
pub struct OrderQueries {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl OrderQueries {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Possession of both the order id and the purchaser email is the only
    /// authorization. A mismatch looks exactly like a missing order.
    pub async fn track_order(&self, order_id: Uuid, email: &str) -> Result<Order, QueryError> {
        let email = normalize_email(email);
        match self.store.order(order_id).await? {
            Some(order) if order.email == email => Ok(order),
            _ => Err(QueryError::NotFound),
        }
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>, QueryError> {
        Ok(self.store.orders().await?)
    }

    pub async fn set_status(&self, order_id: Uuid, status: OrderStatus) -> Result<Order, QueryError> {
        if !self.store.set_order_status(order_id, status).await? {
            return Err(QueryError::NotFound);
        }
        info!(%order_id, %status, "Order status changed");
        self.store.order(order_id).await?.ok_or(QueryError::NotFound)
    }

    pub async fn delete_order(&self, order_id: Uuid, restock: bool) -> Result<(), QueryError> {
        if !self.store.delete_order(order_id, restock).await? {
            return Err(QueryError::NotFound);
        }
        info!(%order_id, restock, "Order deleted");
        Ok(())
    }

    /// Sends every order placed under `email` to the notifier. Unknown
    /// addresses are silently skipped so callers cannot discover which
    /// customers exist.
    pub async fn email_order_history(&self, email: &str) -> Result<(), QueryError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(QueryError::Invalid("email is required".to_string()));
        }

        let orders = self.store.orders_for_email(&email).await?;
        if orders.is_empty() {
            info!("Order history requested for an address with no orders");
            return Ok(());
        }

        let receipts = receipts(self.store.as_ref(), &orders).await?;
        self.notifier.order_history(&email, &receipts).await?;
        Ok(())
    }

    pub async fn available_quantity(&self, product_id: Uuid) -> Result<i32, QueryError> {
        self.store.available(product_id).await?.ok_or(QueryError::NotFound)
    }

    pub async fn set_stock(&self, product_id: Uuid, quantity: i32) -> Result<(), QueryError> {
        if quantity < 0 {
            return Err(QueryError::Invalid("availableQuantity must not be negative".to_string()));
        }
        if !self.store.set_stock(product_id, quantity).await? {
            return Err(QueryError::NotFound);
        }
        info!(%product_id, quantity, "Stock overwritten");
        Ok(())
    }

    pub async fn incidents(&self) -> Result<Vec<Incident>, QueryError> {
        Ok(self.store.incidents().await?)
    }
}

/// Joins orders with current catalog display data in one catalog read.
pub async fn receipts(store: &dyn Store, orders: &[Order]) -> StoreResult<Vec<OrderReceipt>> {
    let mut ids: Vec<Uuid> = orders
        .iter()
        .flat_map(|o| o.lines.iter().map(|l| l.product_id))
        .collect();
    ids.sort();
    ids.dedup();

    let products = store.products(&ids).await?;
    Ok(orders.iter().map(|o| OrderReceipt::new(o, &products)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::testing::RecordingNotifier;
    use crate::store::{CartStore, Materialized, MemoryStore};
    use shared::{CartLine, CartSnapshot, Product, Purchaser};

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        queries: OrderQueries,
        lamp: Product,
    }

    impl Fixture {
        fn new() -> Self {
            let lamp = Product {
                id: Uuid::new_v4(),
                name: "Lamp".to_string(),
                description: "Brass desk lamp".to_string(),
                image_url: Some("/img/lamp.png".to_string()),
                price_in_pence: 4_500,
                available_quantity: 10,
                is_available: true,
            };
            let store = Arc::new(MemoryStore::with_products([lamp.clone()]));
            let notifier = Arc::new(RecordingNotifier::default());
            let queries = OrderQueries::new(store.clone(), notifier.clone());
            Self {
                store,
                notifier,
                queries,
                lamp,
            }
        }

        async fn place(&self, email: &str, quantity: i32) -> Order {
            let cart = CartSnapshot::new(
                vec![CartLine::new(self.lamp.id, quantity, None, self.lamp.price_in_pence)],
                None,
                None,
            )
            .unwrap();
            self.store.insert_cart(&cart).await.unwrap();
            let purchaser = Purchaser {
                email: email.to_string(),
                customer_name: Some("Grace".to_string()),
                shipping_address: None,
            };
            match self
                .store
                .materialize_order(Order::materialize(&cart, purchaser, cart.total_amount, None))
                .await
                .unwrap()
            {
                Materialized::Created(order) => order,
                Materialized::AlreadyReconciled => panic!("fresh cart was already reconciled"),
            }
        }
    }

    #[tokio::test]
    async fn tracking_requires_matching_email() {
        let f = Fixture::new();
        let order = f.place("grace@example.com", 1).await;

        let found = f.queries.track_order(order.id, "  Grace@Example.COM").await.unwrap();
        assert_eq!(found.id, order.id);

        assert!(matches!(
            f.queries.track_order(order.id, "mallory@example.com").await,
            Err(QueryError::NotFound)
        ));
        assert!(matches!(
            f.queries.track_order(Uuid::new_v4(), "grace@example.com").await,
            Err(QueryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn status_can_move_in_any_direction() {
        let f = Fixture::new();
        let order = f.place("grace@example.com", 1).await;

        let shipped = f.queries.set_status(order.id, OrderStatus::Delivered).await.unwrap();
        assert_eq!(shipped.status, OrderStatus::Delivered);
        let back = f.queries.set_status(order.id, OrderStatus::Pending).await.unwrap();
        assert_eq!(back.status, OrderStatus::Pending);

        assert!(matches!(
            f.queries.set_status(Uuid::new_v4(), OrderStatus::Shipped).await,
            Err(QueryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_restocks_only_when_asked() {
        let f = Fixture::new();
        let kept = f.place("grace@example.com", 2).await;
        let returned = f.place("grace@example.com", 3).await;
        assert_eq!(f.queries.available_quantity(f.lamp.id).await.unwrap(), 5);

        f.queries.delete_order(kept.id, false).await.unwrap();
        assert_eq!(f.queries.available_quantity(f.lamp.id).await.unwrap(), 5);

        f.queries.delete_order(returned.id, true).await.unwrap();
        assert_eq!(f.queries.available_quantity(f.lamp.id).await.unwrap(), 8);

        assert!(f.queries.list_orders().await.unwrap().is_empty());
        assert!(matches!(
            f.queries.delete_order(kept.id, false).await,
            Err(QueryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn order_history_goes_to_the_notifier() {
        let f = Fixture::new();
        f.place("grace@example.com", 1).await;
        f.place("grace@example.com", 2).await;
        f.place("someone@example.com", 1).await;

        f.queries.email_order_history("GRACE@example.com").await.unwrap();
        f.queries.email_order_history("nobody@example.com").await.unwrap();

        let histories = f.notifier.histories.lock().await;
        assert_eq!(histories.len(), 1);
        let (email, receipts) = &histories[0];
        assert_eq!(email, "grace@example.com");
        assert_eq!(receipts.len(), 2);
        assert!(receipts.iter().all(|r| r.lines[0].name == "Lamp"));
    }

    #[tokio::test]
    async fn stock_overwrite_rejects_negative_values() {
        let f = Fixture::new();

        f.queries.set_stock(f.lamp.id, 42).await.unwrap();
        assert_eq!(f.queries.available_quantity(f.lamp.id).await.unwrap(), 42);

        assert!(matches!(
            f.queries.set_stock(f.lamp.id, -1).await,
            Err(QueryError::Invalid(_))
        ));
        assert!(matches!(
            f.queries.set_stock(Uuid::new_v4(), 1).await,
            Err(QueryError::NotFound)
        ));
    }
}
