use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::*;

/// Single-process backend used for local development and tests. One mutex
/// guards the whole state, so every trait call is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    carts: HashMap<Uuid, CartSnapshot>,
    archived_carts: Vec<(Uuid, CartSnapshot, DateTime<Utc>)>,
    users: HashMap<String, Uuid>,
    orders: Vec<Order>,
    outbox: Vec<OutboxEvent>,
    incidents: Vec<Incident>,
}

impl MemoryStore {
    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let state = State {
            products: products.into_iter().map(|p| (p.id, p)).collect(),
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    #[cfg(test)]
    pub async fn backdate_cart(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(cart) = self.state.lock().await.carts.get_mut(&id) {
            cart.updated_at = updated_at;
        }
    }

    #[cfg(test)]
    pub async fn archived_cart_ids(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .await
            .archived_carts
            .iter()
            .map(|(_, cart, _)| cart.id)
            .collect()
    }
}

impl State {
    fn is_archivable(cart: &CartSnapshot, cutoff: DateTime<Utc>) -> bool {
        !cart.is_archived && !cart.is_consumed() && cart.updated_at < cutoff
    }

    fn sorted_newest_first(mut orders: Vec<Order>) -> Vec<Order> {
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        orders
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn product(&self, id: Uuid) -> StoreResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn products(&self, ids: &[Uuid]) -> StoreResult<Vec<Product>> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.products.get(id).cloned()).collect())
    }
}

#[async_trait]
impl InventoryLedger for MemoryStore {
    async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get_mut(&product_id)
            .ok_or(LedgerError::NotFound(product_id))?;

        if product.available_quantity < quantity {
            return Err(LedgerError::InsufficientStock {
                product_id,
                requested: quantity,
            });
        }
        product.available_quantity -= quantity;
        Ok(())
    }

    async fn available(&self, product_id: Uuid) -> StoreResult<Option<i32>> {
        Ok(self
            .state
            .lock()
            .await
            .products
            .get(&product_id)
            .map(|p| p.available_quantity))
    }

    async fn set_stock(&self, product_id: Uuid, quantity: i32) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.products.get_mut(&product_id) {
            Some(product) => {
                product.available_quantity = quantity;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn insert_cart(&self, cart: &CartSnapshot) -> StoreResult<()> {
        self.state.lock().await.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn cart(&self, id: Uuid) -> StoreResult<Option<CartSnapshot>> {
        Ok(self.state.lock().await.carts.get(&id).cloned())
    }

    async fn attach_payment_intent(&self, id: Uuid, payment_intent_id: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.carts.get_mut(&id) {
            Some(cart) if cart.status == CartStatus::Open => {
                cart.payment_intent_id = Some(payment_intent_id.to_string());
                cart.status = CartStatus::AwaitingPayment;
                cart.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn archivable_carts(&self, cutoff: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut carts: Vec<&CartSnapshot> = state
            .carts
            .values()
            .filter(|cart| State::is_archivable(cart, cutoff))
            .collect();
        carts.sort_by_key(|cart| cart.updated_at);

        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(carts.into_iter().take(limit).map(|cart| cart.id).collect())
    }

    async fn archive_cart(&self, id: Uuid, cutoff: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(cart) = state.carts.get_mut(&id) else {
            return Ok(false);
        };
        if !State::is_archivable(cart, cutoff) {
            return Ok(false);
        }

        cart.is_archived = true;
        let copy = cart.clone();
        state.archived_carts.push((Uuid::new_v4(), copy, Utc::now()));
        Ok(true)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn order_for_cart(&self, cart_id: Uuid) -> StoreResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.cart_id == cart_id).map(|o| o.id))
    }

    async fn materialize_order(&self, mut order: Order) -> Result<Materialized, LedgerError> {
        let mut state = self.state.lock().await;

        let claimable = state
            .carts
            .get(&order.cart_id)
            .is_some_and(|cart| !cart.is_consumed());
        if !claimable || state.orders.iter().any(|o| o.cart_id == order.cart_id) {
            return Ok(Materialized::AlreadyReconciled);
        }

        // Stage every decrement first so a failing line leaves the counters
        // untouched.
        let mut staged: Vec<(Uuid, i32)> = Vec::new();
        for (product_id, quantity) in order.quantities_by_product() {
            let product = state
                .products
                .get(&product_id)
                .ok_or(LedgerError::NotFound(product_id))?;
            if product.available_quantity < quantity {
                return Err(LedgerError::InsufficientStock {
                    product_id,
                    requested: quantity,
                });
            }
            staged.push((product_id, product.available_quantity - quantity));
        }

        for (product_id, remaining) in staged {
            if let Some(product) = state.products.get_mut(&product_id) {
                product.available_quantity = remaining;
            }
        }

        let user_id = *state
            .users
            .entry(order.email.clone())
            .or_insert_with(Uuid::new_v4);
        order.user_id = Some(user_id);

        if let Some(cart) = state.carts.get_mut(&order.cart_id) {
            cart.status = CartStatus::Consumed;
            cart.updated_at = Utc::now();
        }

        state.outbox.push(OutboxEvent::order_placed(&order));
        state.orders.push(order.clone());

        Ok(Materialized::Created(order))
    }

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.id == id).cloned())
    }

    async fn orders(&self) -> StoreResult<Vec<Order>> {
        let orders = self.state.lock().await.orders.clone();
        Ok(State::sorted_newest_first(orders))
    }

    async fn orders_for_email(&self, email: &str) -> StoreResult<Vec<Order>> {
        let state = self.state.lock().await;
        let orders = state.orders.iter().filter(|o| o.email == email).cloned().collect();
        Ok(State::sorted_newest_first(orders))
    }

    async fn set_order_status(&self, id: Uuid, status: OrderStatus) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.orders.iter_mut().find(|o| o.id == id) {
            Some(order) => {
                order.status = status;
                order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_order(&self, id: Uuid, restock: bool) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(index) = state.orders.iter().position(|o| o.id == id) else {
            return Ok(false);
        };
        let order = state.orders.remove(index);

        if restock {
            for line in &order.lines {
                if let Some(product) = state.products.get_mut(&line.product_id) {
                    product.available_quantity += line.quantity;
                }
            }
        }
        Ok(true)
    }

    async fn record_incident(&self, incident: &Incident) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.incidents.iter().any(|i| i.cart_id == incident.cart_id) {
            state.incidents.push(incident.clone());
        }
        Ok(())
    }

    async fn incidents(&self) -> StoreResult<Vec<Incident>> {
        let mut incidents = self.state.lock().await.incidents.clone();
        incidents.reverse();
        Ok(incidents)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn pending_events(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .outbox
            .iter()
            .filter(|e| !e.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(event) = state.outbox.iter_mut().find(|e| e.id == id) {
            event.processed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(available: i32) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Lamp".to_string(),
            description: String::new(),
            image_url: None,
            price_in_pence: 500,
            available_quantity: available,
            is_available: true,
        }
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell() {
        let lamp = product(5);
        let lamp_id = lamp.id;
        let store = std::sync::Arc::new(MemoryStore::with_products([lamp]));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.reserve(lamp_id, 1).await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 5);
        assert_eq!(store.available(lamp_id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn reserve_reports_missing_and_short_products() {
        let lamp = product(1);
        let store = MemoryStore::with_products([lamp.clone()]);

        assert!(matches!(
            store.reserve(lamp.id, 2).await,
            Err(LedgerError::InsufficientStock { requested: 2, .. })
        ));
        assert!(matches!(
            store.reserve(Uuid::new_v4(), 1).await,
            Err(LedgerError::NotFound(_))
        ));
        assert_eq!(store.available(lamp.id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn materialize_counts_split_colour_lines_together() {
        let lamp = product(4);
        let store = MemoryStore::with_products([lamp.clone()]);
        let cart = CartSnapshot::new(
            vec![
                CartLine::new(lamp.id, 3, Some("red"), 500),
                CartLine::new(lamp.id, 2, Some("blue"), 500),
            ],
            None,
            None,
        )
        .unwrap();
        store.insert_cart(&cart).await.unwrap();

        let order = Order::materialize(
            &cart,
            Purchaser {
                email: "a@b.c".to_string(),
                customer_name: None,
                shipping_address: None,
            },
            cart.total_amount,
            None,
        );

        assert!(matches!(
            store.materialize_order(order).await,
            Err(LedgerError::InsufficientStock { .. })
        ));
        assert_eq!(store.available(lamp.id).await.unwrap(), Some(4));
        assert!(!store.cart(cart.id).await.unwrap().unwrap().is_consumed());
    }
}
