//! Persistence seams for the reconciliation service.
//!
//! Every cross-request guarantee (no oversell, one order per cart, one
//! consumption per cart) is enforced by the backend behind these traits, never
//! by in-process coordination in the callers.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{DbPool, PgStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel_async::pooled_connection::PoolError;
use shared::*;
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<bb8::RunError<PoolError>> for StoreError {
    fn from(e: bb8::RunError<PoolError>) -> Self {
        StoreError::Pool(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient stock for product {product_id}: requested {requested}")]
    InsufficientStock { product_id: Uuid, requested: i32 },
    #[error("product {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<diesel::result::Error> for LedgerError {
    fn from(e: diesel::result::Error) -> Self {
        LedgerError::Store(StoreError::Query(e))
    }
}

/// Result of trying to turn a paid cart into an order.
#[derive(Debug, Clone)]
pub enum Materialized {
    Created(Order),
    /// The cart was already consumed or already has an order. Nothing was
    /// written.
    AlreadyReconciled,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn product(&self, id: Uuid) -> StoreResult<Option<Product>>;

    /// Products for `ids`; unknown ids are skipped.
    async fn products(&self, ids: &[Uuid]) -> StoreResult<Vec<Product>>;
}

/// Available-quantity counters, one per product.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Atomically subtracts `quantity` if at least that much is available.
    async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<(), LedgerError>;

    async fn available(&self, product_id: Uuid) -> StoreResult<Option<i32>>;

    /// Overwrites the counter. Returns false when the product is unknown.
    async fn set_stock(&self, product_id: Uuid, quantity: i32) -> StoreResult<bool>;
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn insert_cart(&self, cart: &CartSnapshot) -> StoreResult<()>;

    async fn cart(&self, id: Uuid) -> StoreResult<Option<CartSnapshot>>;

    /// Moves an open cart to `awaiting_payment`. Returns false if the cart is
    /// unknown or no longer open.
    async fn attach_payment_intent(&self, id: Uuid, payment_intent_id: &str) -> StoreResult<bool>;

    /// Unconsumed, unarchived carts last touched before `cutoff`, oldest first.
    async fn archivable_carts(&self, cutoff: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>>;

    /// Copies the cart to cold storage and flags it archived, provided it is
    /// still archivable at `cutoff`. Returns false if it no longer was.
    async fn archive_cart(&self, id: Uuid, cutoff: DateTime<Utc>) -> StoreResult<bool>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn order_for_cart(&self, cart_id: Uuid) -> StoreResult<Option<Uuid>>;

    /// In one atomic unit: consume the cart, upsert the purchaser, insert the
    /// order and its lines, reserve every line and queue the `OrderPlaced`
    /// outbox event. Any ledger failure leaves no trace.
    async fn materialize_order(&self, order: Order) -> Result<Materialized, LedgerError>;

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>>;

    /// Newest first.
    async fn orders(&self) -> StoreResult<Vec<Order>>;

    /// Newest first. `email` must already be normalized.
    async fn orders_for_email(&self, email: &str) -> StoreResult<Vec<Order>>;

    async fn set_order_status(&self, id: Uuid, status: OrderStatus) -> StoreResult<bool>;

    /// Hard delete. With `restock`, line quantities go back to the ledger in
    /// the same unit.
    async fn delete_order(&self, id: Uuid, restock: bool) -> StoreResult<bool>;

    /// At most one incident is kept per cart; later reports for the same
    /// cart are dropped.
    async fn record_incident(&self, incident: &Incident) -> StoreResult<()>;

    /// Newest first.
    async fn incidents(&self) -> StoreResult<Vec<Incident>>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest first.
    async fn pending_events(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>>;

    async fn mark_processed(&self, id: Uuid) -> StoreResult<()>;
}

pub trait Store: Catalog + InventoryLedger + CartStore + OrderStore + OutboxStore {}

impl<T> Store for T where T: Catalog + InventoryLedger + CartStore + OrderStore + OutboxStore {}
