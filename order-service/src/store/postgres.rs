use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use uuid::Uuid;

use super::*;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Conditional decrement; the only write path that lowers a counter.
async fn reserve_in(conn: &mut AsyncPgConnection, product_id: Uuid, quantity: i32) -> Result<(), LedgerError> {
    let updated = diesel::update(
        products::table
            .filter(products::id.eq(product_id))
            .filter(products::available_quantity.ge(quantity)),
    )
    .set((
        products::available_quantity.eq(products::available_quantity - quantity),
        products::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;

    if updated == 1 {
        return Ok(());
    }

    let exists = diesel::select(diesel::dsl::exists(products::table.filter(products::id.eq(product_id))))
        .get_result::<bool>(conn)
        .await?;

    if exists {
        Err(LedgerError::InsufficientStock {
            product_id,
            requested: quantity,
        })
    } else {
        Err(LedgerError::NotFound(product_id))
    }
}

async fn load_cart(conn: &mut AsyncPgConnection, id: Uuid) -> StoreResult<Option<CartSnapshot>> {
    let row = carts::table
        .filter(carts::id.eq(id))
        .first::<DbCart>(conn)
        .await
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let items = cart_items::table
        .filter(cart_items::cart_id.eq(id))
        .order(cart_items::position.asc())
        .load::<DbCartItem>(conn)
        .await?;

    row.into_snapshot(items).map(Some)
}

async fn attach_items(conn: &mut AsyncPgConnection, rows: Vec<(DbOrder, String)>) -> StoreResult<Vec<Order>> {
    let ids: Vec<Uuid> = rows.iter().map(|(row, _)| row.id).collect();
    let items = order_items::table
        .filter(order_items::order_id.eq_any(&ids))
        .order(order_items::position.asc())
        .load::<DbOrderItem>(conn)
        .await?;

    rows.into_iter()
        .map(|(row, email)| {
            let lines = items.iter().filter(|item| item.order_id == row.id).cloned().collect();
            row.into_order(email, lines)
        })
        .collect()
}

#[async_trait]
impl Catalog for PgStore {
    async fn product(&self, id: Uuid) -> StoreResult<Option<Product>> {
        let mut conn = self.pool.get().await?;
        let row = products::table
            .filter(products::id.eq(id))
            .first::<DbProduct>(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Product::from))
    }

    async fn products(&self, ids: &[Uuid]) -> StoreResult<Vec<Product>> {
        let mut conn = self.pool.get().await?;
        let rows = products::table
            .filter(products::id.eq_any(ids))
            .load::<DbProduct>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Product::from).collect())
    }
}

#[async_trait]
impl InventoryLedger for PgStore {
    async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<(), LedgerError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;
        reserve_in(&mut conn, product_id, quantity).await
    }

    async fn available(&self, product_id: Uuid) -> StoreResult<Option<i32>> {
        let mut conn = self.pool.get().await?;
        let quantity = products::table
            .filter(products::id.eq(product_id))
            .select(products::available_quantity)
            .first::<i32>(&mut conn)
            .await
            .optional()?;
        Ok(quantity)
    }

    async fn set_stock(&self, product_id: Uuid, quantity: i32) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(products::table.filter(products::id.eq(product_id)))
            .set((
                products::available_quantity.eq(quantity),
                products::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated == 1)
    }
}

#[async_trait]
impl CartStore for PgStore {
    async fn insert_cart(&self, cart: &CartSnapshot) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let (row, items) = DbCart::from_snapshot(cart);

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(carts::table)
                    .values(&row)
                    .execute(conn)
                    .await?;

                diesel::insert_into(cart_items::table)
                    .values(&items)
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await
    }

    async fn cart(&self, id: Uuid) -> StoreResult<Option<CartSnapshot>> {
        let mut conn = self.pool.get().await?;
        load_cart(&mut conn, id).await
    }

    async fn attach_payment_intent(&self, id: Uuid, payment_intent_id: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(
            carts::table
                .filter(carts::id.eq(id))
                .filter(carts::status.eq(CartStatus::Open.as_str())),
        )
        .set((
            carts::payment_intent_id.eq(payment_intent_id),
            carts::status.eq(CartStatus::AwaitingPayment.as_str()),
            carts::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated == 1)
    }

    async fn archivable_carts(&self, cutoff: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let mut conn = self.pool.get().await?;
        let ids = carts::table
            .filter(carts::is_archived.eq(false))
            .filter(carts::status.ne(CartStatus::Consumed.as_str()))
            .filter(carts::updated_at.lt(cutoff))
            .order(carts::updated_at.asc())
            .limit(limit)
            .select(carts::id)
            .load::<Uuid>(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn archive_cart(&self, id: Uuid, cutoff: DateTime<Utc>) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                // Row lock taken here serializes against a concurrent
                // materialize_order claiming the same cart.
                let flagged = diesel::update(
                    carts::table
                        .filter(carts::id.eq(id))
                        .filter(carts::is_archived.eq(false))
                        .filter(carts::status.ne(CartStatus::Consumed.as_str()))
                        .filter(carts::updated_at.lt(cutoff)),
                )
                .set(carts::is_archived.eq(true))
                .get_result::<DbCart>(conn)
                .await
                .optional()?;

                let Some(cart) = flagged else {
                    return Ok(false);
                };

                let items = cart_items::table
                    .filter(cart_items::cart_id.eq(id))
                    .order(cart_items::position.asc())
                    .load::<DbCartItem>(conn)
                    .await?;

                let archived = NewArchivedCart {
                    id: Uuid::new_v4(),
                    original_cart_id: cart.id,
                    user_id: cart.user_id,
                    session_id: cart.session_id,
                    total_amount: cart.total_amount,
                    created_at: cart.created_at,
                    archived_at: Utc::now(),
                };
                let archived_items: Vec<NewArchivedCartItem> = items
                    .into_iter()
                    .map(|item| NewArchivedCartItem {
                        id: Uuid::new_v4(),
                        archived_cart_id: archived.id,
                        position: item.position,
                        product_id: item.product_id,
                        quantity: item.quantity,
                        colour: item.colour,
                        unit_price: item.unit_price,
                        created_at: item.created_at,
                    })
                    .collect();

                diesel::insert_into(archived_carts::table)
                    .values(&archived)
                    .execute(conn)
                    .await?;

                diesel::insert_into(archived_cart_items::table)
                    .values(&archived_items)
                    .execute(conn)
                    .await?;

                Ok(true)
            })
        })
        .await
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn order_for_cart(&self, cart_id: Uuid) -> StoreResult<Option<Uuid>> {
        let mut conn = self.pool.get().await?;
        let id = orders::table
            .filter(orders::cart_id.eq(cart_id))
            .select(orders::id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        Ok(id)
    }

    async fn materialize_order(&self, order: Order) -> Result<Materialized, LedgerError> {
        let mut conn = self.pool.get().await.map_err(StoreError::from)?;

        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let now = Utc::now();

                let claimed = diesel::update(
                    carts::table
                        .filter(carts::id.eq(order.cart_id))
                        .filter(carts::status.ne(CartStatus::Consumed.as_str())),
                )
                .set((
                    carts::status.eq(CartStatus::Consumed.as_str()),
                    carts::updated_at.eq(now),
                ))
                .execute(conn)
                .await?;

                if claimed == 0 {
                    return Ok(Materialized::AlreadyReconciled);
                }

                let user_id = diesel::insert_into(users::table)
                    .values((
                        users::id.eq(Uuid::new_v4()),
                        users::email.eq(&order.email),
                        users::created_at.eq(now),
                    ))
                    .on_conflict(users::email)
                    .do_update()
                    .set(users::email.eq(excluded(users::email)))
                    .returning(users::id)
                    .get_result::<Uuid>(conn)
                    .await?;

                let (row, items) = DbOrder::from_order(&order, user_id);
                let inserted = diesel::insert_into(orders::table)
                    .values(&row)
                    .on_conflict(orders::cart_id)
                    .do_nothing()
                    .execute(conn)
                    .await?;

                if inserted == 0 {
                    // An order already exists for a cart that was not marked
                    // consumed; keep the claim, create nothing.
                    return Ok(Materialized::AlreadyReconciled);
                }

                for (product_id, quantity) in order.quantities_by_product() {
                    reserve_in(conn, product_id, quantity).await?;
                }

                diesel::insert_into(order_items::table)
                    .values(&items)
                    .execute(conn)
                    .await?;

                diesel::insert_into(outbox_events::table)
                    .values(DbOutboxEvent::from(OutboxEvent::order_placed(&order)))
                    .execute(conn)
                    .await?;

                Ok(Materialized::Created(Order {
                    user_id: Some(user_id),
                    ..order
                }))
            })
        })
        .await
    }

    async fn order(&self, id: Uuid) -> StoreResult<Option<Order>> {
        let mut conn = self.pool.get().await?;
        let row = orders::table
            .inner_join(users::table)
            .filter(orders::id.eq(id))
            .select((orders::all_columns, users::email))
            .first::<(DbOrder, String)>(&mut conn)
            .await
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(attach_items(&mut conn, vec![row]).await?.pop())
    }

    async fn orders(&self) -> StoreResult<Vec<Order>> {
        let mut conn = self.pool.get().await?;
        let rows = orders::table
            .inner_join(users::table)
            .select((orders::all_columns, users::email))
            .order(orders::created_at.desc())
            .load::<(DbOrder, String)>(&mut conn)
            .await?;
        attach_items(&mut conn, rows).await
    }

    async fn orders_for_email(&self, email: &str) -> StoreResult<Vec<Order>> {
        let mut conn = self.pool.get().await?;
        let rows = orders::table
            .inner_join(users::table)
            .filter(users::email.eq(email))
            .select((orders::all_columns, users::email))
            .order(orders::created_at.desc())
            .load::<(DbOrder, String)>(&mut conn)
            .await?;
        attach_items(&mut conn, rows).await
    }

    async fn set_order_status(&self, id: Uuid, status: OrderStatus) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(orders::table.filter(orders::id.eq(id)))
            .set((
                orders::status.eq(status.as_str()),
                orders::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn delete_order(&self, id: Uuid, restock: bool) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                let items = order_items::table
                    .filter(order_items::order_id.eq(id))
                    .load::<DbOrderItem>(conn)
                    .await?;

                let deleted = diesel::delete(orders::table.filter(orders::id.eq(id)))
                    .execute(conn)
                    .await?;

                if deleted == 0 {
                    return Ok(false);
                }

                if restock {
                    for item in &items {
                        diesel::update(products::table.filter(products::id.eq(item.product_id)))
                            .set(products::available_quantity.eq(products::available_quantity + item.quantity))
                            .execute(conn)
                            .await?;
                    }
                }

                Ok(true)
            })
        })
        .await
    }

    async fn record_incident(&self, incident: &Incident) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(incidents::table)
            .values(DbIncident::from(incident))
            .on_conflict(incidents::cart_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn incidents(&self) -> StoreResult<Vec<Incident>> {
        let mut conn = self.pool.get().await?;
        let rows = incidents::table
            .order(incidents::created_at.desc())
            .load::<DbIncident>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(Incident::from).collect())
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn pending_events(&self, limit: i64) -> StoreResult<Vec<OutboxEvent>> {
        let mut conn = self.pool.get().await?;
        let rows = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_processed(&self, id: Uuid) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::{Connection, PgConnection};
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use diesel_migrations::MigrationHarness;
    use futures::future::join_all;

    async fn test_store() -> PgStore {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
        let mut sync = PgConnection::establish(&url).expect("connect");
        sync.run_pending_migrations(crate::MIGRATIONS).expect("migrations");

        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&url);
        let pool = Pool::builder().build(manager).await.expect("pool");
        PgStore::new(pool)
    }

    async fn add_product(store: &PgStore, available: i32) -> Uuid {
        let product_id = Uuid::new_v4();
        let mut conn = store.pool.get().await.expect("conn");
        diesel::insert_into(products::table)
            .values(DbProduct {
                id: product_id,
                name: "Test lamp".to_string(),
                description: String::new(),
                image_url: None,
                price_in_pence: 500,
                available_quantity: available,
                is_available: true,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .execute(&mut conn)
            .await
            .expect("insert product");
        product_id
    }

    async fn store_with_product(available: i32) -> (PgStore, Uuid) {
        let store = test_store().await;
        let product_id = add_product(&store, available).await;
        (store, product_id)
    }

    async fn paid_cart(store: &PgStore, lines: &[(Uuid, i32)], email: &str) -> Order {
        let lines = lines
            .iter()
            .map(|&(product_id, quantity)| CartLine::new(product_id, quantity, Some("brass"), 500))
            .collect();
        let cart = CartSnapshot::new(lines, None, None).expect("cart");
        store.insert_cart(&cart).await.expect("insert cart");
        order_for(&cart, email)
    }

    fn order_for(cart: &CartSnapshot, email: &str) -> Order {
        Order::materialize(
            cart,
            Purchaser {
                email: email.to_string(),
                customer_name: None,
                shipping_address: None,
            },
            cart.total_amount,
            None,
        )
    }

    fn unique_email() -> String {
        format!("{}@example.com", Uuid::new_v4().simple())
    }

    async fn stock(store: &PgStore, product_id: Uuid) -> i32 {
        store.available(product_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn concurrent_reservations_never_oversell() {
        let (store, product_id) = store_with_product(5).await;

        let attempts = (0..10).map(|_| store.reserve(product_id, 1));
        let results = join_all(attempts).await;

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 5);
        assert_eq!(store.available(product_id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn reserve_distinguishes_missing_products() {
        let (store, product_id) = store_with_product(1).await;

        assert!(matches!(
            store.reserve(product_id, 2).await,
            Err(LedgerError::InsufficientStock { requested: 2, .. })
        ));
        assert!(matches!(
            store.reserve(Uuid::new_v4(), 1).await,
            Err(LedgerError::NotFound(_))
        ));
        assert_eq!(store.available(product_id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn crossed_carts_reconcile_concurrently_without_deadlock() {
        let store = test_store().await;
        let a = add_product(&store, 1_000).await;
        let b = add_product(&store, 1_000).await;

        let mut orders = Vec::new();
        for round in 0..32 {
            let lines = if round % 2 == 0 { [(a, 1), (b, 1)] } else { [(b, 1), (a, 1)] };
            orders.push(paid_cart(&store, &lines, &unique_email()).await);
        }

        let results = join_all(orders.into_iter().map(|order| store.materialize_order(order))).await;

        for result in &results {
            assert!(matches!(result, Ok(Materialized::Created(_))), "{result:?}");
        }
        assert_eq!(stock(&store, a).await, 1_000 - 32);
        assert_eq!(stock(&store, b).await, 1_000 - 32);
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn multi_line_cart_is_all_or_nothing() {
        let store = test_store().await;
        let lamp = add_product(&store, 5).await;
        let shade = add_product(&store, 0).await;
        let order = paid_cart(&store, &[(lamp, 2), (shade, 1)], &unique_email()).await;
        let cart_id = order.cart_id;

        assert!(matches!(
            store.materialize_order(order).await,
            Err(LedgerError::InsufficientStock { product_id, requested: 1 }) if product_id == shade
        ));

        assert_eq!(stock(&store, lamp).await, 5);
        assert_eq!(stock(&store, shade).await, 0);
        assert_eq!(store.order_for_cart(cart_id).await.unwrap(), None);
        assert!(!store.cart(cart_id).await.unwrap().unwrap().is_consumed());
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn redelivered_cart_is_already_reconciled() {
        let store = test_store().await;
        let lamp = add_product(&store, 5).await;
        let email = unique_email();
        let order = paid_cart(&store, &[(lamp, 2)], &email).await;
        let cart = store.cart(order.cart_id).await.unwrap().unwrap();

        let Materialized::Created(created) = store.materialize_order(order).await.unwrap() else {
            panic!("expected a new order");
        };
        assert!(created.user_id.is_some());

        assert!(matches!(
            store.materialize_order(order_for(&cart, &email)).await,
            Ok(Materialized::AlreadyReconciled)
        ));

        assert_eq!(stock(&store, lamp).await, 3);
        assert_eq!(store.order_for_cart(cart.id).await.unwrap(), Some(created.id));
        assert_eq!(store.orders_for_email(&email).await.unwrap().len(), 1);
        assert!(store.cart(cart.id).await.unwrap().unwrap().is_consumed());
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn competing_carts_for_the_last_unit_create_one_order() {
        let store = test_store().await;
        let lamp = add_product(&store, 1).await;
        let first = paid_cart(&store, &[(lamp, 1)], &unique_email()).await;
        let second = paid_cart(&store, &[(lamp, 1)], &unique_email()).await;

        let (a, b) = tokio::join!(store.materialize_order(first), store.materialize_order(second));

        let created = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Ok(Materialized::Created(_))))
            .count();
        assert_eq!(created, 1);
        assert!(matches!(
            [a, b].into_iter().find(|r| r.is_err()),
            Some(Err(LedgerError::InsufficientStock { .. }))
        ));
        assert_eq!(stock(&store, lamp).await, 0);
    }

    #[tokio::test]
    #[ignore = "Requires a PostgreSQL database at TEST_DATABASE_URL"]
    async fn incidents_are_recorded_once_per_cart() {
        let store = test_store().await;
        let cart_id = Uuid::new_v4();

        for attempt in 0..2 {
            let incident = Incident::new(cart_id, Some(format!("ch_{attempt}")), "insufficient stock".to_string());
            store.record_incident(&incident).await.unwrap();
        }

        let recorded: Vec<Incident> = store
            .incidents()
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.cart_id == cart_id)
            .collect();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payment_reference.as_deref(), Some("ch_0"));
    }
}
