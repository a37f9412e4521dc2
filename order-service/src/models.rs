use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct DbProduct {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub price_in_pence: i64,
    pub available_quantity: i32,
    pub is_available: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbProduct> for Product {
    fn from(row: DbProduct) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            image_url: row.image_url,
            price_in_pence: row.price_in_pence,
            available_quantity: row.available_quantity,
            is_available: row.is_available,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::carts)]
pub struct DbCart {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub total_amount: i64,
    pub status: String,
    pub payment_intent_id: Option<String>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct DbCartItem {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub position: i32,
    pub product_id: Uuid,
    pub quantity: i32,
    pub colour: String,
    pub unit_price: i64,
    pub created_at: DateTime<Utc>,
}

impl DbCart {
    pub fn from_snapshot(cart: &CartSnapshot) -> (Self, Vec<DbCartItem>) {
        let row = Self {
            id: cart.id,
            user_id: cart.user_id,
            session_id: cart.session_id.clone(),
            total_amount: cart.total_amount,
            status: cart.status.as_str().to_string(),
            payment_intent_id: cart.payment_intent_id.clone(),
            is_archived: cart.is_archived,
            created_at: cart.created_at,
            updated_at: cart.updated_at,
        };
        let items = cart
            .lines
            .iter()
            .zip(0..)
            .map(|(line, position)| DbCartItem {
                id: Uuid::new_v4(),
                cart_id: cart.id,
                position,
                product_id: line.product_id,
                quantity: line.quantity,
                colour: line.colour.clone(),
                unit_price: line.unit_price,
                created_at: cart.created_at,
            })
            .collect();
        (row, items)
    }

    /// `items` must already be ordered by position.
    pub fn into_snapshot(self, items: Vec<DbCartItem>) -> Result<CartSnapshot, StoreError> {
        let status = self
            .status
            .parse::<CartStatus>()
            .map_err(|e| StoreError::Corrupt(format!("cart {}: {}", self.id, e)))?;

        Ok(CartSnapshot {
            id: self.id,
            user_id: self.user_id,
            session_id: self.session_id,
            total_amount: self.total_amount,
            status,
            payment_intent_id: self.payment_intent_id,
            is_archived: self.is_archived,
            created_at: self.created_at,
            updated_at: self.updated_at,
            lines: items
                .into_iter()
                .map(|item| CartLine {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    colour: item.colour,
                    unit_price: item.unit_price,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::archived_carts)]
pub struct NewArchivedCart {
    pub id: Uuid,
    pub original_cart_id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::archived_cart_items)]
pub struct NewArchivedCartItem {
    pub id: Uuid,
    pub archived_cart_id: Uuid,
    pub position: i32,
    pub product_id: Uuid,
    pub quantity: i32,
    pub colour: String,
    pub unit_price: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub user_id: Uuid,
    pub customer_name: Option<String>,
    pub ship_line1: Option<String>,
    pub ship_city: Option<String>,
    pub ship_postal_code: Option<String>,
    pub ship_country: Option<String>,
    pub status: String,
    pub amount_paid: i64,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct DbOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub product_id: Uuid,
    pub quantity: i32,
    pub colour: String,
    pub price_in_pence: i64,
}

impl DbOrder {
    pub fn from_order(order: &Order, user_id: Uuid) -> (Self, Vec<DbOrderItem>) {
        let address = order.shipping_address.clone().unwrap_or_default();
        let row = Self {
            id: order.id,
            cart_id: order.cart_id,
            user_id,
            customer_name: order.customer_name.clone(),
            ship_line1: address.line1,
            ship_city: address.city,
            ship_postal_code: address.postal_code,
            ship_country: address.country,
            status: order.status.as_str().to_string(),
            amount_paid: order.amount_paid,
            payment_reference: order.payment_reference.clone(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        };
        let items = order
            .lines
            .iter()
            .zip(0..)
            .map(|(line, position)| DbOrderItem {
                id: Uuid::new_v4(),
                order_id: order.id,
                position,
                product_id: line.product_id,
                quantity: line.quantity,
                colour: line.colour.clone(),
                price_in_pence: line.price_in_pence,
            })
            .collect();
        (row, items)
    }

    pub fn into_order(self, email: String, items: Vec<DbOrderItem>) -> Result<Order, StoreError> {
        let status = self
            .status
            .parse::<OrderStatus>()
            .map_err(|e| StoreError::Corrupt(format!("order {}: {}", self.id, e)))?;
        let address = ShippingAddress {
            line1: self.ship_line1,
            city: self.ship_city,
            postal_code: self.ship_postal_code,
            country: self.ship_country,
        };

        Ok(Order {
            id: self.id,
            cart_id: self.cart_id,
            user_id: Some(self.user_id),
            email,
            customer_name: self.customer_name,
            shipping_address: (!address.is_empty()).then_some(address),
            status,
            amount_paid: self.amount_paid,
            payment_reference: self.payment_reference,
            created_at: self.created_at,
            updated_at: self.updated_at,
            lines: items
                .into_iter()
                .map(|item| OrderLine {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    colour: item.colour,
                    price_in_pence: item.price_in_pence,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<OutboxEvent> for DbOutboxEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            event_data: event.event_data,
            processed: event.processed,
            created_at: event.created_at,
        }
    }
}

impl From<DbOutboxEvent> for OutboxEvent {
    fn from(row: DbOutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            event_data: row.event_data,
            processed: row.processed,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::incidents)]
pub struct DbIncident {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub payment_reference: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Incident> for DbIncident {
    fn from(incident: &Incident) -> Self {
        Self {
            id: incident.id,
            cart_id: incident.cart_id,
            payment_reference: incident.payment_reference.clone(),
            reason: incident.reason.clone(),
            created_at: incident.created_at,
        }
    }
}

impl From<DbIncident> for Incident {
    fn from(row: DbIncident) -> Self {
        Self {
            id: row.id,
            cart_id: row.cart_id,
            payment_reference: row.payment_reference,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}
