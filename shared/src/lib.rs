use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Colour label stored when the shopper never picked one.
pub const UNSPECIFIED_COLOUR: &str = "unspecified";

/// Outbox event type written alongside every newly materialized order.
pub const ORDER_PLACED: &str = "OrderPlaced";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub price_in_pence: i64,
    pub available_quantity: i32,
    pub is_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub colour: String,
    /// Unit price in minor currency units, copied from the catalog when the
    /// snapshot was taken.
    pub unit_price: i64,
}

impl CartLine {
    pub fn new(product_id: Uuid, quantity: i32, colour: Option<&str>, unit_price: i64) -> Self {
        let colour = colour
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(UNSPECIFIED_COLOUR)
            .to_string();

        Self {
            product_id,
            quantity,
            colour,
            unit_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    Open,
    AwaitingPayment,
    Consumed,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Open => "open",
            CartStatus::AwaitingPayment => "awaiting_payment",
            CartStatus::Consumed => "consumed",
        }
    }
}

impl FromStr for CartStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(CartStatus::Open),
            "awaiting_payment" => Ok(CartStatus::AwaitingPayment),
            "consumed" => Ok(CartStatus::Consumed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CartError {
    #[error("cart has no lines")]
    Empty,
    #[error("quantity {quantity} for product {product_id} must be at least 1")]
    InvalidQuantity { product_id: Uuid, quantity: i32 },
    #[error("price for product {product_id} is negative")]
    NegativePrice { product_id: Uuid },
    #[error("cart total overflows")]
    TotalOverflow,
}

/// Sum of `unit_price * quantity` over every line, validating each line.
pub fn cart_total(lines: &[CartLine]) -> Result<i64, CartError> {
    if lines.is_empty() {
        return Err(CartError::Empty);
    }

    lines.iter().try_fold(0i64, |total, line| {
        if line.quantity < 1 {
            return Err(CartError::InvalidQuantity {
                product_id: line.product_id,
                quantity: line.quantity,
            });
        }
        if line.unit_price < 0 {
            return Err(CartError::NegativePrice {
                product_id: line.product_id,
            });
        }

        line.unit_price
            .checked_mul(i64::from(line.quantity))
            .and_then(|subtotal| total.checked_add(subtotal))
            .ok_or(CartError::TotalOverflow)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSnapshot {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub total_amount: i64,
    pub status: CartStatus,
    pub payment_intent_id: Option<String>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lines: Vec<CartLine>,
}

impl CartSnapshot {
    /// Freezes `lines` into a new open snapshot. The total is computed here
    /// and never recomputed afterwards.
    pub fn new(
        lines: Vec<CartLine>,
        user_id: Option<Uuid>,
        session_id: Option<String>,
    ) -> Result<Self, CartError> {
        let total_amount = cart_total(&lines)?;
        let now = Utc::now();

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            session_id,
            total_amount,
            status: CartStatus::Open,
            payment_intent_id: None,
            is_archived: false,
            created_at: now,
            updated_at: now,
            lines,
        })
    }

    pub fn is_consumed(&self) -> bool {
        self.status == CartStatus::Consumed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Processing => "Processing",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OrderStatus::Pending),
            "Processing" => Ok(OrderStatus::Processing),
            "Shipped" => Ok(OrderStatus::Shipped),
            "Delivered" => Ok(OrderStatus::Delivered),
            "Cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub line1: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

impl ShippingAddress {
    pub fn is_empty(&self) -> bool {
        self.line1.is_none() && self.city.is_none() && self.postal_code.is_none() && self.country.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub colour: String,
    pub price_in_pence: i64,
}

impl From<&CartLine> for OrderLine {
    fn from(line: &CartLine) -> Self {
        Self {
            product_id: line.product_id,
            quantity: line.quantity,
            colour: line.colour.clone(),
            price_in_pence: line.unit_price,
        }
    }
}

/// Who paid, as reported by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchaser {
    pub email: String,
    pub customer_name: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub user_id: Option<Uuid>,
    pub email: String,
    pub customer_name: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
    pub status: OrderStatus,
    pub amount_paid: i64,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lines: Vec<OrderLine>,
}

impl Order {
    /// Builds the order for a paid cart. Lines are copied verbatim; nothing is
    /// re-read from the catalog. `user_id` is filled in by the store once the
    /// purchaser has been upserted.
    pub fn materialize(
        cart: &CartSnapshot,
        purchaser: Purchaser,
        amount_paid: i64,
        payment_reference: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cart_id: cart.id,
            user_id: None,
            email: normalize_email(&purchaser.email),
            customer_name: purchaser.customer_name,
            shipping_address: purchaser.shipping_address.filter(|a| !a.is_empty()),
            status: OrderStatus::Pending,
            amount_paid,
            payment_reference,
            created_at: now,
            updated_at: now,
            lines: cart.lines.iter().map(OrderLine::from).collect(),
        }
    }

    pub fn total_in_pence(&self) -> i64 {
        self.lines
            .iter()
            .map(|l| l.price_in_pence * i64::from(l.quantity))
            .sum()
    }

    /// Total quantity per product, merging lines that differ only by colour.
    /// Ordered by product id so every reservation locks rows in the same
    /// sequence.
    pub fn quantities_by_product(&self) -> Vec<(Uuid, i32)> {
        let mut merged: BTreeMap<Uuid, i32> = BTreeMap::new();
        for line in &self.lines {
            *merged.entry(line.product_id).or_insert(0) += line.quantity;
        }
        merged.into_iter().collect()
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLine {
    pub product_id: Uuid,
    pub name: String,
    pub description: String,
    pub image_url: Option<String>,
    pub quantity: i32,
    pub colour: String,
    pub price_in_pence: i64,
}

/// An order joined with catalog display data, as handed to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceipt {
    pub order_id: Uuid,
    pub email: String,
    pub customer_name: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub total_in_pence: i64,
    pub lines: Vec<ReceiptLine>,
}

impl OrderReceipt {
    /// Joins `order` with whatever display data `products` has. Products that
    /// have since left the catalog get a placeholder name; prices always come
    /// from the order.
    pub fn new(order: &Order, products: &[Product]) -> Self {
        let lines = order
            .lines
            .iter()
            .map(|line| {
                let product = products.iter().find(|p| p.id == line.product_id);
                ReceiptLine {
                    product_id: line.product_id,
                    name: product
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| "Discontinued product".to_string()),
                    description: product.map(|p| p.description.clone()).unwrap_or_default(),
                    image_url: product.and_then(|p| p.image_url.clone()),
                    quantity: line.quantity,
                    colour: line.colour.clone(),
                    price_in_pence: line.price_in_pence,
                }
            })
            .collect();

        Self {
            order_id: order.id,
            email: order.email.clone(),
            customer_name: order.customer_name.clone(),
            status: order.status,
            created_at: order.created_at,
            total_in_pence: order.total_in_pence(),
            lines,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn order_placed(order: &Order) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: order.id,
            event_type: ORDER_PLACED.to_string(),
            event_data: serde_json::json!({
                "orderId": order.id,
                "cartId": order.cart_id,
            }),
            processed: false,
            created_at: Utc::now(),
        }
    }
}

/// A paid cart that could not be turned into an order and needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: Uuid,
    pub cart_id: Uuid,
    pub payment_reference: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn new(cart_id: Uuid, payment_reference: Option<String>, reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            cart_id,
            payment_reference,
            reason,
            created_at: Utc::now(),
        }
    }
}
