use serde::Deserialize;
use shared::{Purchaser, ShippingAddress};
use std::collections::HashMap;
use thiserror::Error;

pub const CHARGE_SUCCEEDED: &str = "charge.succeeded";
pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";

/// Metadata key the payment intent is created with.
pub const CART_ID_METADATA: &str = "cartId";

#[derive(Debug, Error)]
#[error("malformed event: {0}")]
pub struct MalformedEvent(pub String);

/// The parts of a successful payment the reconciliation cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub event_id: Option<String>,
    pub cart_ref: Option<String>,
    pub email: Option<String>,
    pub customer_name: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
    pub amount: i64,
    pub payment_reference: Option<String>,
}

impl PaymentConfirmation {
    /// `None` when no email was reported.
    pub fn purchaser(&self) -> Option<Purchaser> {
        let email = self.email.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
        Some(Purchaser {
            email: email.to_string(),
            customer_name: self.customer_name.clone(),
            shipping_address: self.shipping_address.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    Succeeded(PaymentConfirmation),
    Other { event_type: String },
}

#[derive(Deserialize)]
struct RawEvent {
    id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: serde_json::Value,
}

#[derive(Deserialize, Default)]
struct RawAddress {
    line1: Option<String>,
    city: Option<String>,
    postal_code: Option<String>,
    country: Option<String>,
}

impl From<RawAddress> for ShippingAddress {
    fn from(a: RawAddress) -> Self {
        Self {
            line1: a.line1,
            city: a.city,
            postal_code: a.postal_code,
            country: a.country,
        }
    }
}

#[derive(Deserialize)]
struct RawShipping {
    name: Option<String>,
    address: Option<RawAddress>,
}

#[derive(Deserialize)]
struct RawBillingDetails {
    email: Option<String>,
    name: Option<String>,
    address: Option<RawAddress>,
}

#[derive(Deserialize)]
struct RawCharge {
    id: String,
    amount: i64,
    #[serde(default)]
    metadata: HashMap<String, String>,
    billing_details: Option<RawBillingDetails>,
    receipt_email: Option<String>,
    shipping: Option<RawShipping>,
}

#[derive(Deserialize)]
struct RawPaymentIntent {
    id: String,
    amount: i64,
    amount_received: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    receipt_email: Option<String>,
    shipping: Option<RawShipping>,
}

pub fn parse_event(payload: &[u8]) -> Result<PaymentEvent, MalformedEvent> {
    let raw: RawEvent = serde_json::from_slice(payload).map_err(|e| MalformedEvent(e.to_string()))?;

    match raw.event_type.as_str() {
        CHARGE_SUCCEEDED => {
            let charge: RawCharge =
                serde_json::from_value(raw.data.object).map_err(|e| MalformedEvent(format!("charge: {}", e)))?;
            Ok(PaymentEvent::Succeeded(from_charge(raw.id, charge)))
        }
        PAYMENT_INTENT_SUCCEEDED => {
            let intent: RawPaymentIntent = serde_json::from_value(raw.data.object)
                .map_err(|e| MalformedEvent(format!("payment intent: {}", e)))?;
            Ok(PaymentEvent::Succeeded(from_payment_intent(raw.id, intent)))
        }
        _ => Ok(PaymentEvent::Other {
            event_type: raw.event_type,
        }),
    }
}

fn from_charge(event_id: Option<String>, mut charge: RawCharge) -> PaymentConfirmation {
    let (billing_email, billing_name, billing_address) = match charge.billing_details {
        Some(b) => (b.email, b.name, b.address),
        None => (None, None, None),
    };
    let (shipping_name, shipping_address) = match charge.shipping {
        Some(s) => (s.name, s.address),
        None => (None, None),
    };

    PaymentConfirmation {
        event_id,
        cart_ref: charge.metadata.remove(CART_ID_METADATA),
        email: billing_email.or(charge.receipt_email),
        customer_name: shipping_name.or(billing_name),
        shipping_address: shipping_address.or(billing_address).map(ShippingAddress::from),
        amount: charge.amount,
        payment_reference: Some(charge.id),
    }
}

fn from_payment_intent(event_id: Option<String>, mut intent: RawPaymentIntent) -> PaymentConfirmation {
    let (name, address) = match intent.shipping {
        Some(s) => (s.name, s.address),
        None => (None, None),
    };

    PaymentConfirmation {
        event_id,
        cart_ref: intent.metadata.remove(CART_ID_METADATA),
        email: intent.receipt_email,
        customer_name: name,
        shipping_address: address.map(ShippingAddress::from),
        amount: intent.amount_received.unwrap_or(intent.amount),
        payment_reference: Some(intent.id),
    }
}
