use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::{Incident, Order, OrderStatus};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::carts::{Checkout, RequestedLine};
use crate::error::ApiError;
use crate::queries::OrderQueries;
use crate::reconcile::{ReconcileOutcome, Reconciler};

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<Checkout>,
    pub reconciler: Arc<Reconciler>,
    pub queries: Arc<OrderQueries>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    pub cart: Vec<RequestedLine>,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentResponse {
    pub client_secret: String,
    pub cart_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackOrderRequest {
    pub order_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderHistoryRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockBody {
    pub available_quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteOrderParams {
    #[serde(default)]
    pub restock: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/create-payment-intent", post(create_payment_intent))
        .route("/webhooks/stripe", post(stripe_webhook))
        .route("/order-tracking", post(track_order))
        .route("/orders/history", post(email_order_history))
        .route("/products/:id/quantity", get(product_quantity))
        .route("/admin/orders", get(list_orders))
        .route("/admin/orders/:id", put(update_order_status).delete(delete_order))
        .route("/admin/incidents", get(list_incidents))
        .route("/admin/products/:id/stock", put(set_stock))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentIntentRequest>,
) -> Result<Json<CreatePaymentIntentResponse>, ApiError> {
    let session = state
        .checkout
        .open(&request.cart, request.user_id, request.session_id)
        .await?;

    Ok(Json(CreatePaymentIntentResponse {
        client_secret: session.client_secret,
        cart_id: session.cart_id,
    }))
}

/// Takes the raw body: the signature covers the exact bytes the gateway sent.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let outcome = state.reconciler.handle_payment_event(&body, signature).await?;

    let outcome = match outcome {
        ReconcileOutcome::Reconciled { .. } => "reconciled",
        ReconcileOutcome::AlreadyReconciled => "already_reconciled",
        ReconcileOutcome::Ignored { .. } => "ignored",
    };
    Ok(Json(WebhookResponse { received: true, outcome }))
}

pub async fn track_order(
    State(state): State<AppState>,
    Json(request): Json<TrackOrderRequest>,
) -> Result<Json<Order>, ApiError> {
    let not_found = || ApiError::NotFound("Order not found".to_string());
    let order_id = Uuid::parse_str(request.order_id.trim()).map_err(|_| not_found())?;

    let order = state
        .queries
        .track_order(order_id, &request.email)
        .await
        .map_err(|e| match ApiError::from(e) {
            ApiError::NotFound(_) => not_found(),
            other => other,
        })?;
    Ok(Json(order))
}

pub async fn email_order_history(
    State(state): State<AppState>,
    Json(request): Json<OrderHistoryRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.queries.email_order_history(&request.email).await?;
    Ok(Json(MessageResponse {
        message: "If we have orders for that address, a summary is on its way.",
    }))
}

pub async fn product_quantity(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<StockBody>, ApiError> {
    let available_quantity = state.queries.available_quantity(product_id).await?;
    Ok(Json(StockBody { available_quantity }))
}

pub async fn list_orders(State(state): State<AppState>) -> Result<Json<Vec<Order>>, ApiError> {
    Ok(Json(state.queries.list_orders().await?))
}

pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<Order>, ApiError> {
    let status: OrderStatus = request
        .status
        .parse()
        .map_err(|e: shared::UnknownStatus| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(state.queries.set_status(order_id, status).await?))
}

pub async fn delete_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Query(params): Query<DeleteOrderParams>,
) -> Result<StatusCode, ApiError> {
    state.queries.delete_order(order_id, params.restock).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_incidents(State(state): State<AppState>) -> Result<Json<Vec<Incident>>, ApiError> {
    Ok(Json(state.queries.incidents().await?))
}

pub async fn set_stock(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(body): Json<StockBody>,
) -> Result<Json<StockBody>, ApiError> {
    state.queries.set_stock(product_id, body.available_quantity).await?;
    Ok(Json(body))
}

pub async fn health_check() -> &'static str {
    "OK"
}
