//! Checkout and order lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{Order, OrderStatus, PaymentMethod};
use saga::{CreateOrder, CreatedOrder};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::Caller;

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub payment_intent_id: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    pub order_id: OrderId,
    pub user_id: i64,
    pub status: OrderStatus,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: i64,
    pub shipping_address: String,
    pub payment_method: PaymentMethod,
    pub payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let items = order
            .items
            .iter()
            .map(|item| OrderItemResponse {
                sku: item.sku.to_string(),
                name: item.name.clone(),
                quantity: item.quantity,
                unit_price_cents: item.unit_price.cents(),
                line_total_cents: item.line_total().cents(),
            })
            .collect();

        Self {
            order_id: order.id,
            user_id: order.user_id.as_i64(),
            status: order.status,
            items,
            total_cents: order.total.cents(),
            shipping_address: order.shipping_address,
            payment_method: order.payment_method,
            payment_intent_id: order.payment_intent_id,
            created_at: order.created_at,
        }
    }
}

// -- Handlers --

/// POST /orders: check out the caller's cart.
///
/// Returns as soon as the order is stored as Pending; the saga decides the
/// final status asynchronously.
#[tracing::instrument(skip(state, req), fields(user_id = %caller.0))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreatedOrder>), ApiError> {
    let request = CreateOrder {
        user_id: caller.0,
        shipping_address: req.shipping_address,
        payment_method: req.payment_method,
        payment_intent_id: req.payment_intent_id,
    };

    let created = state.initiator.create_order(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /orders/{id}: load an order to observe the saga outcome.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = id
        .parse::<OrderId>()
        .map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))?;

    let order = state.initiator.get_order(order_id).await?;
    Ok(Json(order.into()))
}
