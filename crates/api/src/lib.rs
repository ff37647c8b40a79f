//! HTTP API server for the checkout saga.
//!
//! Provides the synchronous checkout endpoints (payment intent, order
//! creation, order lookup) with structured logging (tracing) and Prometheus
//! metrics. The saga itself runs on the consumers started by the binary.

pub mod config;
pub mod error;
pub mod routes;
pub mod seed;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{CheckoutSaga, OrderInitiator, PaymentStep};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub initiator: Arc<OrderInitiator>,
    pub payment: Arc<PaymentStep>,
}

impl AppState {
    /// Exposes the synchronous entry points of a checkout saga.
    pub fn new(saga: &CheckoutSaga) -> Self {
        Self {
            initiator: saga.initiator.clone(),
            payment: saga.payment.clone(),
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::system::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/payments/intents", post(routes::payments::create_intent))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
