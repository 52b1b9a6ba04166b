//! Pierce signaling server.
//!
//! Tracks which peers are connected, relays negotiation messages between
//! them, and bridges synchronous `/proxy` HTTP calls onto the asynchronous
//! signaling channel.

pub mod pending;
pub mod proxy;
pub mod registry;
pub mod signal;

use std::time::Duration;

use axum::extract::FromRef;
use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use pending::{CorrelationError, ProxyCorrelationTable, ResolveOutcome, WaitHandle};
pub use registry::{ConnectionRegistry, DeliveryError, PeerHandle, RouteOutcome};

/// Shared state injected into every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub pending: ProxyCorrelationTable,
    pub proxy_timeout: Duration,
}

impl AppState {
    pub fn new(proxy_timeout: Duration) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            pending: ProxyCorrelationTable::new(),
            proxy_timeout,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(pierce_common::PROXY_TIMEOUT)
    }
}

impl FromRef<AppState> for ConnectionRegistry {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}

impl FromRef<AppState> for ProxyCorrelationTable {
    fn from_ref(state: &AppState) -> Self {
        state.pending.clone()
    }
}

fn build_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Build the signaling router over `state`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Pierce Signaling Online" }))
        .route("/health", get(proxy::health))
        .route("/clients", get(proxy::list_clients))
        .route("/proxy", post(proxy::proxy_handler))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state)
}
