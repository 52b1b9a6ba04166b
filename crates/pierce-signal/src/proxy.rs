//! HTTP surface of the signaling server: `/proxy`, `/clients` and `/health`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pierce_common::{Envelope, MessageType, PeerInfo, PeerRole, ProxyRequest};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::pending::CorrelationError;
use crate::registry::{ConnectionRegistry, RouteOutcome};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A failed request, rendered as `{"error": "..."}` with its status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<CorrelationError> for ApiError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::DuplicateRequestId(_) => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            CorrelationError::TimedOut(_) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "proxy request timed out")
            }
            CorrelationError::Abandoned(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "device disconnected")
            }
        }
    }
}

/// `POST /proxy`: run an HTTP call on a connected device over signaling.
pub async fn proxy_handler(
    State(state): State<AppState>,
    payload: Result<Json<ProxyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    if request.request_id.is_empty() {
        return Err(ApiError::bad_request("requestId is required"));
    }
    if request.device_id.is_empty() {
        return Err(ApiError::bad_request("deviceId is required"));
    }

    // Frontends share the id space but never answer proxy requests.
    if state.registry.role_of(&request.device_id).await != Some(PeerRole::Device) {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("device not connected: {}", request.device_id),
        ));
    }

    let deadline = Instant::now() + state.proxy_timeout;
    let wait = state
        .pending
        .begin(&request.request_id, &request.device_id, deadline)?;

    let envelope = Envelope::new(MessageType::ProxyRequest, &request.device_id, &request)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    info!(
        "proxying {} {} via {} ({})",
        request.method, request.url, request.device_id, request.request_id
    );

    // Dropping `wait` on the early returns below removes the pending entry.
    match state.registry.deliver(envelope).await {
        RouteOutcome::Delivered => {}
        RouteOutcome::UnknownTarget => {
            return Err(ApiError::new(
                StatusCode::NOT_FOUND,
                format!("device not connected: {}", request.device_id),
            ));
        }
        RouteOutcome::DeliveryFailed(err) => {
            warn!("proxy request {} not delivered: {}", request.request_id, err);
            return Err(ApiError::new(
                StatusCode::BAD_GATEWAY,
                format!("failed to deliver request to device: {err}"),
            ));
        }
    }

    let response = wait.wait().await?;
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// `GET /clients`: snapshot of connected peers.
pub async fn list_clients(State(registry): State<ConnectionRegistry>) -> Json<Vec<PeerInfo>> {
    Json(registry.list().await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub peers: usize,
    pub pending_requests: usize,
}

/// `GET /health`: liveness plus registry and correlation table sizes.
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok".to_string(),
        peers: state.registry.len().await,
        pending_requests: state.pending.len(),
    })
}
