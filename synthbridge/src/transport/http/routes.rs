//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bridge::protocol::{Message, SYNTHESIZE};
use crate::error::BridgeError;
use crate::service::BridgeService;
use crate::transport::ws;

/// HTTP status for a failed submission.
pub fn error_status(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::Start(_)
        | BridgeError::Initialize(_)
        | BridgeError::WorkerDead(_)
        | BridgeError::Protocol(_)
        | BridgeError::Encoding(_)
        | BridgeError::ShuttingDown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Bridge liveness only. Never touches the worker.
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(service): State<Arc<BridgeService>>) -> impl IntoResponse {
    let snapshot = service.snapshot();
    let status = if snapshot.state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(snapshot))
}

async fn synthesize(State(service): State<Arc<BridgeService>>, body: Bytes) -> Response {
    let fields = match Message::from_slice(&body) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Rejecting malformed synthesize body");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {e}"),
            );
        }
    };

    // Caller fields win, including `command`.
    let request = Message::command(SYNTHESIZE).merge(fields);

    match service.submit(request).await {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            let status = error_status(&e);
            tracing::error!(error = %e, %status, "Synthesize request failed");
            error_response(status, e.to_string())
        }
    }
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

/// Any origin may call. Every `OPTIONS` request is answered here as a preflight
/// with an empty body, whatever the path.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

pub fn routes(service: Arc<BridgeService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/synthesize", post(synthesize))
        .route("/ws", get(ws::upgrade))
        .route("/", get(ws::upgrade))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .with_state(service)
}
