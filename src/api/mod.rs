//! Control API
//!
//! Small HTTP surface next to the WhatsApp session: liveness, proactive
//! sends for external schedulers, the provider webhook, pairing status and
//! an operator reconnect.

mod handlers;

use crate::error::{AddressError, TransportError};
use crate::router::ProcessorEndpoint;
use crate::whatsapp::{CommandSender, EventSender, Session};
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<Session>,
    pub endpoints: Arc<Vec<ProcessorEndpoint>>,
    /// Webhook events are pushed into the session's event stream here.
    pub events: EventSender,
    pub commands: CommandSender,
    pub instance_name: String,
    pub default_country_code: String,
    /// Guards `/send`, `/pairing` and `/session/reconnect` when set.
    pub api_key: Option<String>,
    /// Keys a webhook may present besides the stored instance token: the
    /// provider's global key and the optional configured webhook secret.
    pub webhook_keys: Arc<Vec<String>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/send", post(handlers::send))
        .route("/webhook/whatsapp", post(handlers::webhook))
        .route("/pairing", get(handlers::pairing))
        .route("/session/reconnect", post(handlers::reconnect))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error answered as `{success: false, error}`.
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
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"success": false, "error": self.message})),
        )
            .into_response()
    }
}

impl From<AddressError> for ApiError {
    fn from(e: AddressError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        let status = match &e {
            TransportError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            TransportError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}
