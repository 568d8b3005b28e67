//! API layer -- axum routes, handlers, and error mapping.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::detect::DetectError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

/// Handler error, rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub enum ApiError {
    Detect(DetectError),
    BadRequest(String),
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        ApiError::Detect(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Detect(e) => {
                let (status, code) = match e {
                    DetectError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                    DetectError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
                    DetectError::UnknownVariant { .. } | DetectError::InvalidMeasurement(_) => {
                        (StatusCode::BAD_REQUEST, "bad_request")
                    }
                    DetectError::StreamClosed(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                };
                (status, code, e.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
        };
        (
            status,
            Json(json!({ "error": { "code": code, "message": message } })),
        )
            .into_response()
    }
}
