//! HTTP API for bill extraction.
//!
//! Exposes the extraction pipeline as a small REST service:
//! - `GET /health` — liveness probe
//! - `POST /extract-bill-data` — run the full pipeline on a document URL
//!
//! ## Always HTTP 200
//!
//! `/extract-bill-data` reports failures in-band: the response is always
//! `200 OK` with `is_success: false` and an `error` string on failure.
//! Existing consumers of this contract branch on `is_success`, not on the
//! status code, so changing that would break them.

use crate::config::ExtractionConfig;
use crate::extract::extract;
use crate::output::ExtractResponse;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Default listen address when none is configured.
pub const DEFAULT_ADDR: &str = "0.0.0.0:10000";

/// Server state shared across handlers.
///
/// The config is read-only after startup; per-request overrides are not
/// supported, so a plain `Arc` suffices.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<ExtractionConfig>,
}

impl ApiState {
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for ApiState {
    fn default() -> Self {
        Self::new(ExtractionConfig::default())
    }
}

/// Request body for `POST /extract-bill-data`.
#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    /// HTTP/HTTPS URL (or server-local path) of the bill document.
    pub document: String,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Build the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/extract-bill-data", post(extract_bill_data))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server.
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    info!("Starting bill extraction server on {}", addr);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await
}

/// `GET /health` — liveness probe.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /extract-bill-data` — extract line items from the given document.
async fn extract_bill_data(
    State(state): State<ApiState>,
    Json(req): Json<ExtractRequest>,
) -> Json<ExtractResponse> {
    info!("Extraction request: {}", req.document);

    match extract(&req.document, &state.config).await {
        Ok(output) => Json(ExtractResponse::success(&output)),
        Err(e) => {
            error!("Extraction failed for {}: {}", req.document, e);
            Json(ExtractResponse::failure(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_endpoint_responds() {
        let app = build_router(ApiState::default());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn extract_rejects_missing_body_field() {
        let app = build_router(ApiState::default());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/extract-bill-data")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"wrong_field": "x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        // A body that fails deserialisation is the one case that is not a
        // pipeline failure, so axum's 422 is returned as-is.
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn extract_failure_is_in_band() {
        let app = build_router(ApiState::default());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/extract-bill-data")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"document": "/no/such/bill.pdf"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["is_success"], false);
        assert!(json["error"].is_string());
        assert_eq!(json["data"]["total_item_count"], 0);
    }
}
