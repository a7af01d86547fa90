//! Health and configuration handlers

use crate::api::rest::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use eta_engine::EngineConfig;
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub storage: String,
    pub version: String,
    pub uptime: String,
}

/// Health check endpoint. Answers 503 when storage does not respond.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthCheckResponse>) {
    let (code, status, storage) = match state.engine.ping().await {
        Ok(()) => (StatusCode::OK, "healthy", "ok".to_string()),
        Err(err) => {
            tracing::warn!(error = %err, "storage ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", err.to_string())
        }
    };

    (
        code,
        Json(HealthCheckResponse {
            status: status.to_string(),
            storage,
            version: state.version.clone(),
            uptime: state.uptime(),
        }),
    )
}

/// Effective configuration response
#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub version: String,
    pub engine: EngineConfig,
}

/// Effective learning and submission safety parameters.
pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        version: state.version.clone(),
        engine: state.engine.config().clone(),
    })
}
