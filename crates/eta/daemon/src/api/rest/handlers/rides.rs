//! Ride summary submission handler

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use eta_types::RideSubmission;

/// Client-generated key that makes retries safe.
pub const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");

/// Set to `true` when the response is a replay of an earlier submission.
pub const IDEMPOTENT_REPLAY: HeaderName = HeaderName::from_static("idempotent-replayed");

/// Submit one ride's segment observations.
///
/// Per-segment rejections still return 200; only request-level failures
/// (malformed body, rate limit, key conflict, storage) produce an error.
pub async fn submit_ride_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let key = headers
        .get(&IDEMPOTENCY_KEY)
        .ok_or_else(|| ApiError::invalid("missing Idempotency-Key header"))?
        .to_str()
        .map_err(|_| ApiError::invalid("Idempotency-Key must be printable ASCII"))?;

    let submission: RideSubmission = serde_json::from_slice(&body).map_err(|e| {
        ApiError::InvalidRequest {
            message: "request body is not a valid ride summary".to_string(),
            details: Some(serde_json::json!({
                "line": e.line(),
                "column": e.column(),
                "reason": e.to_string(),
            })),
        }
    })?;

    let outcome = state.engine.submit(key, &submission).await?;

    let mut response = (StatusCode::OK, Json(outcome.response)).into_response();
    let out = response.headers_mut();
    out.insert(RATE_LIMIT_LIMIT, HeaderValue::from(outcome.rate.limit));
    out.insert(RATE_LIMIT_REMAINING, HeaderValue::from(outcome.rate.remaining));
    out.insert(RATE_LIMIT_RESET, HeaderValue::from(outcome.rate.reset_at.timestamp()));
    if outcome.replayed {
        out.insert(IDEMPOTENT_REPLAY, HeaderValue::from_static("true"));
    }
    Ok(response)
}
