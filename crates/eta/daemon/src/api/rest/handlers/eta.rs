//! Prediction handler

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use eta_types::{Prediction, PredictionQuery, SegmentKey};
use serde::Deserialize;

/// Query string of `GET /v1/eta`.
#[derive(Debug, Deserialize)]
pub struct EtaParams {
    pub route_id: String,
    pub direction_id: u8,
    pub from_stop_id: String,
    pub to_stop_id: String,
    /// Defaults to now.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_holiday: bool,
}

impl From<EtaParams> for PredictionQuery {
    fn from(params: EtaParams) -> Self {
        PredictionQuery {
            segment: SegmentKey::new(
                params.route_id,
                params.direction_id,
                params.from_stop_id,
                params.to_stop_id,
            ),
            at: params.at,
            is_holiday: params.is_holiday,
        }
    }
}

/// Blended travel-time estimate for one segment.
pub async fn get_eta(
    State(state): State<AppState>,
    params: Result<Query<EtaParams>, QueryRejection>,
) -> ApiResult<Json<Prediction>> {
    let Query(params) = params.map_err(|e| ApiError::invalid(e.body_text()))?;
    let query = PredictionQuery::from(params);
    Ok(Json(state.engine.predict(&query).await?))
}
