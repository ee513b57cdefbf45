//! Grid-operator facing endpoints
//!
//! `POST /rte/signal` takes an activation request, dispatches it on the
//! fleet synchronously and answers with the outcome.

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::ApiError;
use crate::controller::AppState;
use crate::domain::{DispatchResult, FlexibilitySignal, SignalKind};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route("/signal", post(receive_signal))
}

pub async fn ping() -> &'static str {
    "pong"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RteSignalRequest {
    pub signal_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub power: f64,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl RteSignalRequest {
    pub fn into_signal(self) -> Result<FlexibilitySignal, ApiError> {
        let kind = SignalKind::from_str(&self.signal_type).map_err(|_| {
            ApiError::ValidationError(format!("unknown signal_type '{}'", self.signal_type))
        })?;
        if !self.power.is_finite() || self.power == 0.0 {
            return Err(ApiError::ValidationError("power must be non-zero".into()));
        }
        if self.end_time <= self.start_time {
            return Err(ApiError::ValidationError(
                "end_time must be after start_time".into(),
            ));
        }
        let duration = (self.end_time - self.start_time)
            .to_std()
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;

        let mut signal = FlexibilitySignal::new(kind, self.power, duration);
        signal.timestamp = self.start_time;
        Ok(signal)
    }
}

pub async fn receive_signal(
    State(state): State<AppState>,
    payload: Result<Json<RteSignalRequest>, JsonRejection>,
) -> Result<Json<DispatchResult>, ApiError> {
    let Json(request) = payload?;
    let signal = request.into_signal()?;
    tracing::info!(
        signal = %signal.kind,
        power_kw = signal.power_kw,
        duration_s = signal.duration.as_secs(),
        "activation received"
    );
    let result = state.manager.dispatch(signal, Vec::new()).await;
    Ok(Json(result))
}
