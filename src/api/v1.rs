use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;

use super::error::ApiError;
use crate::controller::{AppState, LastDispatch};
use crate::domain::DispatchResult;
use crate::repo::{LogQuery, LogRecord};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/logs", get(get_logs))
        .route("/status/:vehicle_id", get(get_vehicle_status))
        .route("/history", get(get_history))
        .route("/participation", get(get_participation))
}

/// `GET /api/v1/logs?from=&to=&signal_type=&vehicle_id=`
pub async fn get_logs(
    State(st): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let store = st
        .manager
        .log_store()
        .ok_or_else(|| ApiError::ServiceUnavailable("dispatch log disabled".into()))?;
    let records = store.query(&query).await?;
    Ok(Json(records))
}

pub async fn get_vehicle_status(
    State(st): State<AppState>,
    Path(vehicle_id): Path<String>,
) -> Result<Json<LastDispatch>, ApiError> {
    let store = st
        .manager
        .status_store()
        .ok_or_else(|| ApiError::ServiceUnavailable("status store disabled".into()))?;
    store
        .last_dispatch(&vehicle_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no dispatch recorded for {vehicle_id}")))
}

/// Recent dispatch results, oldest first
pub async fn get_history(State(st): State<AppState>) -> Json<Vec<DispatchResult>> {
    Json(st.manager.history())
}

#[derive(Debug, Serialize)]
pub struct ParticipationView {
    pub tracking: bool,
    pub scores: BTreeMap<String, f64>,
}

pub async fn get_participation(State(st): State<AppState>) -> Json<ParticipationView> {
    Json(ParticipationView {
        tracking: st.cfg.dispatch.track_participation,
        scores: st.manager.participation().snapshot().into_iter().collect(),
    })
}
