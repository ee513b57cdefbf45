//! HTTP surface, driven through the router without a socket

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use v2g_dispatch::api;
use v2g_dispatch::config::Config;
use v2g_dispatch::controller::AppState;
use v2g_dispatch::repo::LogStoreKind;

async fn app(dir: &tempfile::TempDir) -> (Router, AppState) {
    let mut cfg = Config::default();
    cfg.log_store.kind = LogStoreKind::Jsonl;
    cfg.log_store.path = dir.path().join("dispatch.jsonl");
    cfg.simulation.fleet_size = 8;
    cfg.simulation.random_seed = Some(5);
    cfg.simulation.ack_latency_ms = 1;
    cfg.dispatch.ack_timeout_ms = 300;
    let state = AppState::new(cfg).await.unwrap();
    (api::router(state.clone()), state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn activation(signal_type: &str, power: f64, minutes: i64) -> Value {
    let start = Utc::now();
    json!({
        "signal_type": signal_type,
        "start_time": start,
        "end_time": start + ChronoDuration::minutes(minutes),
        "power": power,
        "meta": { "source": "test" }
    })
}

#[tokio::test]
async fn test_ping() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;
    let (status, body) = send(&app, get("/rte/ping")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"pong");
}

#[tokio::test]
async fn test_signal_is_dispatched_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = app(&dir).await;

    let (status, body) = send(&app, post_json("/rte/signal", &activation("MA", 12.0, 15))).await;
    assert_eq!(status, StatusCode::OK);
    let result: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(result["signal"]["kind"], "MA");
    assert_eq!(result["signal"]["power_kw"], 12.0);
    assert!(result["assignments"].is_object());
    assert_eq!(state.manager.history().len(), 1);

    let (status, body) = send(&app, get("/api/v1/logs?signal_type=MA")).await;
    assert_eq!(status, StatusCode::OK);
    let logs: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(logs.as_array().unwrap().len(), 1);
    assert_eq!(logs[0]["target_power"], 12.0);

    let (_, body) = send(&app, get("/api/v1/logs?signal_type=FCR")).await;
    let logs: Value = serde_json::from_slice(&body).unwrap();
    assert!(logs.as_array().unwrap().is_empty());

    state.shutdown().await;
}

#[tokio::test]
async fn test_invalid_signals_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = app(&dir).await;

    for body in [
        activation("XYZ", 10.0, 15),
        activation("FCR", 0.0, 15),
        activation("aFRR", 10.0, -5),
        json!({ "signal_type": "FCR" }),
    ] {
        let (status, response) = send(&app, post_json("/rte/signal", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        let error: Value = serde_json::from_slice(&response).unwrap();
        assert!(error["message"].is_string());
    }
    assert!(state.manager.history().is_empty());
}

#[tokio::test]
async fn test_vehicle_status_after_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let (app, state) = app(&dir).await;

    let (status, _) = send(&app, get("/api/v1/status/nobody")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, post_json("/rte/signal", &activation("aFRR", 20.0, 30))).await;
    let result: Value = serde_json::from_slice(&body).unwrap();
    let Some(vehicle_id) = result["assignments"].as_object().and_then(|m| m.keys().next().cloned())
    else {
        // the seeded fleet had nobody connected; nothing to look up
        return;
    };

    let (status, body) = send(&app, get(&format!("/api/v1/status/{vehicle_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let last: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(last["signal_kind"], "aFRR");
    assert_eq!(last["target_power_kw"], 20.0);
    state.shutdown().await;
}

#[tokio::test]
async fn test_metrics_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(&dir).await;
    send(&app, post_json("/rte/signal", &activation("MA", 5.0, 15))).await;

    let (status, body) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("v2g_dispatch_total"));

    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["strategy"], "smart");
    assert_eq!(health["dispatches"], 1);
}
