mod common;

use std::sync::Arc;
use std::time::Duration;

use autotest::api::state::AppState;
use autotest::model::RunStatus;
use autotest::storage::{RunStore, SqliteRunStore};
use autotest::stream::StreamReconciler;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{queue_with, temp_store, wait_for_status, GateExecutor};

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SqliteRunStore>,
    exec: Arc<GateExecutor>,
    app: Router,
}

fn harness() -> Harness {
    let (dir, store) = temp_store();
    let exec = GateExecutor::new();
    let queue = queue_with(1, store.clone(), exec.clone());
    let streams = StreamReconciler::new(
        queue.clone(),
        store.clone(),
        Duration::from_millis(10),
        Duration::from_millis(50),
    );
    let app = autotest::api::router(AppState {
        store: store.clone(),
        queue,
        streams,
    });
    Harness {
        _dir: dir,
        store,
        exec,
        app,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::get(uri).body(Body::empty()).unwrap();
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let req = Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let (status, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = get_json(&h.app, "/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["running"], 0);
}

#[tokio::test]
async fn test_submit_rejects_invalid_config() {
    let h = harness();

    let (status, body) = post_json(&h.app, "/api/v1/runs", json!({ "prompt": "look around" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Valid configuration (URL or BrowserConfig) is required");

    let (status, body) = post_json(&h.app, "/api/v1/runs", json!({ "url": "https://example.com" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Instructions (Prompt or Steps) are required");

    assert!(h.store.list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_and_fetch_run() {
    let h = harness();

    let (status, body) = post_json(
        &h.app,
        "/api/v1/runs",
        json!({
            "browserConfig": {
                "browser_1": { "url": "https://shop.example" },
                "browser_2": { "url": "https://admin.example" }
            },
            "steps": [{ "action": "open orders", "target": "browser_2" }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = body["data"]["runId"].as_str().unwrap().to_string();

    let rec = wait_for_status(h.store.as_ref(), &run_id, RunStatus::Running).await;
    let (status, body) = get_json(&h.app, &format!("/api/v1/runs/{}", run_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["run"]["id"], run_id.as_str());
    assert_eq!(body["data"]["run"]["status"], "RUNNING");
    assert_eq!(body["data"]["liveStatus"], "RUNNING");

    let snapshot: Value = serde_json::from_str(&rec.configuration_snapshot).unwrap();
    let keys: Vec<_> = snapshot["browserConfig"].as_object().unwrap().keys().cloned().collect();
    assert_eq!(keys, vec!["browser_1", "browser_2"]);

    h.exec.release(1);
    wait_for_status(h.store.as_ref(), &run_id, RunStatus::Pass).await;
    let (_, body) = get_json(&h.app, "/api/v1/runs?limit=5").await;
    assert_eq!(body["data"][0]["id"], run_id.as_str());
    assert_eq!(body["meta"]["total"], 1);
}

#[tokio::test]
async fn test_unknown_run_is_404() {
    let h = harness();

    let (status, body) = get_json(&h.app, "/api/v1/runs/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Test run not found");

    let (status, _) = post_json(&h.app, "/api/v1/runs/nope/cancel", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let req = Request::get("/api/v1/runs/nope/events").body(Body::empty()).unwrap();
    let (status, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_via_api() {
    let h = harness();

    let (_, body) = post_json(
        &h.app,
        "/api/v1/runs",
        json!({ "url": "https://example.com", "prompt": "wait" }),
    )
    .await;
    let run_id = body["data"]["runId"].as_str().unwrap().to_string();
    wait_for_status(h.store.as_ref(), &run_id, RunStatus::Running).await;

    let (status, body) = post_json(&h.app, &format!("/api/v1/runs/{}/cancel", run_id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "CANCELLED");
    assert_eq!(body["data"]["error"], "Test stopped by user");
}

#[tokio::test]
async fn test_event_stream_for_finished_run() {
    let h = harness();

    let (_, body) = post_json(
        &h.app,
        "/api/v1/runs",
        json!({ "url": "https://example.com", "prompt": "look" }),
    )
    .await;
    let run_id = body["data"]["runId"].as_str().unwrap().to_string();
    h.exec.release(1);
    wait_for_status(h.store.as_ref(), &run_id, RunStatus::Pass).await;

    let req = Request::get(format!("/api/v1/runs/{}/events", run_id))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(body).unwrap();
    let frames: Vec<Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["type"], "log");
    assert_eq!(frames[1]["data"]["level"], "success");
    assert_eq!(frames[2], json!({ "type": "status", "status": "PASS" }));
}
