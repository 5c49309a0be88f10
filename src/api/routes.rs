//! API route definitions.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::model::RunConfig;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(submit_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/events", get(run_events))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "running": state.queue.running_count(),
            "queued": state.queue.queued_count(),
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let runs = state.store.list(limit).await?;
    Ok(Json(json!({ "data": runs, "meta": { "total": runs.len() } })))
}

async fn submit_run(
    State(state): State<AppState>,
    Json(config): Json<RunConfig>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    config
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let run_id = uuid::Uuid::new_v4().to_string();
    state.store.create(&run_id, &config).await?;
    state.queue.submit(run_id.clone(), config).await;

    Ok((StatusCode::ACCEPTED, Json(json!({ "data": { "runId": run_id } }))))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.store.get(&id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({
        "data": {
            "run": run,
            "liveStatus": state.queue.status(&id),
        }
    })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.queue.cancel(&id).await;
    let run = state.store.get(&id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "data": run })))
}

async fn run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let rx = state.streams.open(&id).await?.ok_or(ApiError::NotFound)?;

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    let events = frames.filter_map(|frame| async move {
        match SseEvent::default().json_data(&frame) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode stream frame");
                None
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
