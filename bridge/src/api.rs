use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use aiseg_common::{snapshot_entities, SensorRecord};

use crate::{
    coordinator::{PollCoordinator, RefreshError, RefreshHealth},
    session::Transport,
};

pub struct AppState<T: Transport> {
    pub coordinator: Arc<PollCoordinator<T>>,
    pub host: String,
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            host: self.host.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SensorView {
    #[serde(flatten)]
    record: SensorRecord,
    available: bool,
}

#[derive(Debug, Serialize)]
struct AvailabilityView {
    #[serde(rename = "deviceId")]
    device_id: String,
    available: bool,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    health: RefreshHealth,
    sensors: usize,
    #[serde(rename = "fetchedAt")]
    fetched_at: Option<DateTime<Utc>>,
}

pub fn router<T: Transport>(state: AppState<T>) -> Router {
    Router::new()
        .route("/api/snapshot", get(handle_get_snapshot::<T>))
        .route("/api/sensors/{device_id}", get(handle_get_sensor::<T>))
        .route(
            "/api/sensors/{device_id}/availability",
            get(handle_get_availability::<T>),
        )
        .route("/api/entities", get(handle_get_entities::<T>))
        .route("/api/status", get(handle_get_status::<T>))
        .route("/api/refresh", post(handle_post_refresh::<T>))
        .with_state(state)
}

async fn handle_get_snapshot<T: Transport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let snapshot = state.coordinator.current_snapshot();
    Json(snapshot.as_ref().clone())
}

async fn handle_get_sensor<T: Transport>(
    State(state): State<AppState<T>>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let snapshot = state.coordinator.current_snapshot();
    let Some(record) = snapshot.get(&device_id) else {
        return error_response(StatusCode::NOT_FOUND, "Unknown sensor");
    };

    Json(SensorView {
        available: record.is_online(),
        record: record.clone(),
    })
    .into_response()
}

async fn handle_get_availability<T: Transport>(
    State(state): State<AppState<T>>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    Json(AvailabilityView {
        available: state.coordinator.is_available(&device_id),
        device_id,
    })
}

async fn handle_get_entities<T: Transport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let snapshot = state.coordinator.current_snapshot();
    Json(snapshot_entities(&snapshot, &state.host))
}

async fn handle_get_status<T: Transport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let snapshot = state.coordinator.current_snapshot();
    Json(StatusView {
        health: state.coordinator.health().await,
        sensors: snapshot.len(),
        fetched_at: snapshot.fetched_at(),
    })
}

async fn handle_post_refresh<T: Transport>(State(state): State<AppState<T>>) -> impl IntoResponse {
    match state.coordinator.refresh().await {
        Ok(snapshot) => Json(snapshot.as_ref().clone()).into_response(),
        Err(RefreshError::ShutDown) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Bridge is shutting down")
        }
        Err(err) => {
            warn!("manual refresh failed: {err}");
            error_response(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
