//! Status/diagnostic REST endpoints, kept in the shape of the teacher's
//! `api/rest.rs`: a small `SharedAppState` plus a handful of `axum`
//! handlers, generalized from one hard-coded OPC-UA driver type to any
//! `Arc<dyn Driver>` the Ensemble is holding.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::drivers::opcua::OpcUaDriver;
use crate::drivers::Driver;
use crate::ensemble::Ensemble;

#[derive(Clone)]
pub struct SharedAppState {
    pub ensemble: Arc<Ensemble>,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    plc_count: usize,
    tag_count: usize,
}

#[derive(Serialize)]
struct PlcInfo {
    key: String,
    connected: bool,
}

#[derive(Serialize)]
struct TagInfo {
    key: String,
    value: Option<String>,
}

#[derive(Serialize)]
struct BrowseResponse {
    plc: String,
    lines: Vec<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn status(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(StatusResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        plc_count: state.ensemble.plc_keys().len(),
        tag_count: state.ensemble.store.len(),
    })
}

async fn list_plcs(State(state): State<SharedAppState>) -> impl IntoResponse {
    let plcs: Vec<PlcInfo> = state
        .ensemble
        .plc_keys()
        .into_iter()
        .filter_map(|key| {
            state.ensemble.get_plc(&key).map(|driver| PlcInfo {
                key,
                connected: driver.is_connected(),
            })
        })
        .collect();
    Json(plcs)
}

async fn list_tags(State(state): State<SharedAppState>) -> impl IntoResponse {
    let tags: Vec<TagInfo> = state
        .ensemble
        .store
        .keys()
        .into_iter()
        .filter_map(|key| {
            state.ensemble.store.get(&key).map(|entry| TagInfo {
                value: entry.value.read().render(),
                key,
            })
        })
        .collect();
    Json(tags)
}

async fn browse_opcua(State(state): State<SharedAppState>, Path(plc_key): Path<String>) -> impl IntoResponse {
    let Some(driver) = state.ensemble.get_plc(&plc_key) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse { error: format!("unknown PLC '{plc_key}'") }),
        )
            .into_response();
    };
    let Some(opcua) = driver.as_any().downcast_ref::<OpcUaDriver>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse { error: format!("'{plc_key}' is not an OPC-UA driver") }),
        )
            .into_response();
    };
    match opcua.browse_tree().await {
        Ok(lines) => Json(BrowseResponse { plc: plc_key, lines }).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

pub fn router(state: SharedAppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/plcs", get(list_plcs))
        .route("/api/tags", get(list_tags))
        .route("/api/opcua/browse/:plc_key", get(browse_opcua))
        .with_state(state)
}
