use crate::error::GatewayError;
use crate::models::*;
use crate::state::AppState;
use crate::streams::{ActiveStream, StreamStats, TotalStats};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

pub async fn active_streams(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Json<StreamsResponse> {
    let streams = match query.client_id {
        Some(client_id) => state.streams.streams_by_client(&client_id),
        None => state.streams.all_active_streams(),
    };
    Json(StreamsResponse {
        count: streams.len(),
        streams,
    })
}

pub async fn client_stats(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Json<StreamStatsResponse> {
    let stats = state.streams.stats_by_client(&client_id);
    Json(StreamStatsResponse {
        count: stats.len(),
        stats,
    })
}

pub async fn stream_detail(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<ActiveStream>, GatewayError> {
    state
        .streams
        .get(&stream_id)
        .map(Json)
        .ok_or(GatewayError::StreamNotFound(stream_id))
}

pub async fn stream_stats(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamStats>, GatewayError> {
    state
        .streams
        .stats(&stream_id)
        .map(Json)
        .ok_or(GatewayError::StreamNotFound(stream_id))
}

pub async fn client_streams(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Json<StreamsResponse> {
    let streams = state.streams.streams_by_client(&client_id);
    Json(StreamsResponse {
        count: streams.len(),
        streams,
    })
}

pub async fn all_stats(State(state): State<Arc<AppState>>) -> Json<TotalStats> {
    Json(state.streams.total_stats())
}

pub async fn clients(State(state): State<Arc<AppState>>) -> Json<ClientsResponse> {
    let clients = state.clients.all_clients();
    Json(ClientsResponse {
        status: "success".to_string(),
        count: clients.len(),
        clients,
    })
}

pub async fn gateway_stats(State(state): State<Arc<AppState>>) -> Json<GatewayStatsResponse> {
    Json(state.gateway_stats().await)
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(state.health().await)
}
