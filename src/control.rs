use crate::error::GatewayError;
use crate::models::*;
use crate::router::ControlMessage;
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Path, State},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn submit_frame(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(frame): Json<VideoFrame>,
) -> Result<Json<FrameAccepted>, GatewayError> {
    let accepted = state.submit_frame(frame, &addr.ip().to_string())?;
    tracing::debug!(
        frame = %accepted.frame_id,
        stream = %accepted.stream_id,
        "Frame queued"
    );
    Ok(Json(accepted))
}

pub async fn start_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartStreamRequest>,
) -> Result<Json<StartStreamResponse>, GatewayError> {
    let client_id = req.client_id.clone();
    let resp = state.start_stream(req).await?;
    tracing::info!(client = %client_id, stream = %resp.stream_id, "Stream start accepted");
    Ok(Json(resp))
}

pub async fn stop_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopStreamRequest>,
) -> Result<Json<ApiResponse>, GatewayError> {
    Ok(Json(state.stop_stream(req)?))
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Json(req): Json<ChannelRequest>,
) -> Result<Json<ApiResponse>, GatewayError> {
    ensure_connected(&state, &connection_id)?;
    state.router.send_control(ControlMessage::Subscribe {
        connection_id,
        channel: req.channel.clone(),
    })?;
    Ok(Json(ApiResponse::ok(format!("Subscribed to {}", req.channel))))
}

pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
    Json(req): Json<ChannelRequest>,
) -> Result<Json<ApiResponse>, GatewayError> {
    ensure_connected(&state, &connection_id)?;
    state.router.send_control(ControlMessage::Unsubscribe {
        connection_id,
        channel: req.channel.clone(),
    })?;
    Ok(Json(ApiResponse::ok(format!("Unsubscribed from {}", req.channel))))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(connection_id): Path<String>,
) -> Result<Json<ApiResponse>, GatewayError> {
    ensure_connected(&state, &connection_id)?;
    state
        .router
        .send_control(ControlMessage::Disconnect { connection_id })?;
    Ok(Json(ApiResponse::ok("Client disconnected")))
}

fn ensure_connected(state: &AppState, connection_id: &str) -> Result<(), GatewayError> {
    state
        .clients
        .lookup_by_connection(connection_id)
        .map(|_| ())
        .ok_or_else(|| GatewayError::ClientNotFound(connection_id.to_string()))
}
