//! Frame gateway
//!
//! Accepts video frames from producers, fans them out to downstream
//! processing services and pushes them to subscribed viewers.

pub mod clients;
pub mod config;
pub mod control;
pub mod error;
pub mod health;
pub mod identity;
pub mod models;
pub mod router;
pub mod services;
pub mod state;
pub mod status;
pub mod stream;
pub mod streams;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub use config::Config;
pub use error::GatewayError;
pub use state::AppState;

/// Build the HTTP surface over a started gateway.
pub fn build_router(state: Arc<AppState>) -> Router {
    // base64 inflates payloads by a third
    let body_limit = state.config.server.max_frame_size / 3 * 4 + 64 * 1024;

    let api = Router::new()
        // Video
        .route("/video/frame", post(control::submit_frame))
        .route("/video/start", post(control::start_stream))
        .route("/video/stop", post(control::stop_stream))
        .route("/video/active", get(status::active_streams))
        .route("/video/stats/{client_id}", get(status::client_stats))
        .route("/video/stream/{stream_id}", get(status::stream_detail))
        .route("/video/stream/{stream_id}/stats", get(status::stream_stats))
        .route("/video/client/{client_id}/streams", get(status::client_streams))
        .route("/video/all-stats", get(status::all_stats))
        // Clients
        .route("/clients", get(status::clients))
        .route("/clients/{connection_id}", delete(control::disconnect))
        .route("/clients/{connection_id}/subscribe", post(control::subscribe))
        .route(
            "/clients/{connection_id}/unsubscribe",
            post(control::unsubscribe),
        )
        // Gateway
        .route("/stats", get(status::gateway_stats))
        .route("/health", get(status::health));

    Router::new()
        .nest("/api/v1", api)
        .route("/stream/{channel}", get(stream::stream_channel))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
