use crate::config::SUBSCRIBER_KEEPALIVE;
use crate::error::GatewayError;
use crate::models::VideoFrame;
use crate::router::ControlMessage;
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub client_id: Option<String>,
}

/// One NDJSON line of the subscriber stream
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent<'a> {
    Connected {
        connection_id: &'a str,
        channel: &'a str,
    },
    Frame(&'a VideoFrame),
    Keepalive {
        timestamp: i64,
    },
}

impl StreamEvent<'_> {
    fn to_line(&self) -> Bytes {
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.push(b'\n');
        Bytes::from(line)
    }
}

/// Removes the session when the response body is dropped, whichever way the
/// connection ended.
struct SessionGuard {
    state: Arc<AppState>,
    connection_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.state.clients.remove(&self.connection_id) {
            tracing::info!(
                connection = %self.connection_id,
                delivered = session.frames_delivered,
                dropped = session.frames_dropped,
                "Subscriber stream closed"
            );
        }
    }
}

pub async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(params): Query<StreamParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let client_id = params.client_id.unwrap_or_else(|| addr.ip().to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (session, mut rx) = state
        .router
        .connect(&client_id, &addr.to_string(), user_agent)
        .await?;
    let connection_id = session.connection_id;

    let guard = SessionGuard {
        state: state.clone(),
        connection_id: connection_id.clone(),
    };
    state.router.send_control(ControlMessage::Subscribe {
        connection_id: connection_id.clone(),
        channel: channel.clone(),
    })?;

    tracing::info!(
        channel = %channel,
        connection = %connection_id,
        addr = %addr,
        "Subscriber connected"
    );

    let body_stream = async_stream::stream! {
        let guard = guard;
        let start = tokio::time::Instant::now() + SUBSCRIBER_KEEPALIVE;
        let mut keepalive = tokio::time::interval_at(start, SUBSCRIBER_KEEPALIVE);

        yield Ok::<_, std::io::Error>(StreamEvent::Connected {
            connection_id: &guard.connection_id,
            channel: &channel,
        }.to_line());

        loop {
            tokio::select! {
                next = rx.recv() => {
                    match next {
                        Some(frame) => {
                            yield Ok::<_, std::io::Error>(StreamEvent::Frame(&frame).to_line());
                        }
                        None => {
                            tracing::info!(connection = %guard.connection_id, "Session queue closed");
                            break;
                        }
                    }
                }
                _ = keepalive.tick() => {
                    // Writing to the socket counts as activity.
                    if let Err(e) = guard.state.router.send_control(ControlMessage::Touch {
                        connection_id: guard.connection_id.clone(),
                    }) {
                        tracing::debug!(connection = %guard.connection_id, error = %e, "Keepalive touch not queued");
                    }
                    yield Ok::<_, std::io::Error>(StreamEvent::Keepalive {
                        timestamp: chrono::Utc::now().timestamp(),
                    }.to_line());
                }
            }
        }
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response())
}
