use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clients::ClientSession;
use crate::services::RoleReport;
use crate::streams::{ActiveStream, StreamStats};

// --- Frame models ---

/// Authentication/profile context a producer may attach to a frame or a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientData {
    pub user_id: String,
    pub session_id: String,
    pub device: String,
    pub location: String,
    pub authenticated: bool,
    pub roles: Vec<String>,
    pub metadata: HashMap<String, String>,
}

/// A single video frame as accepted from producers and forwarded downstream.
///
/// The payload is opaque; on the JSON wire it travels base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFrame {
    #[serde(default)]
    pub frame_id: String,
    #[serde(with = "base64_payload", default)]
    pub frame_data: Bytes,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub camera_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default)]
    pub width: i32,
    #[serde(default)]
    pub height: i32,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<ClientData>,
}

impl VideoFrame {
    /// Build a frame with the given payload and the rest defaulted.
    pub fn new(
        frame_id: impl Into<String>,
        client_id: impl Into<String>,
        camera_id: impl Into<String>,
        frame_data: impl Into<Bytes>,
    ) -> Self {
        Self {
            frame_id: frame_id.into(),
            frame_data: frame_data.into(),
            timestamp: chrono::Utc::now().timestamp(),
            camera_id: camera_id.into(),
            client_id: client_id.into(),
            stream_id: None,
            width: 0,
            height: 0,
            format: String::new(),
            metadata: HashMap::new(),
            client_data: None,
        }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn payload_len(&self) -> u64 {
        self.frame_data.len() as u64
    }

    /// True when the frame carries client context that was authenticated upstream.
    pub fn is_authenticated(&self) -> bool {
        self.client_data
            .as_ref()
            .map(|d| d.authenticated)
            .unwrap_or(false)
    }

    /// Explicit stream id, or the per-producer and camera fallback key.
    /// The registry decides the final id for fallback frames, see
    /// `StreamRegistry::stream_id_for`.
    pub fn stream_key(&self) -> String {
        match &self.stream_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("auto_{}_{}", self.client_id, self.camera_id),
        }
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// --- Stream control models ---

#[derive(Debug, Deserialize)]
pub struct StartStreamRequest {
    pub client_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub camera_name: String,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartStreamResponse {
    pub stream_id: String,
    pub status: String,
    pub message: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct StopStreamRequest {
    pub stream_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelRequest {
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub client_id: Option<String>,
}

/// Generic status envelope used by the control API.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Serialize)]
pub struct FrameAccepted {
    pub status: String,
    pub message: String,
    pub frame_id: String,
    pub stream_id: String,
    pub timestamp: i64,
}

// --- Status API models ---

#[derive(Debug, Serialize)]
pub struct ClientsResponse {
    pub status: String,
    pub count: usize,
    pub clients: Vec<ClientSession>,
}

#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    pub count: usize,
    pub streams: Vec<ActiveStream>,
}

#[derive(Debug, Serialize)]
pub struct StreamStatsResponse {
    pub count: usize,
    pub stats: Vec<StreamStats>,
}

#[derive(Debug, Serialize)]
pub struct GatewayStatsResponse {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub total_frames: u64,
    pub active_clients: usize,
    pub bytes_processed: u64,
    pub error_count: u64,
    pub frame_rate: f64,
    pub queue_size: usize,
    pub active_streams: usize,
    pub services_health: HashMap<String, RoleReport>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub services: HashMap<String, RoleReport>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: String,
    pub error: String,
}
