use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::error::GatewayError;
use crate::health::HealthMonitor;
use crate::identity::IdentityResolver;
use crate::models::*;
use crate::router::{FrameRouter, GatewayStats, RouterHandle};
use crate::services::ServiceRegistry;
use crate::streams::StreamRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const SERVICE_NAME: &str = "frame-gateway";

/// Top-level application state shared across all handlers
pub struct AppState {
    pub config: Config,
    pub clients: Arc<ClientRegistry>,
    pub streams: Arc<StreamRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub stats: Arc<GatewayStats>,
    pub identity: Arc<IdentityResolver>,
    pub router: RouterHandle,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

impl AppState {
    /// Build the registries and start the router and health monitor.
    pub fn start(config: Config, identity: IdentityResolver) -> Arc<Self> {
        let clients = Arc::new(ClientRegistry::new(config.gateway.client_queue_size));
        let streams = Arc::new(StreamRegistry::new());
        let services = Arc::new(ServiceRegistry::new(&config.services, &config.gateway));
        let stats = Arc::new(GatewayStats::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let (router, handle) = FrameRouter::new(
            clients.clone(),
            streams.clone(),
            services.clone(),
            stats.clone(),
            &config.gateway,
        );
        router.spawn(cancel.clone(), &tracker);
        HealthMonitor::new(clients.clone(), services.clone(), &config.gateway)
            .spawn(cancel.clone(), &tracker);

        Arc::new(Self {
            config,
            clients,
            streams,
            services,
            stats,
            identity: Arc::new(identity),
            router: handle,
            cancel,
            tracker,
        })
    }

    /// Validate a producer frame and queue it for routing.
    ///
    /// `peer` fills in a missing client id.
    pub fn submit_frame(
        &self,
        mut frame: VideoFrame,
        peer: &str,
    ) -> Result<FrameAccepted, GatewayError> {
        if frame.frame_id.is_empty() {
            return Err(GatewayError::MalformedInput("frame_id is required".into()));
        }
        if frame.camera_id.is_empty() {
            return Err(GatewayError::MalformedInput("camera_id is required".into()));
        }
        let max = self.config.server.max_frame_size as u64;
        if frame.payload_len() > max {
            return Err(GatewayError::FrameTooLarge {
                size: frame.payload_len(),
                max,
            });
        }
        if frame.client_id.is_empty() {
            frame.client_id = peer.to_string();
        }
        if frame.timestamp == 0 {
            frame.timestamp = chrono::Utc::now().timestamp_millis();
        }

        let frame_id = frame.frame_id.clone();
        let stream_id = self.streams.stream_id_for(&frame);
        self.router.submit(frame)?;

        Ok(FrameAccepted {
            status: "success".to_string(),
            message: "Frame received for processing".to_string(),
            frame_id,
            stream_id,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    /// Start a stream for a client. Refuses when the identity lookup fails.
    pub async fn start_stream(
        &self,
        req: StartStreamRequest,
    ) -> Result<StartStreamResponse, GatewayError> {
        if req.client_id.is_empty() {
            return Err(GatewayError::MalformedInput("client_id is required".into()));
        }

        let resolved = self.identity.resolve(&req.client_id).await.map_err(|e| {
            tracing::warn!(client = %req.client_id, error = %e, "Stream start refused");
            GatewayError::from(e)
        })?;

        let stream_id = StreamRegistry::next_stream_id(&req.client_id);
        let camera = if req.camera_name.is_empty() {
            "default".to_string()
        } else {
            req.camera_name
        };

        let mut metadata = resolved.metadata();
        if let Some(filename) = req.filename {
            metadata.insert("filename".to_string(), filename);
        }

        self.streams.start_stream_with_metadata(
            &stream_id,
            &req.client_id,
            &resolved.profile.username,
            &camera,
            metadata.clone(),
        );

        Ok(StartStreamResponse {
            stream_id,
            status: "started".to_string(),
            message: format!("Stream started for {}", resolved.profile.username),
            metadata,
        })
    }

    /// Stop a stream and drop the owner's cached streaming target.
    /// Stopping an unknown stream succeeds.
    pub fn stop_stream(&self, req: StopStreamRequest) -> Result<ApiResponse, GatewayError> {
        if req.stream_id.is_empty() {
            return Err(GatewayError::MalformedInput("stream_id is required".into()));
        }

        let stopped = self.streams.stop_stream(&req.stream_id);
        let owner = stopped
            .as_ref()
            .map(|s| s.client_id.clone())
            .unwrap_or(req.client_id);
        if !owner.is_empty() {
            self.identity.evict(&owner);
        }

        let message = match stopped {
            Some(_) => "Stream stopped",
            None => "Stream was not active",
        };
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("stream_id".to_string(), req.stream_id);
        if let Some(filename) = req.filename {
            metadata.insert("filename".to_string(), filename);
        }
        if let Some(size) = req.file_size {
            metadata.insert("file_size".to_string(), size.to_string());
        }
        let end_time = req
            .end_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        metadata.insert("end_time".to_string(), end_time.to_string());

        Ok(ApiResponse::ok(message).with_metadata(metadata))
    }

    pub async fn gateway_stats(&self) -> GatewayStatsResponse {
        let snap = self.stats.snapshot();
        GatewayStatsResponse {
            uptime_seconds: snap.uptime.as_secs_f64(),
            total_requests: snap.total_requests,
            total_frames: snap.total_frames,
            active_clients: self.clients.active_count(),
            bytes_processed: snap.bytes_processed,
            error_count: snap.error_count,
            frame_rate: snap.frame_rate,
            queue_size: self.router.queue_len(),
            active_streams: self.streams.len(),
            services_health: self.services.stats_snapshot().await,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// `degraded` once the inbound queue passes 90% of capacity
    pub async fn health(&self) -> HealthResponse {
        let queue_size = self.router.queue_len();
        let queue_capacity = self.router.capacity();
        let degraded = queue_is_degraded(queue_size, queue_capacity);

        HealthResponse {
            status: if degraded { "degraded" } else { "healthy" }.to_string(),
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.stats.uptime().as_secs(),
            queue_size,
            queue_capacity,
            warning: degraded.then(|| "frame queue is almost full".to_string()),
            services: self.services.stats_snapshot().await,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Stop background work, close every client queue and wait for in-flight
    /// dispatches, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        self.clients.close_all();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                pending = self.tracker.len(),
                "Shutdown timed out with tasks still running"
            );
        }
    }
}

fn queue_is_degraded(len: usize, capacity: usize) -> bool {
    len * 10 > capacity * 9
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityError, IdentityProvider, StaticIdentity, StreamingTarget, UserProfile};
    use async_trait::async_trait;

    fn state() -> Arc<AppState> {
        let config = Config::default();
        let identity = IdentityResolver::new(Arc::new(StaticIdentity), &config.identity);
        AppState::start(config, identity)
    }

    struct Down;

    #[async_trait]
    impl IdentityProvider for Down {
        async fn user_by_client(&self, _client_id: &str) -> Result<UserProfile, IdentityError> {
            Err(IdentityError::Unavailable("refused".into()))
        }

        async fn streaming_target(&self, _user_id: &str) -> Result<StreamingTarget, IdentityError> {
            Err(IdentityError::Unavailable("refused".into()))
        }
    }

    #[tokio::test]
    async fn frames_without_required_fields_are_rejected() {
        let state = state();
        let frame = VideoFrame::new("", "c1", "cam1", vec![1]);
        assert!(matches!(
            state.submit_frame(frame, "1.2.3.4"),
            Err(GatewayError::MalformedInput(_))
        ));

        let frame = VideoFrame::new("f1", "c1", "", vec![1]);
        assert!(matches!(
            state.submit_frame(frame, "1.2.3.4"),
            Err(GatewayError::MalformedInput(_))
        ));
        assert_eq!(state.stats.snapshot().total_requests, 0);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let config = Config {
            server: crate::config::ServerConfig {
                max_frame_size: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let identity = IdentityResolver::new(Arc::new(StaticIdentity), &config.identity);
        let state = AppState::start(config, identity);

        let frame = VideoFrame::new("f1", "c1", "cam1", vec![0u8; 9]);
        assert!(matches!(
            state.submit_frame(frame, "peer"),
            Err(GatewayError::FrameTooLarge { size: 9, max: 8 })
        ));
    }

    #[tokio::test]
    async fn missing_client_id_is_taken_from_peer() {
        let state = state();
        let frame = VideoFrame::new("f1", "", "cam1", vec![1, 2]);
        let accepted = state.submit_frame(frame, "10.0.0.7").unwrap();
        assert_eq!(accepted.stream_id, "auto_10.0.0.7_cam1");
        assert_eq!(accepted.frame_id, "f1");
    }

    #[tokio::test]
    async fn start_stream_attaches_target_metadata() {
        let state = state();
        let resp = state
            .start_stream(StartStreamRequest {
                client_id: "c1".into(),
                user_id: String::new(),
                camera_name: "front".into(),
                filename: Some("rec.mp4".into()),
            })
            .await
            .unwrap();

        assert!(resp.stream_id.starts_with("stream_c1_"));
        assert_eq!(resp.metadata["user_id"], "user_c1");
        assert_eq!(resp.metadata["filename"], "rec.mp4");

        let stream = state.streams.get(&resp.stream_id).unwrap();
        assert_eq!(stream.display_name, "user_c1");
        assert_eq!(stream.camera_name, "front");
        assert!(state.identity.cached("c1").is_some());

        state
            .stop_stream(StopStreamRequest {
                stream_id: resp.stream_id.clone(),
                client_id: String::new(),
                filename: None,
                end_time: None,
                file_size: None,
            })
            .unwrap();
        assert!(state.streams.get(&resp.stream_id).is_none());
        assert!(state.identity.cached("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_stream_refuses_without_identity() {
        let config = Config::default();
        let identity = IdentityResolver::new(Arc::new(Down), &config.identity);
        let state = AppState::start(config, identity);

        let err = state
            .start_stream(StartStreamRequest {
                client_id: "c1".into(),
                user_id: String::new(),
                camera_name: String::new(),
                filename: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Identity(IdentityError::RetriesExhausted { .. })));
        assert!(state.streams.is_empty());
    }

    #[tokio::test]
    async fn stopping_unknown_stream_succeeds() {
        let state = state();
        let resp = state
            .stop_stream(StopStreamRequest {
                stream_id: "nope".into(),
                client_id: "c1".into(),
                filename: None,
                end_time: Some(42),
                file_size: None,
            })
            .unwrap();
        assert_eq!(resp.message, "Stream was not active");
        assert_eq!(resp.metadata["end_time"], "42");
    }

    #[test]
    fn queue_above_ninety_percent_is_degraded() {
        assert!(!queue_is_degraded(0, 1000));
        assert!(!queue_is_degraded(900, 1000));
        assert!(queue_is_degraded(901, 1000));
        assert!(queue_is_degraded(10, 10));
    }

    #[tokio::test]
    async fn health_is_healthy_with_idle_queue() {
        let state = state();
        let health = state.health().await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.queue_capacity, 1000);
        assert!(health.warning.is_none());
        assert_eq!(health.services.len(), 4);

        state.shutdown(Duration::from_secs(1)).await;
        assert!(state.cancel.is_cancelled());
    }
}
