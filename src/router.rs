//! Frame router
//!
//! A single consumption loop owns the inbound frame queue and the control
//! queue. For every frame it updates stream statistics, fans the frame out to
//! the downstream endpoints chosen by the service registry, and offers it to
//! every subscribed client without ever waiting on one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clients::{ClientRegistry, ClientSession, Delivery, OutboundReceiver};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{ClientData, VideoFrame};
use crate::services::ServiceRegistry;
use crate::streams::StreamRegistry;

/// Gateway-wide counters, updated lock-free from handlers and the router loop
pub struct GatewayStats {
    started: Instant,
    total_requests: AtomicU64,
    total_frames: AtomicU64,
    bytes_processed: AtomicU64,
    error_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub total_requests: u64,
    pub total_frames: u64,
    pub bytes_processed: u64,
    pub error_count: u64,
    pub frame_rate: f64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self, bytes: u64) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let uptime = self.uptime();
        let total_frames = self.total_frames.load(Ordering::Relaxed);
        let frame_rate = if uptime.as_secs_f64() > 0.0 {
            total_frames as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        StatsSnapshot {
            uptime,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_frames,
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            frame_rate,
        }
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Session and endpoint changes routed through the control queue
#[derive(Debug)]
pub enum ControlMessage {
    Connect {
        client_id: String,
        source_addr: String,
        user_agent: String,
        reply: oneshot::Sender<(ClientSession, OutboundReceiver)>,
    },
    Disconnect {
        connection_id: String,
    },
    Subscribe {
        connection_id: String,
        channel: String,
    },
    Unsubscribe {
        connection_id: String,
        channel: String,
    },
    Touch {
        connection_id: String,
    },
    UpdateClientData {
        connection_id: String,
        data: ClientData,
    },
    ServiceHealth {
        endpoint_id: String,
        healthy: bool,
    },
}

impl ControlMessage {
    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Connect { .. } => "connect",
            ControlMessage::Disconnect { .. } => "disconnect",
            ControlMessage::Subscribe { .. } => "subscribe",
            ControlMessage::Unsubscribe { .. } => "unsubscribe",
            ControlMessage::Touch { .. } => "touch",
            ControlMessage::UpdateClientData { .. } => "update_client_data",
            ControlMessage::ServiceHealth { .. } => "service_health",
        }
    }
}

/// Producer side of the router queues
#[derive(Clone)]
pub struct RouterHandle {
    frames: mpsc::Sender<VideoFrame>,
    control: mpsc::Sender<ControlMessage>,
    stats: Arc<GatewayStats>,
}

impl RouterHandle {
    /// Queue a frame for routing without waiting. A full queue rejects the
    /// frame and counts an error; nothing else is affected.
    pub fn submit(&self, frame: VideoFrame) -> Result<(), GatewayError> {
        self.stats.record_request();
        match self.frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.stats.record_error();
                tracing::warn!(
                    frame = %frame.frame_id,
                    client = %frame.client_id,
                    "Frame queue full, rejecting frame"
                );
                Err(GatewayError::QueueFull("frame"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(GatewayError::ShuttingDown),
        }
    }

    pub fn send_control(&self, message: ControlMessage) -> Result<(), GatewayError> {
        self.control.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::QueueFull("control"),
            mpsc::error::TrySendError::Closed(_) => GatewayError::ShuttingDown,
        })
    }

    /// Register a connection through the router and wait for its session.
    pub async fn connect(
        &self,
        client_id: &str,
        source_addr: &str,
        user_agent: &str,
    ) -> Result<(ClientSession, OutboundReceiver), GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send_control(ControlMessage::Connect {
            client_id: client_id.to_string(),
            source_addr: source_addr.to_string(),
            user_agent: user_agent.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| GatewayError::ShuttingDown)
    }

    /// Frames waiting in the inbound queue
    pub fn queue_len(&self) -> usize {
        self.frames.max_capacity() - self.frames.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.frames.max_capacity()
    }
}

pub struct FrameRouter {
    core: RouterCore,
    frames: mpsc::Receiver<VideoFrame>,
    control: mpsc::Receiver<ControlMessage>,
}

/// Registries the loop works against
struct RouterCore {
    clients: Arc<ClientRegistry>,
    streams: Arc<StreamRegistry>,
    services: Arc<ServiceRegistry>,
    stats: Arc<GatewayStats>,
}

impl FrameRouter {
    pub fn new(
        clients: Arc<ClientRegistry>,
        streams: Arc<StreamRegistry>,
        services: Arc<ServiceRegistry>,
        stats: Arc<GatewayStats>,
        config: &GatewayConfig,
    ) -> (Self, RouterHandle) {
        let (frame_tx, frame_rx) = mpsc::channel(config.buffer_size.max(1));
        let (control_tx, control_rx) = mpsc::channel(config.control_buffer_size.max(1));

        let handle = RouterHandle {
            frames: frame_tx,
            control: control_tx,
            stats: stats.clone(),
        };
        let router = Self {
            core: RouterCore {
                clients,
                streams,
                services,
                stats,
            },
            frames: frame_rx,
            control: control_rx,
        };
        (router, handle)
    }

    /// Start the consumption loop. Dispatch work goes onto `tracker` so
    /// shutdown can wait for in-flight calls.
    pub fn spawn(self, cancel: CancellationToken, tracker: &TaskTracker) {
        let task_tracker = tracker.clone();
        tracker.spawn(self.run(cancel, task_tracker));
    }

    async fn run(self, cancel: CancellationToken, tracker: TaskTracker) {
        let FrameRouter {
            core,
            mut frames,
            mut control,
        } = self;
        tracing::info!("Frame router started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break;
                }

                Some(message) = control.recv() => {
                    core.handle_control(message).await;
                }

                Some(frame) = frames.recv() => {
                    core.route_frame(frame, &tracker).await;
                }

                else => break,
            }
        }

        tracing::info!("Frame router stopped");
    }
}

impl RouterCore {
    async fn route_frame(&self, frame: VideoFrame, tracker: &TaskTracker) {
        let frame = Arc::new(frame);
        self.stats.record_frame(frame.payload_len());

        let stream_id = self.streams.stream_id_for(&frame);
        self.streams
            .auto_create(&stream_id, &frame.client_id, &frame.camera_id);
        self.streams.record_frame(&stream_id, &frame);

        for endpoint in self.services.endpoints_for_frame(&frame).await {
            let services = self.services.clone();
            let frame = frame.clone();
            tracker.spawn(async move {
                // Failures count against the endpoint, not the gateway.
                if let Err(e) = services.dispatch(&endpoint, &frame).await {
                    tracing::debug!(frame = %frame.frame_id, error = %e, "Dispatch failed");
                }
            });
        }

        for subscriber in self.clients.subscribers_of(&frame.camera_id) {
            if self.clients.deliver(&subscriber.connection_id, frame.clone()) == Delivery::Closed {
                tracing::debug!(
                    connection = %subscriber.connection_id,
                    "Subscriber gone, session removed"
                );
            }
        }
    }

    async fn handle_control(&self, message: ControlMessage) {
        let kind = message.kind();
        let result = match message {
            ControlMessage::Connect {
                client_id,
                source_addr,
                user_agent,
                reply,
            } => {
                let (session, rx) = self.clients.register(&client_id, &source_addr, &user_agent);
                if let Err((session, _)) = reply.send((session, rx)) {
                    // Caller gave up before the reply; drop the session again.
                    self.clients.remove(&session.connection_id);
                }
                Ok(())
            }
            ControlMessage::Disconnect { connection_id } => {
                self.clients.remove(&connection_id);
                Ok(())
            }
            ControlMessage::Subscribe {
                connection_id,
                channel,
            } => self.clients.subscribe(&connection_id, &channel),
            ControlMessage::Unsubscribe {
                connection_id,
                channel,
            } => self.clients.unsubscribe(&connection_id, &channel),
            ControlMessage::Touch { connection_id } => self.clients.touch(&connection_id),
            ControlMessage::UpdateClientData {
                connection_id,
                data,
            } => self.clients.update_client_data(&connection_id, data),
            ControlMessage::ServiceHealth {
                endpoint_id,
                healthy,
            } => self.services.report_health(&endpoint_id, healthy).await,
        };

        if let Err(e) = result {
            tracing::warn!(kind, error = %e, "Control message failed");
        }
    }
}
