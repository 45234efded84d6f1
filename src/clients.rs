//! Client registry
//!
//! Tracks connected client sessions, their channel subscriptions and the
//! bounded outbound queue each session drains. The registry owns the only
//! sender for every queue, so dropping an entry is what closes the queue and
//! wakes the consumer with `None`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::GatewayError;
use crate::models::{ClientData, VideoFrame};

pub const DEFAULT_CLIENT_QUEUE_SIZE: usize = 100;

/// Frames are shared between every subscriber; only the `Arc` is cloned.
pub type OutboundFrame = Arc<VideoFrame>;
pub type OutboundReceiver = mpsc::Receiver<OutboundFrame>;

/// Point-in-time view of a session. Not a live handle.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSession {
    pub client_id: String,
    pub connection_id: String,
    pub source_addr: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub channels: Vec<String>,
    pub client_data: ClientData,
    pub frames_delivered: u64,
    pub bytes_delivered: u64,
    pub frames_dropped: u64,
}

struct ClientEntry {
    client_id: String,
    connection_id: String,
    source_addr: String,
    user_agent: String,
    connected_at: DateTime<Utc>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    is_active: bool,
    channels: BTreeSet<String>,
    client_data: ClientData,
    outbound: mpsc::Sender<OutboundFrame>,
    frames_delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

impl ClientEntry {
    fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_at = Utc::now();
    }

    fn snapshot(&self) -> ClientSession {
        ClientSession {
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
            source_addr: self.source_addr.clone(),
            user_agent: self.user_agent.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen_at,
            is_active: self.is_active,
            channels: self.channels.iter().cloned().collect(),
            client_data: self.client_data.clone(),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Result of a non-blocking hand-off into a session's outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue full; the frame was dropped for this subscriber only
    Dropped,
    /// Session gone or its consumer went away
    Closed,
}

pub struct ClientRegistry {
    sessions: DashMap<String, ClientEntry>,
    queue_size: usize,
}

impl ClientRegistry {
    pub fn new(queue_size: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_size: queue_size.max(1),
        }
    }

    /// Register a new connection for `client_id`.
    ///
    /// Every call allocates a fresh connection id, even for a client identity
    /// that is already connected.
    pub fn register(
        &self,
        client_id: &str,
        source_addr: &str,
        user_agent: &str,
    ) -> (ClientSession, OutboundReceiver) {
        let connection_id = format!("{}-{}", client_id, uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(self.queue_size);
        let now = Utc::now();

        let entry = ClientEntry {
            client_id: client_id.to_string(),
            connection_id: connection_id.clone(),
            source_addr: source_addr.to_string(),
            user_agent: user_agent.to_string(),
            connected_at: now,
            last_seen: Instant::now(),
            last_seen_at: now,
            is_active: true,
            channels: BTreeSet::new(),
            client_data: ClientData {
                session_id: connection_id.clone(),
                ..Default::default()
            },
            outbound: tx,
            frames_delivered: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        };
        let session = entry.snapshot();
        self.sessions.insert(connection_id.clone(), entry);

        tracing::info!(
            client = %client_id,
            connection = %connection_id,
            addr = %source_addr,
            "Client registered"
        );
        (session, rx)
    }

    pub fn subscribe(&self, connection_id: &str, channel: &str) -> Result<(), GatewayError> {
        let mut entry = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| GatewayError::ClientNotFound(connection_id.to_string()))?;
        entry.channels.insert(channel.to_string());
        entry.touch();
        tracing::info!(client = %entry.client_id, channel = %channel, "Client subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: &str, channel: &str) -> Result<(), GatewayError> {
        let mut entry = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| GatewayError::ClientNotFound(connection_id.to_string()))?;
        entry.channels.remove(channel);
        entry.touch();
        tracing::info!(client = %entry.client_id, channel = %channel, "Client unsubscribed");
        Ok(())
    }

    /// Refresh last-seen for an inbound message on this connection.
    pub fn touch(&self, connection_id: &str) -> Result<(), GatewayError> {
        let mut entry = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| GatewayError::ClientNotFound(connection_id.to_string()))?;
        entry.touch();
        Ok(())
    }

    pub fn update_client_data(
        &self,
        connection_id: &str,
        data: ClientData,
    ) -> Result<(), GatewayError> {
        let mut entry = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| GatewayError::ClientNotFound(connection_id.to_string()))?;
        entry.client_data = data;
        entry.touch();
        Ok(())
    }

    pub fn lookup_by_connection(&self, connection_id: &str) -> Option<ClientSession> {
        self.sessions.get(connection_id).map(|e| e.snapshot())
    }

    /// First session found for a client identity. Identities may hold several
    /// connections; which one wins is unspecified.
    pub fn lookup_by_identity(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions
            .iter()
            .find(|e| e.client_id == client_id)
            .map(|e| e.snapshot())
    }

    pub fn subscribers_of(&self, channel: &str) -> Vec<ClientSession> {
        self.sessions
            .iter()
            .filter(|e| e.channels.contains(channel))
            .map(|e| e.snapshot())
            .collect()
    }

    pub fn all_clients(&self) -> Vec<ClientSession> {
        self.sessions.iter().map(|e| e.snapshot()).collect()
    }

    /// Try to enqueue a frame for one connection without waiting.
    pub fn deliver(&self, connection_id: &str, frame: OutboundFrame) -> Delivery {
        let len = frame.payload_len();
        let outcome = match self.sessions.get(connection_id) {
            None => return Delivery::Closed,
            Some(entry) => match entry.outbound.try_send(frame) {
                Ok(()) => {
                    entry.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    entry.bytes_delivered.fetch_add(len, Ordering::Relaxed);
                    Delivery::Delivered
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        connection = %connection_id,
                        "Client queue full, dropping frame"
                    );
                    Delivery::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
            },
        };

        // The consumer dropped its receiver; the session is dead.
        if outcome == Delivery::Closed {
            self.remove(connection_id);
        }
        outcome
    }

    /// Remove a session and close its queue. No-op when already gone.
    pub fn remove(&self, connection_id: &str) -> Option<ClientSession> {
        let (_, entry) = self.sessions.remove(connection_id)?;
        tracing::info!(
            client = %entry.client_id,
            connection = %connection_id,
            "Client removed"
        );
        Some(entry.snapshot())
    }

    /// Remove every session idle for longer than `timeout`. Returns how many went.
    pub fn prune_idle(&self, timeout: Duration) -> usize {
        let mut removed = 0;
        self.sessions.retain(|connection_id, entry| {
            let idle = entry.last_seen.elapsed() > timeout;
            if idle {
                removed += 1;
                tracing::info!(
                    client = %entry.client_id,
                    connection = %connection_id,
                    "Inactive client cleaned up"
                );
            }
            !idle
        });
        removed
    }

    /// Close every queue; used on shutdown.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                tracing::info!(client = %entry.client_id, "Client disconnected on shutdown");
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.is_active).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_QUEUE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: usize) -> OutboundFrame {
        Arc::new(VideoFrame::new("f", "producer", "cam1", vec![0u8; bytes]))
    }

    #[tokio::test]
    async fn register_allocates_unique_connections() {
        let registry = ClientRegistry::default();
        let (a, _rx_a) = registry.register("c1", "10.0.0.1", "ua");
        let (b, _rx_b) = registry.register("c1", "10.0.0.1", "ua");

        assert_ne!(a.connection_id, b.connection_id);
        assert_eq!(registry.active_count(), 2);
        assert_eq!(a.client_data.session_id, a.connection_id);
        assert!(!a.client_data.authenticated);
        assert_eq!(
            registry.lookup_by_identity("c1").map(|s| s.client_id),
            Some("c1".to_string())
        );
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_unknown_is_not_found() {
        let registry = ClientRegistry::default();
        let (session, _rx) = registry.register("c1", "addr", "ua");

        registry.subscribe(&session.connection_id, "cam1").unwrap();
        registry.subscribe(&session.connection_id, "cam1").unwrap();
        assert_eq!(registry.subscribers_of("cam1").len(), 1);
        assert_eq!(
            registry.lookup_by_connection(&session.connection_id).unwrap().channels,
            vec!["cam1".to_string()]
        );

        registry.unsubscribe(&session.connection_id, "cam1").unwrap();
        registry.unsubscribe(&session.connection_id, "cam1").unwrap();
        assert!(registry.subscribers_of("cam1").is_empty());

        assert!(matches!(
            registry.subscribe("nope", "cam1"),
            Err(GatewayError::ClientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_closes_queue_and_never_resurrects() {
        let registry = ClientRegistry::default();
        let (session, mut rx) = registry.register("c1", "addr", "ua");
        registry.subscribe(&session.connection_id, "cam1").unwrap();

        assert_eq!(registry.deliver(&session.connection_id, frame(10)), Delivery::Delivered);
        assert!(registry.remove(&session.connection_id).is_some());
        assert!(registry.remove(&session.connection_id).is_none());

        // Buffered frame drains first, then the terminal signal.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        assert!(registry.lookup_by_connection(&session.connection_id).is_none());
        assert!(registry.subscribers_of("cam1").is_empty());
        assert_eq!(registry.deliver(&session.connection_id, frame(10)), Delivery::Closed);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_client_only() {
        let registry = ClientRegistry::new(2);
        let (slow, _slow_rx) = registry.register("slow", "addr", "ua");
        let (fast, mut fast_rx) = registry.register("fast", "addr", "ua");

        for _ in 0..2 {
            assert_eq!(registry.deliver(&slow.connection_id, frame(1)), Delivery::Delivered);
        }
        assert_eq!(registry.deliver(&slow.connection_id, frame(1)), Delivery::Dropped);
        assert_eq!(registry.deliver(&fast.connection_id, frame(1)), Delivery::Delivered);
        assert!(fast_rx.recv().await.is_some());

        let slow = registry.lookup_by_connection(&slow.connection_id).unwrap();
        assert_eq!(slow.frames_delivered, 2);
        assert_eq!(slow.frames_dropped, 1);
    }

    #[tokio::test]
    async fn closed_consumer_removes_session() {
        let registry = ClientRegistry::default();
        let (session, rx) = registry.register("c1", "addr", "ua");
        drop(rx);

        assert_eq!(registry.deliver(&session.connection_id, frame(1)), Delivery::Closed);
        assert!(registry.lookup_by_connection(&session.connection_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn prune_idle_removes_only_stale_sessions() {
        let registry = ClientRegistry::default();
        let (stale, mut stale_rx) = registry.register("stale", "addr", "ua");
        tokio::time::advance(Duration::from_secs(20)).await;
        let (fresh, _fresh_rx) = registry.register("fresh", "addr", "ua");
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(registry.prune_idle(Duration::from_secs(30)), 1);
        assert!(registry.lookup_by_connection(&stale.connection_id).is_none());
        assert!(registry.lookup_by_connection(&fresh.connection_id).is_some());
        assert!(stale_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_keeps_session_alive() {
        let registry = ClientRegistry::default();
        let (session, _rx) = registry.register("c1", "addr", "ua");
        tokio::time::advance(Duration::from_secs(25)).await;
        registry.touch(&session.connection_id).unwrap();
        tokio::time::advance(Duration::from_secs(25)).await;

        assert_eq!(registry.prune_idle(Duration::from_secs(30)), 0);
    }

    #[tokio::test]
    async fn update_client_data_replaces_profile() {
        let registry = ClientRegistry::default();
        let (session, _rx) = registry.register("c1", "addr", "ua");
        let data = ClientData {
            user_id: "u1".into(),
            authenticated: true,
            roles: vec!["viewer".into()],
            ..Default::default()
        };
        registry
            .update_client_data(&session.connection_id, data.clone())
            .unwrap();
        assert_eq!(
            registry.lookup_by_connection(&session.connection_id).unwrap().client_data,
            data
        );
        assert!(registry.update_client_data("missing", data).is_err());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = ClientRegistry::default();
        let (_a, mut rx_a) = registry.register("a", "addr", "ua");
        let (_b, mut rx_b) = registry.register("b", "addr", "ua");
        registry.close_all();

        assert!(registry.is_empty());
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
    }
}
