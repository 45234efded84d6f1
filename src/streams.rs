//! Stream registry
//!
//! One entry per stream id holding the stream descriptor and its statistics
//! row together, so start/stop/record never have to coordinate two maps.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::models::VideoFrame;

/// Display name given to streams created by their first frame
pub const AUTO_CREATED: &str = "auto_created";
const AUTO_PREFIX: &str = "auto_";

const DEFAULT_WIDTH: i32 = 1920;
const DEFAULT_HEIGHT: i32 = 1080;
const DEFAULT_CODEC: &str = "H.264";
const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct ActiveStream {
    pub stream_id: String,
    pub client_id: String,
    pub display_name: String,
    pub camera_name: String,
    pub is_recording: bool,
    pub is_streaming: bool,
    pub metadata: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub stream_id: String,
    pub client_id: String,
    pub start_time: DateTime<Utc>,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub average_fps: f64,
    pub current_fps: f64,
    pub width: i32,
    pub height: i32,
    pub codec: String,
    pub duration_secs: u64,
    pub is_recording: bool,
    pub is_streaming: bool,
}

/// Aggregate over every stream's statistics
#[derive(Debug, Clone, Serialize)]
pub struct TotalStats {
    pub active_streams: usize,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub average_fps: f64,
    pub timestamp: i64,
}

struct StreamEntry {
    stream: ActiveStream,
    stats: StreamStats,
    started: Instant,
    /// Arrival times inside the current-FPS window
    recent: VecDeque<Instant>,
}

impl StreamEntry {
    fn new(stream: ActiveStream) -> Self {
        let stats = StreamStats {
            stream_id: stream.stream_id.clone(),
            client_id: stream.client_id.clone(),
            start_time: Utc::now(),
            frames_received: 0,
            bytes_received: 0,
            average_fps: 0.0,
            current_fps: 0.0,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            codec: DEFAULT_CODEC.to_string(),
            duration_secs: 0,
            is_recording: stream.is_recording,
            is_streaming: stream.is_streaming,
        };
        Self {
            stream,
            stats,
            started: Instant::now(),
            recent: VecDeque::new(),
        }
    }

    fn record(&mut self, frame: &VideoFrame) -> StreamStats {
        let now = Instant::now();
        let stats = &mut self.stats;

        stats.frames_received += 1;
        stats.bytes_received += frame.payload_len();
        if frame.width > 0 {
            stats.width = frame.width;
        }
        if frame.height > 0 {
            stats.height = frame.height;
        }
        if !frame.format.is_empty() {
            stats.codec = frame.format.clone();
        }

        let elapsed = now.duration_since(self.started);
        stats.duration_secs = elapsed.as_secs();
        // Below one second the ratio is noise; leave the previous value.
        if elapsed >= Duration::from_secs(1) {
            stats.average_fps = stats.frames_received as f64 / elapsed.as_secs_f64();
        }

        self.recent.push_back(now);
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > FPS_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        stats.current_fps = self.recent.len() as f64 / FPS_WINDOW.as_secs_f64();

        stats.clone()
    }
}

pub struct StreamRegistry {
    streams: DashMap<String, StreamEntry>,
    /// Fallback key -> generation, bumped each time its stream is stopped
    generations: DashMap<String, u64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            generations: DashMap::new(),
        }
    }

    /// Stream a frame is counted against. Frames without an explicit id use
    /// the per-producer fallback key, suffixed `~<generation>` once a stream
    /// under that key has been stopped, so a stopped id never comes back.
    pub fn stream_id_for(&self, frame: &VideoFrame) -> String {
        let key = frame.stream_key();
        if frame.stream_id.as_deref().is_some_and(|id| !id.is_empty()) {
            return key;
        }
        match self.generations.get(&key) {
            Some(generation) => format!("{}~{}", key, *generation),
            None => key,
        }
    }

    /// Allocate a fresh, never-reused stream id for a client.
    pub fn next_stream_id(client_id: &str) -> String {
        format!("stream_{}_{}", client_id, uuid::Uuid::new_v4().simple())
    }

    pub fn start_stream(
        &self,
        stream_id: &str,
        client_id: &str,
        display_name: &str,
        camera_name: &str,
    ) -> ActiveStream {
        self.start_stream_with_metadata(
            stream_id,
            client_id,
            display_name,
            camera_name,
            HashMap::new(),
        )
    }

    /// Store a stream descriptor. An existing statistics row for the same id
    /// is kept, so an explicit start after an auto-create keeps its counters.
    pub fn start_stream_with_metadata(
        &self,
        stream_id: &str,
        client_id: &str,
        display_name: &str,
        camera_name: &str,
        metadata: HashMap<String, String>,
    ) -> ActiveStream {
        let stream = ActiveStream {
            stream_id: stream_id.to_string(),
            client_id: client_id.to_string(),
            display_name: display_name.to_string(),
            camera_name: camera_name.to_string(),
            is_recording: true,
            is_streaming: true,
            metadata,
            started_at: Utc::now(),
        };

        match self.streams.entry(stream_id.to_string()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().stream = stream.clone();
                tracing::info!(stream = %stream_id, client = %client_id, "Stream restarted, stats kept");
            }
            Entry::Vacant(slot) => {
                slot.insert(StreamEntry::new(stream.clone()));
                tracing::info!(stream = %stream_id, client = %client_id, "Stream started");
            }
        }
        stream
    }

    /// Create the stream for a frame's first arrival. Returns false when the
    /// stream already existed.
    pub fn auto_create(&self, stream_id: &str, client_id: &str, camera_name: &str) -> bool {
        match self.streams.entry(stream_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(StreamEntry::new(ActiveStream {
                    stream_id: stream_id.to_string(),
                    client_id: client_id.to_string(),
                    display_name: AUTO_CREATED.to_string(),
                    camera_name: camera_name.to_string(),
                    is_recording: true,
                    is_streaming: true,
                    metadata: HashMap::new(),
                    started_at: Utc::now(),
                }));
                tracing::info!(stream = %stream_id, client = %client_id, "Stream auto-created");
                true
            }
        }
    }

    /// Count a frame against its stream. `None` if the stream is unknown.
    pub fn record_frame(&self, stream_id: &str, frame: &VideoFrame) -> Option<StreamStats> {
        self.streams
            .get_mut(stream_id)
            .map(|mut entry| entry.record(frame))
    }

    /// Remove a stream and its statistics. Idempotent.
    pub fn stop_stream(&self, stream_id: &str) -> Option<ActiveStream> {
        let (_, entry) = self.streams.remove(stream_id)?;
        let (key, generation) = match stream_id.split_once('~') {
            Some((key, g)) => (key, g.parse::<u64>().unwrap_or(0)),
            None => (stream_id, 0),
        };
        if key.starts_with(AUTO_PREFIX) {
            let mut next = self.generations.entry(key.to_string()).or_insert(0);
            *next = (*next).max(generation + 1);
        }
        tracing::info!(
            stream = %stream_id,
            frames = entry.stats.frames_received,
            bytes = entry.stats.bytes_received,
            "Stream stopped"
        );
        Some(entry.stream)
    }

    pub fn get(&self, stream_id: &str) -> Option<ActiveStream> {
        self.streams.get(stream_id).map(|e| e.stream.clone())
    }

    pub fn stats(&self, stream_id: &str) -> Option<StreamStats> {
        self.streams.get(stream_id).map(|e| e.stats.clone())
    }

    pub fn all_streams(&self) -> Vec<ActiveStream> {
        self.streams.iter().map(|e| e.stream.clone()).collect()
    }

    /// Streams that are recording or streaming
    pub fn all_active_streams(&self) -> Vec<ActiveStream> {
        self.streams
            .iter()
            .filter(|e| e.stream.is_recording || e.stream.is_streaming)
            .map(|e| e.stream.clone())
            .collect()
    }

    pub fn streams_by_client(&self, client_id: &str) -> Vec<ActiveStream> {
        self.streams
            .iter()
            .filter(|e| e.stream.client_id == client_id)
            .map(|e| e.stream.clone())
            .collect()
    }

    pub fn all_stats(&self) -> Vec<StreamStats> {
        self.streams.iter().map(|e| e.stats.clone()).collect()
    }

    pub fn stats_by_client(&self, client_id: &str) -> Vec<StreamStats> {
        self.streams
            .iter()
            .filter(|e| e.stream.client_id == client_id)
            .map(|e| e.stats.clone())
            .collect()
    }

    pub fn total_stats(&self) -> TotalStats {
        let all = self.all_stats();
        let total_frames = all.iter().map(|s| s.frames_received).sum();
        let total_bytes = all.iter().map(|s| s.bytes_received).sum();
        let average_fps = if all.is_empty() {
            0.0
        } else {
            all.iter().map(|s| s.average_fps).sum::<f64>() / all.len() as f64
        };

        TotalStats {
            active_streams: all.len(),
            total_frames,
            total_bytes,
            average_fps,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: usize) -> VideoFrame {
        VideoFrame::new("f", "c1", "cam1", vec![7u8; bytes])
    }

    #[tokio::test]
    async fn start_then_get_round_trips() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");

        let stream = registry.get("s1").unwrap();
        assert_eq!(stream.stream_id, "s1");
        assert_eq!(stream.client_id, "c1");
        assert!(stream.is_recording);
        assert!(stream.is_streaming);

        let stats = registry.stats("s1").unwrap();
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.width, 1920);
        assert_eq!(stats.codec, "H.264");
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_counters_and_fps() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");

        let first = registry.record_frame("s1", &frame(1000)).unwrap();
        assert_eq!(first.frames_received, 1);
        assert_eq!(first.bytes_received, 1000);

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = registry.record_frame("s1", &frame(1000)).unwrap();
        assert_eq!(second.frames_received, 2);
        assert_eq!(second.bytes_received, 2000);
        assert!((second.average_fps - 2.0).abs() < 1e-9);
        assert_eq!(second.duration_secs, 1);

        registry.stop_stream("s1");
        assert!(registry.get("s1").is_none());
        assert!(registry.stats("s1").is_none());
    }

    #[tokio::test]
    async fn unknown_stream_records_nothing() {
        let registry = StreamRegistry::new();
        assert!(registry.record_frame("missing", &frame(10)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");
        assert!(registry.stop_stream("s1").is_some());
        assert!(registry.stop_stream("s1").is_none());
        assert!(registry.get("s1").is_none());
    }

    #[tokio::test]
    async fn auto_create_happens_once_and_explicit_start_keeps_stats() {
        let registry = StreamRegistry::new();
        assert!(registry.auto_create("s1", "c1", "cam1"));
        assert!(!registry.auto_create("s1", "c1", "cam1"));
        assert_eq!(registry.len(), 1);

        let stream = registry.get("s1").unwrap();
        assert_eq!(stream.display_name, AUTO_CREATED);
        assert_eq!(registry.stats("s1").unwrap().frames_received, 0);

        registry.record_frame("s1", &frame(10)).unwrap();
        registry.start_stream("s1", "c1", "Alice", "cam1");
        assert_eq!(registry.get("s1").unwrap().display_name, "Alice");
        assert_eq!(registry.stats("s1").unwrap().frames_received, 1);
    }

    #[tokio::test]
    async fn fallback_stream_id_is_not_reused_after_stop() {
        let registry = StreamRegistry::new();
        let first = registry.stream_id_for(&frame(1));
        assert_eq!(first, "auto_c1_cam1");
        registry.auto_create(&first, "c1", "cam1");
        registry.record_frame(&first, &frame(1)).unwrap();

        registry.stop_stream(&first).unwrap();
        let second = registry.stream_id_for(&frame(1));
        assert_eq!(second, "auto_c1_cam1~1");
        registry.auto_create(&second, "c1", "cam1");
        assert_eq!(registry.stats(&second).unwrap().frames_received, 0);
        assert!(registry.get(&first).is_none());

        registry.stop_stream(&second).unwrap();
        assert_eq!(registry.stream_id_for(&frame(1)), "auto_c1_cam1~2");

        // Explicit ids are the producer's to reuse.
        registry.start_stream("s1", "c1", "Alice", "cam1");
        registry.stop_stream("s1").unwrap();
        assert_eq!(registry.stream_id_for(&frame(1).with_stream("s1")), "s1");
    }

    #[tokio::test]
    async fn frame_dimensions_and_codec_override_defaults() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");
        let mut f = frame(4);
        f.width = 640;
        f.height = 0;
        f.format = "jpeg".into();

        let stats = registry.record_frame("s1", &f).unwrap();
        assert_eq!(stats.width, 640);
        assert_eq!(stats.height, 1080);
        assert_eq!(stats.codec, "jpeg");
    }

    #[tokio::test(start_paused = true)]
    async fn current_fps_uses_one_second_window() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");
        for _ in 0..5 {
            registry.record_frame("s1", &frame(1)).unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        assert_eq!(registry.stats("s1").unwrap().current_fps, 5.0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = registry.record_frame("s1", &frame(1)).unwrap();
        assert_eq!(stats.current_fps, 1.0);
    }

    #[tokio::test]
    async fn queries_filter_by_client() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");
        registry.start_stream("s2", "c1", "Alice", "cam2");
        registry.start_stream("s3", "c2", "Bob", "cam1");

        assert_eq!(registry.streams_by_client("c1").len(), 2);
        assert_eq!(registry.stats_by_client("c2").len(), 1);
        assert_eq!(registry.all_streams().len(), 3);
        assert_eq!(registry.all_active_streams().len(), 3);
        assert!(registry.streams_by_client("nobody").is_empty());
    }

    #[tokio::test]
    async fn total_stats_sums_counters() {
        let registry = StreamRegistry::new();
        registry.start_stream("s1", "c1", "Alice", "cam1");
        registry.start_stream("s2", "c2", "Bob", "cam2");
        registry.record_frame("s1", &frame(100)).unwrap();
        registry.record_frame("s2", &frame(50)).unwrap();
        registry.record_frame("s2", &frame(50)).unwrap();

        let totals = registry.total_stats();
        assert_eq!(totals.active_streams, 2);
        assert_eq!(totals.total_frames, 3);
        assert_eq!(totals.total_bytes, 200);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = StreamRegistry::next_stream_id("c1");
        let b = StreamRegistry::next_stream_id("c1");
        assert!(a.starts_with("stream_c1_"));
        assert_ne!(a, b);
    }
}
