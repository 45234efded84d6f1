//! Downstream endpoint registry
//!
//! Endpoints are created once from configuration, grouped by role, and never
//! removed. Health has two writers: a failed dispatch marks an endpoint down
//! immediately, and only a later successful dispatch or probe brings it back.
//! The two can race; both converge on "unhealthy" and the next probe settles it.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::{GatewayConfig, ServicesConfig};
use crate::error::GatewayError;
use crate::models::VideoFrame;

/// Value of the `X-API-Gateway` header on every dispatch
pub const GATEWAY_TAG: &str = "video-streaming";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    VideoProcessing,
    Analytics,
    Storage,
    Notification,
}

impl EndpointRole {
    pub const ALL: [EndpointRole; 4] = [
        EndpointRole::VideoProcessing,
        EndpointRole::Analytics,
        EndpointRole::Storage,
        EndpointRole::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointRole::VideoProcessing => "video_processing",
            EndpointRole::Analytics => "analytics",
            EndpointRole::Storage => "storage",
            EndpointRole::Notification => "notification",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            EndpointRole::VideoProcessing => "video",
            EndpointRole::Analytics => "analytics",
            EndpointRole::Storage => "storage",
            EndpointRole::Notification => "notification",
        }
    }
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire protocol of an endpoint.
///
/// RPC-style endpoints (`grpc://`, `rpc://`) are reached through their JSON
/// bridge over plain HTTP on the same host and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Rpc,
}

impl Protocol {
    fn detect(url: &str) -> Self {
        if url.starts_with("grpc://") || url.starts_with("rpc://") {
            Protocol::Rpc
        } else {
            Protocol::Http
        }
    }
}

/// Running call statistics for one endpoint
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_response: Duration,
    /// Mean latency over successful calls only
    pub average_time: Duration,
}

#[derive(Debug)]
struct EndpointState {
    healthy: bool,
    last_check: DateTime<Utc>,
    stats: EndpointStats,
}

/// A downstream service instance
#[derive(Debug)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    pub role: EndpointRole,
    pub protocol: Protocol,
    pub priority: usize,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    fn new(role: EndpointRole, index: usize, url: &str) -> Self {
        Self {
            id: format!("{}_{}", role.id_prefix(), index),
            url: url.to_string(),
            role,
            protocol: Protocol::detect(url),
            priority: index,
            state: RwLock::new(EndpointState {
                healthy: true,
                last_check: Utc::now(),
                stats: EndpointStats::default(),
            }),
        }
    }

    /// URL actually used for HTTP calls
    pub fn target_url(&self) -> String {
        match self.protocol {
            Protocol::Http => self.url.clone(),
            Protocol::Rpc => {
                let rest = self
                    .url
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(&self.url);
                format!("http://{}", rest)
            }
        }
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.target_url().trim_end_matches('/'))
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.read().await.healthy
    }

    pub async fn stats(&self) -> EndpointStats {
        self.state.read().await.stats.clone()
    }

    /// Record a finished call and set health from its outcome.
    /// Returns the previous health flag.
    async fn record_call(&self, success: bool, latency: Duration) -> bool {
        let mut state = self.state.write().await;
        let was_healthy = state.healthy;
        let stats = &mut state.stats;

        stats.total_requests += 1;
        stats.last_response = latency;
        if success {
            stats.success_count += 1;
            stats.average_time = running_mean(stats.average_time, latency, stats.success_count);
        } else {
            stats.error_count += 1;
        }

        state.healthy = success;
        state.last_check = Utc::now();
        was_healthy
    }

    async fn set_health(&self, healthy: bool) -> bool {
        let mut state = self.state.write().await;
        let was_healthy = state.healthy;
        state.healthy = healthy;
        state.last_check = Utc::now();
        was_healthy
    }

    pub async fn report(&self) -> EndpointReport {
        let state = self.state.read().await;
        EndpointReport {
            url: self.url.clone(),
            protocol: self.protocol,
            priority: self.priority,
            healthy: state.healthy,
            last_check: state.last_check,
            total_reqs: state.stats.total_requests,
            success: state.stats.success_count,
            errors: state.stats.error_count,
            last_response_ms: state.stats.last_response.as_millis() as u64,
            avg_time_ms: state.stats.average_time.as_millis() as u64,
        }
    }
}

/// Fold the `n`th sample into a mean of the previous `n - 1`.
fn running_mean(mean: Duration, sample: Duration, n: u64) -> Duration {
    let n = u128::from(n.max(1));
    let total = mean.as_nanos() * (n - 1) + sample.as_nanos();
    Duration::from_nanos(u64::try_from(total / n).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub url: String,
    pub protocol: Protocol,
    pub priority: usize,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub total_reqs: u64,
    pub success: u64,
    pub errors: u64,
    pub last_response_ms: u64,
    pub avg_time_ms: u64,
}

/// Endpoint id -> report, for one role
pub type RoleReport = BTreeMap<String, EndpointReport>;

/// Outcome of one periodic health sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

pub struct ServiceRegistry {
    endpoints: HashMap<EndpointRole, Vec<Arc<Endpoint>>>,
    client: Client,
    dispatch_timeout: Duration,
    probe_timeout: Duration,
}

impl ServiceRegistry {
    pub fn new(services: &ServicesConfig, gateway: &GatewayConfig) -> Self {
        let mut endpoints = HashMap::new();
        for role in EndpointRole::ALL {
            let urls = match role {
                EndpointRole::VideoProcessing => &services.video_processing,
                EndpointRole::Analytics => &services.analytics,
                EndpointRole::Storage => &services.storage,
                EndpointRole::Notification => &services.notification,
            };
            let list: Vec<Arc<Endpoint>> = urls
                .iter()
                .enumerate()
                .map(|(i, url)| Arc::new(Endpoint::new(role, i, url)))
                .collect();
            if !list.is_empty() {
                tracing::info!(role = %role, count = list.len(), "Endpoints registered");
            }
            endpoints.insert(role, list);
        }

        Self {
            endpoints,
            client: Client::new(),
            dispatch_timeout: gateway.dispatch_timeout(),
            probe_timeout: gateway.probe_timeout(),
        }
    }

    pub fn endpoints(&self, role: EndpointRole) -> &[Arc<Endpoint>] {
        self.endpoints.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn endpoint(&self, id: &str) -> Result<Arc<Endpoint>, GatewayError> {
        self.all_endpoints()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| GatewayError::DownstreamUnavailable {
                endpoint: id.to_string(),
                reason: "unknown endpoint".to_string(),
            })
    }

    fn all_endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        EndpointRole::ALL
            .into_iter()
            .flat_map(move |role| self.endpoints(role).iter())
    }

    async fn healthy(&self, role: EndpointRole) -> Vec<Arc<Endpoint>> {
        let mut healthy = Vec::new();
        for endpoint in self.endpoints(role) {
            if endpoint.is_healthy().await {
                healthy.push(endpoint.clone());
            }
        }
        healthy
    }

    /// Healthy endpoints a frame must be sent to.
    ///
    /// Video processing and storage always; analytics only for frames that
    /// carry authenticated client context.
    pub async fn endpoints_for_frame(&self, frame: &VideoFrame) -> Vec<Arc<Endpoint>> {
        let mut selected = self.healthy(EndpointRole::VideoProcessing).await;
        if frame.is_authenticated() {
            selected.extend(self.healthy(EndpointRole::Analytics).await);
        }
        selected.extend(self.healthy(EndpointRole::Storage).await);
        selected
    }

    /// POST the frame to one endpoint and fold the outcome into its health.
    pub async fn dispatch(
        &self,
        endpoint: &Endpoint,
        frame: &VideoFrame,
    ) -> Result<Duration, GatewayError> {
        let started = Instant::now();
        let result = self
            .client
            .post(endpoint.target_url())
            .timeout(self.dispatch_timeout)
            .header("X-API-Gateway", GATEWAY_TAG)
            .header("X-Client-ID", frame.client_id.as_str())
            .json(frame)
            .send()
            .await;
        let latency = started.elapsed();

        let failure = match result {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(format!("returned status {}", response.status())),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                if !endpoint.record_call(true, latency).await {
                    tracing::info!(endpoint = %endpoint.id, "Endpoint recovered on dispatch");
                }
                Ok(latency)
            }
            Some(reason) => {
                if endpoint.record_call(false, latency).await {
                    tracing::warn!(
                        endpoint = %endpoint.id,
                        role = %endpoint.role,
                        error = %reason,
                        "Dispatch failed, endpoint marked unhealthy"
                    );
                }
                Err(GatewayError::DownstreamUnavailable {
                    endpoint: endpoint.id.clone(),
                    reason,
                })
            }
        }
    }

    /// GET `{url}/health`; only a 200 counts as healthy.
    pub async fn probe_health(&self, endpoint: &Endpoint) -> bool {
        let healthy = match self
            .client
            .get(endpoint.health_url())
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!(endpoint = %endpoint.id, error = %e, "Health probe failed");
                false
            }
        };

        let was_healthy = endpoint.set_health(healthy).await;
        if !healthy {
            tracing::warn!(endpoint = %endpoint.id, role = %endpoint.role, "Service is unhealthy");
        } else if !was_healthy {
            tracing::info!(endpoint = %endpoint.id, role = %endpoint.role, "Service recovered");
        }
        healthy
    }

    /// Apply a health report received from outside the probe cycle.
    pub async fn report_health(&self, id: &str, healthy: bool) -> Result<(), GatewayError> {
        let endpoint = self.endpoint(id)?;
        if endpoint.set_health(healthy).await != healthy {
            tracing::info!(endpoint = %id, healthy, "Endpoint health reported");
        }
        Ok(())
    }

    /// Probe every endpoint of every role concurrently.
    pub async fn run_health_sweep(&self) -> SweepSummary {
        let probes = self.all_endpoints().map(|e| self.probe_health(e.as_ref()));
        let results = join_all(probes).await;

        let healthy = results.iter().filter(|h| **h).count();
        SweepSummary {
            healthy,
            unhealthy: results.len() - healthy,
        }
    }

    /// Per-role, per-endpoint health and statistics
    pub async fn stats_snapshot(&self) -> HashMap<String, RoleReport> {
        let mut snapshot = HashMap::new();
        for role in EndpointRole::ALL {
            let mut report = RoleReport::new();
            for endpoint in self.endpoints(role) {
                report.insert(endpoint.id.clone(), endpoint.report().await);
            }
            snapshot.insert(role.as_str().to_string(), report);
        }
        snapshot
    }
}
