//! Background health monitor
//!
//! Two independent periodic loops: one prunes idle client sessions, the other
//! probes every downstream endpoint. Both stop when the token is cancelled.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clients::ClientRegistry;
use crate::config::GatewayConfig;
use crate::services::ServiceRegistry;

pub struct HealthMonitor {
    clients: Arc<ClientRegistry>,
    services: Arc<ServiceRegistry>,
    session_timeout: Duration,
    client_interval: Duration,
    endpoint_interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        clients: Arc<ClientRegistry>,
        services: Arc<ServiceRegistry>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            clients,
            services,
            session_timeout: config.session_timeout(),
            client_interval: config.client_sweep_interval(),
            endpoint_interval: config.endpoint_sweep_interval(),
        }
    }

    pub fn spawn(self, cancel: CancellationToken, tracker: &TaskTracker) {
        let monitor = Arc::new(self);
        tracker.spawn(monitor.clone().run_client_sweep(cancel.clone()));
        tracker.spawn(monitor.run_endpoint_sweep(cancel));
    }

    async fn run_client_sweep(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.client_interval.as_secs(),
            timeout_secs = self.session_timeout.as_secs(),
            "Client sweep started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.client_interval) => {
                    let removed = self.clients.prune_idle(self.session_timeout);
                    if removed > 0 {
                        tracing::info!(removed, remaining = self.clients.len(), "Pruned idle clients");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Client sweep shutting down");
                    break;
                }
            }
        }
    }

    async fn run_endpoint_sweep(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.endpoint_interval.as_secs(),
            "Endpoint sweep started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.endpoint_interval) => {
                    let summary = self.services.run_health_sweep().await;
                    tracing::debug!(
                        healthy = summary.healthy,
                        unhealthy = summary.unhealthy,
                        "Endpoint sweep complete"
                    );
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Endpoint sweep shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServicesConfig;

    fn monitor(clients: Arc<ClientRegistry>) -> HealthMonitor {
        let config = GatewayConfig {
            session_timeout_secs: 60,
            client_sweep_interval_secs: 10,
            ..Default::default()
        };
        let services = Arc::new(ServiceRegistry::new(&ServicesConfig::default(), &config));
        HealthMonitor::new(clients, services, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_pruned_and_queues_closed() {
        let clients = Arc::new(ClientRegistry::new(4));
        let (idle, mut idle_rx) = clients.register("idle", "a", "ua");
        let (busy, _busy_rx) = clients.register("busy", "b", "ua");

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        monitor(clients.clone()).spawn(cancel.clone(), &tracker);

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            clients.touch(&busy.connection_id).unwrap();
        }

        assert!(clients.lookup_by_connection(&idle.connection_id).is_none());
        assert!(clients.lookup_by_connection(&busy.connection_id).is_some());
        assert!(idle_rx.recv().await.is_none());

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loops_stop_on_cancel() {
        let clients = Arc::new(ClientRegistry::new(4));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        monitor(clients).spawn(cancel.clone(), &tracker);

        assert_eq!(tracker.len(), 2);
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
    }
}
