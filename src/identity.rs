//! Identity service lookups
//!
//! The gateway asks an external profile service for the user behind a client
//! id and for that user's streaming target. Providers are pluggable; the
//! resolver wraps whichever is configured with a per-attempt timeout, a fixed
//! retry budget and a per-client target cache.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IdentityConfig;

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("identity service unavailable: {0}")]
    Unavailable(String),

    #[error("no user for {0}")]
    NotFound(String),

    #[error("identity request timed out")]
    Timeout,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
}

/// Where a user's video should be sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingTarget {
    pub server_url: String,
    pub server_port: u16,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub max_bitrate: u32,
    pub max_resolution: u32,
}

impl StreamingTarget {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_url, self.server_port)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn user_by_client(&self, client_id: &str) -> Result<UserProfile, IdentityError>;

    async fn streaming_target(&self, user_id: &str) -> Result<StreamingTarget, IdentityError>;
}

/// Provider backed by the identity service's HTTP API
pub struct HttpIdentityClient {
    client: Client,
    base_url: String,
}

impl HttpIdentityClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        key: &str,
    ) -> Result<T, IdentityError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(IdentityError::NotFound(key.to_string())),
            s if !s.is_success() => Err(IdentityError::Unavailable(format!("status {}", s))),
            _ => resp
                .json::<T>()
                .await
                .map_err(|e| IdentityError::Unavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityClient {
    async fn user_by_client(&self, client_id: &str) -> Result<UserProfile, IdentityError> {
        let url = format!("{}/users/by-client/{}", self.base_url, client_id);
        self.get_json(&url, client_id).await
    }

    async fn streaming_target(&self, user_id: &str) -> Result<StreamingTarget, IdentityError> {
        let url = format!("{}/users/{}/streaming", self.base_url, user_id);
        self.get_json(&url, user_id).await
    }
}

/// In-process provider used when no identity service is configured
pub struct StaticIdentity;

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn user_by_client(&self, client_id: &str) -> Result<UserProfile, IdentityError> {
        Ok(UserProfile {
            user_id: format!("user_{}", client_id),
            username: format!("user_{}", client_id),
            email: format!("user_{}@example.com", client_id),
        })
    }

    async fn streaming_target(&self, _user_id: &str) -> Result<StreamingTarget, IdentityError> {
        Ok(StreamingTarget {
            server_url: "video-service-1.example.com".to_string(),
            server_port: 8082,
            endpoint: "/api/v1/video/stream".to_string(),
            api_key: "static-key".to_string(),
            max_bitrate: 5000,
            max_resolution: 1080,
        })
    }
}

/// Profile and target resolved for one client
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub profile: UserProfile,
    pub target: StreamingTarget,
}

impl ResolvedTarget {
    /// Stream metadata attached on start. The api key stays out.
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("video_server".to_string(), self.target.server_address()),
            ("video_endpoint".to_string(), self.target.endpoint.clone()),
            ("user_id".to_string(), self.profile.user_id.clone()),
            ("username".to_string(), self.profile.username.clone()),
            ("max_bitrate".to_string(), self.target.max_bitrate.to_string()),
            (
                "max_resolution".to_string(),
                self.target.max_resolution.to_string(),
            ),
        ])
    }
}

pub struct IdentityResolver {
    provider: Arc<dyn IdentityProvider>,
    max_retries: u32,
    retry_delay: Duration,
    request_timeout: Duration,
    targets: DashMap<String, ResolvedTarget>,
}

impl IdentityResolver {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: &IdentityConfig) -> Self {
        Self {
            provider,
            max_retries: config.max_retries.max(1),
            retry_delay: config.retry_delay(),
            request_timeout: config.request_timeout(),
            targets: DashMap::new(),
        }
    }

    /// Build the resolver the config asks for: HTTP when enabled, static otherwise.
    pub fn from_config(config: &IdentityConfig) -> Self {
        let provider: Arc<dyn IdentityProvider> = if config.enabled {
            tracing::info!(url = %config.base_url, "Using identity service");
            Arc::new(HttpIdentityClient::new(config.base_url.clone()))
        } else {
            tracing::info!("Identity service disabled, using static profiles");
            Arc::new(StaticIdentity)
        };
        Self::new(provider, config)
    }

    /// Resolve a client's profile and streaming target, serving repeats from cache.
    pub async fn resolve(&self, client_id: &str) -> Result<ResolvedTarget, IdentityError> {
        if let Some(cached) = self.targets.get(client_id) {
            return Ok(cached.clone());
        }

        let provider = self.provider.clone();
        let profile = self
            .with_retry("user_by_client", || {
                let provider = provider.clone();
                let client_id = client_id.to_string();
                async move { provider.user_by_client(&client_id).await }
            })
            .await?;

        let user_id = profile.user_id.clone();
        let target = self
            .with_retry("streaming_target", || {
                let provider = provider.clone();
                let user_id = user_id.clone();
                async move { provider.streaming_target(&user_id).await }
            })
            .await?;

        let resolved = ResolvedTarget { profile, target };
        self.targets.insert(client_id.to_string(), resolved.clone());
        Ok(resolved)
    }

    pub fn evict(&self, client_id: &str) {
        if self.targets.remove(client_id).is_some() {
            tracing::debug!(client = %client_id, "Evicted cached streaming target");
        }
    }

    pub fn cached(&self, client_id: &str) -> Option<ResolvedTarget> {
        self.targets.get(client_id).map(|t| t.clone())
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, IdentityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IdentityError>>,
    {
        let mut last = IdentityError::Timeout;

        for attempt in 1..=self.max_retries {
            let outcome = match tokio::time::timeout(self.request_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(IdentityError::Timeout),
            };

            match outcome {
                Ok(value) => return Ok(value),
                // A missing user will not appear on retry
                Err(IdentityError::NotFound(key)) => return Err(IdentityError::NotFound(key)),
                Err(e) => {
                    tracing::warn!(op, attempt, max = self.max_retries, error = %e, "Identity lookup failed");
                    last = e;
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(IdentityError::RetriesExhausted {
            attempts: self.max_retries,
            last: last.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with Unavailable, then behaves like the static provider
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl IdentityProvider for Flaky {
        async fn user_by_client(&self, client_id: &str) -> Result<UserProfile, IdentityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(IdentityError::Unavailable("connection refused".into()));
            }
            StaticIdentity.user_by_client(client_id).await
        }

        async fn streaming_target(&self, user_id: &str) -> Result<StreamingTarget, IdentityError> {
            StaticIdentity.streaming_target(user_id).await
        }
    }

    struct Missing;

    #[async_trait]
    impl IdentityProvider for Missing {
        async fn user_by_client(&self, client_id: &str) -> Result<UserProfile, IdentityError> {
            Err(IdentityError::NotFound(client_id.to_string()))
        }

        async fn streaming_target(&self, user_id: &str) -> Result<StreamingTarget, IdentityError> {
            Err(IdentityError::NotFound(user_id.to_string()))
        }
    }

    struct Hangs;

    #[async_trait]
    impl IdentityProvider for Hangs {
        async fn user_by_client(&self, _client_id: &str) -> Result<UserProfile, IdentityError> {
            std::future::pending().await
        }

        async fn streaming_target(&self, _user_id: &str) -> Result<StreamingTarget, IdentityError> {
            std::future::pending().await
        }
    }

    fn resolver(provider: Arc<dyn IdentityProvider>) -> IdentityResolver {
        IdentityResolver::new(provider, &IdentityConfig::default())
    }

    #[tokio::test]
    async fn static_provider_resolves_deterministically() {
        let resolver = resolver(Arc::new(StaticIdentity));
        let resolved = resolver.resolve("c1").await.unwrap();

        assert_eq!(resolved.profile.user_id, "user_c1");
        let meta = resolved.metadata();
        assert_eq!(meta["video_server"], "video-service-1.example.com:8082");
        assert_eq!(meta["max_bitrate"], "5000");
        assert!(!meta.contains_key("api_key"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let resolver = resolver(flaky.clone());

        let resolved = resolver.resolve("c1").await.unwrap();
        assert_eq!(resolved.profile.user_id, "user_c1");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_typed() {
        let flaky = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let resolver = resolver(flaky.clone());

        let err = resolver.resolve("c1").await.unwrap_err();
        assert!(matches!(err, IdentityError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(resolver.cached("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let resolver = resolver(Arc::new(Missing));
        let err = resolver.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, IdentityError::NotFound(ref k) if k == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out_each_attempt() {
        let resolver = resolver(Arc::new(Hangs));
        let err = resolver.resolve("c1").await.unwrap_err();
        match err {
            IdentityError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, IdentityError::Timeout.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cache_is_served_until_evicted() {
        let flaky = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let resolver = resolver(flaky.clone());

        resolver.resolve("c1").await.unwrap();
        resolver.resolve("c1").await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

        resolver.evict("c1");
        assert!(resolver.cached("c1").is_none());
        resolver.resolve("c1").await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }
}
