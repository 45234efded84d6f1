//! Gateway configuration
//!
//! Loaded from a TOML file and/or environment variables; every field has a default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How often an open subscriber stream writes a keepalive and refreshes its session
pub const SUBSCRIBER_KEEPALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub services: ServicesConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Upper bound on the graceful shutdown window
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Largest accepted frame payload in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Queue sizes, timeouts and sweep periods for the routing core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Inbound frame queue capacity
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_control_buffer_size")]
    pub control_buffer_size: usize,

    /// Per-client outbound queue capacity
    #[serde(default = "default_client_queue_size")]
    pub client_queue_size: usize,

    /// Idle time after which a client session is pruned
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub client_sweep_interval_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub endpoint_sweep_interval_secs: u64,

    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_buffer_size() -> usize {
    1000
}

fn default_control_buffer_size() -> usize {
    100
}

fn default_client_queue_size() -> usize {
    100
}

fn default_session_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_dispatch_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            control_buffer_size: default_control_buffer_size(),
            client_queue_size: default_client_queue_size(),
            session_timeout_secs: default_session_timeout(),
            client_sweep_interval_secs: default_sweep_interval(),
            endpoint_sweep_interval_secs: default_sweep_interval(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn client_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.client_sweep_interval_secs.max(1))
    }

    pub fn endpoint_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.endpoint_sweep_interval_secs.max(1))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Downstream endpoint URLs, grouped by role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub video_processing: Vec<String>,

    #[serde(default)]
    pub analytics: Vec<String>,

    #[serde(default)]
    pub storage: Vec<String>,

    #[serde(default)]
    pub notification: Vec<String>,
}

/// External identity/profile service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// When false a static in-process provider is used
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_identity_url")]
    pub base_url: String,

    #[serde(default = "default_identity_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_identity_retries")]
    pub max_retries: u32,

    #[serde(default = "default_identity_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_identity_url() -> String {
    "http://localhost:9091".to_string()
}

fn default_identity_timeout() -> u64 {
    5
}

fn default_identity_retries() -> u32 {
    3
}

fn default_identity_retry_delay() -> u64 {
    1000
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_identity_url(),
            request_timeout_secs: default_identity_timeout(),
            max_retries: default_identity_retries(),
            retry_delay_ms: default_identity_retry_delay(),
        }
    }
}

impl IdentityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides on top of the current values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(port) = std::env::var("GATEWAY_HTTP_PORT") {
            if let Ok(p) = port.parse() {
                self.server.http_port = p;
            }
        }
        if let Ok(size) = std::env::var("GATEWAY_BUFFER_SIZE") {
            if let Ok(s) = size.parse() {
                self.gateway.buffer_size = s;
            }
        }
        if let Ok(secs) = std::env::var("GATEWAY_SESSION_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse() {
                self.gateway.session_timeout_secs = s;
            }
        }
        if let Ok(url) = std::env::var("GATEWAY_IDENTITY_URL") {
            self.identity.base_url = url;
            self.identity.enabled = true;
        }
        self
    }

    /// Reject settings the core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.buffer_size == 0 {
            return Err(ConfigError::Invalid("gateway.buffer_size must be > 0".into()));
        }
        if self.gateway.control_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "gateway.control_buffer_size must be > 0".into(),
            ));
        }
        if self.gateway.client_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "gateway.client_queue_size must be > 0".into(),
            ));
        }
        if self.gateway.session_timeout_secs <= SUBSCRIBER_KEEPALIVE.as_secs() {
            return Err(ConfigError::Invalid(format!(
                "gateway.session_timeout_secs must exceed the {}s subscriber keepalive",
                SUBSCRIBER_KEEPALIVE.as_secs()
            )));
        }
        if self.identity.enabled && self.identity.max_retries == 0 {
            return Err(ConfigError::Invalid("identity.max_retries must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
