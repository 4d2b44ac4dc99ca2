//! Agent configuration

use crate::error::{ConfigError, InitError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control endpoint used when no override is given
pub const DEFAULT_CONTROL_ENDPOINT: &str = "control.packetsdk.net:7443";

/// Largest accepted backoff multiplier
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// A control server to dial
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlEndpoint {
    /// host:port
    pub address: String,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// SNI / certificate name, defaults to the host part of `address`
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ControlEndpoint {
    pub fn tls(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: true,
            server_name: None,
        }
    }

    pub fn plain(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: false,
            server_name: None,
        }
    }

    /// Host part of the address, without port or IPv6 brackets
    pub fn host(&self) -> &str {
        let host = match self.address.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.address,
        };
        host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn tls_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_else(|| self.host())
    }

    fn validate(&self) -> Result<(), String> {
        let Some((host, port)) = self.address.rsplit_once(':') else {
            return Err(format!(
                "Invalid control endpoint '{}'. Expected 'host:port'",
                self.address
            ));
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(format!(
                "Invalid control endpoint '{}'. Expected 'host:port'",
                self.address
            ));
        }
        Ok(())
    }
}

/// Reconnection policy for the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Random extra delay as a fraction of the nominal delay, in [0, 1)
    pub jitter: f64,
    /// Consecutive retries after a failure before giving up
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 8,
        }
    }
}

/// Control channel liveness policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Silent intervals tolerated before the session is declared lost
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            miss_threshold: 3,
        }
    }
}

/// Relay engine resource limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayLimits {
    /// Per-direction buffer size in bytes
    pub buffer_size: usize,
    pub max_concurrent_relays: usize,
    /// Per-relay rate limit across both directions (None = unlimited)
    pub max_bytes_per_sec: Option<u64>,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            max_concurrent_relays: 32,
            max_bytes_per_sec: None,
        }
    }
}

/// Options supplied to `Agent::initialize`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentOptions {
    pub enable_logging: bool,
    /// Overrides the default control endpoint; tried round-robin
    pub control_endpoints: Vec<ControlEndpoint>,
    /// Extra PEM root certificates for TLS control endpoints
    pub tls_root_cert: Option<PathBuf>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub relay: RelayLimits,
    /// How long `stop()` waits before force-closing resources
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            enable_logging: false,
            control_endpoints: Vec::new(),
            tls_root_cert: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            relay: RelayLimits::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl AgentOptions {
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    /// Load options from a YAML file; missing fields take their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn validate(&self) -> Result<(), InitError> {
        let invalid = |msg: String| Err(InitError::InvalidOptions(msg));

        for endpoint in &self.control_endpoints {
            if let Err(msg) = endpoint.validate() {
                return invalid(msg);
            }
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return invalid("timeouts must be non-zero".to_string());
        }
        if self.reconnect.initial_backoff.is_zero() {
            return invalid("initial_backoff must be non-zero".to_string());
        }
        if self.reconnect.max_backoff < self.reconnect.initial_backoff {
            return invalid("max_backoff must be >= initial_backoff".to_string());
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return invalid("jitter must be in [0, 1)".to_string());
        }
        if !self.reconnect.multiplier.is_finite()
            || self.reconnect.multiplier > MAX_BACKOFF_MULTIPLIER
        {
            return invalid(format!(
                "multiplier must be finite and at most {}",
                MAX_BACKOFF_MULTIPLIER
            ));
        }
        // Keeps jittered delays strictly increasing below the cap
        if self.reconnect.multiplier <= 1.0 + self.reconnect.jitter {
            return invalid("multiplier must exceed 1 + jitter".to_string());
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.miss_threshold == 0 {
            return invalid("heartbeat interval and miss_threshold must be non-zero".to_string());
        }
        if self.relay.buffer_size == 0 || self.relay.max_concurrent_relays == 0 {
            return invalid("relay buffer_size and max_concurrent_relays must be non-zero".to_string());
        }
        if self.relay.max_bytes_per_sec == Some(0) {
            return invalid("max_bytes_per_sec must be non-zero when set".to_string());
        }
        Ok(())
    }
}

/// Builder for AgentOptions
#[derive(Default)]
pub struct AgentOptionsBuilder {
    options: AgentOptions,
}

impl AgentOptionsBuilder {
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.options.enable_logging = enabled;
        self
    }

    pub fn control_endpoint(mut self, endpoint: ControlEndpoint) -> Self {
        self.options.control_endpoints.push(endpoint);
        self
    }

    pub fn tls_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.tls_root_cert = Some(path.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.options.reconnect = reconnect;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.options.heartbeat = heartbeat;
        self
    }

    pub fn relay(mut self, relay: RelayLimits) -> Self {
        self.options.relay = relay;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.options.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> AgentOptions {
        self.options
    }
}

/// Immutable configuration fixed at initialization
#[derive(Debug, Clone)]
pub struct AgentConfig {
    app_key: String,
    options: AgentOptions,
}

impl AgentConfig {
    pub fn new(app_key: impl Into<String>, mut options: AgentOptions) -> Result<Self, InitError> {
        let app_key = app_key.into();

        if app_key.trim().is_empty() {
            return Err(InitError::EmptyAppKey);
        }
        if app_key
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(InitError::InvalidAppKey);
        }

        options.validate()?;

        if options.control_endpoints.is_empty() {
            options
                .control_endpoints
                .push(ControlEndpoint::tls(DEFAULT_CONTROL_ENDPOINT));
        }

        Ok(Self { app_key, options })
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn control_endpoints(&self) -> &[ControlEndpoint] {
        &self.options.control_endpoints
    }
}

/// Helper module for serializing Duration as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
