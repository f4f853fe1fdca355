use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Transformer selection value that asks the proxy to detect the
/// transformer from the endpoint's domain.
pub const AUTO_TRANSFORMER: &str = "auto";

/// Main ccrelay configuration
///
/// Configuration is loaded from (in priority order):
/// 1. `ccrelay.jsonc` - JSON with comments
/// 2. `ccrelay.json` - Standard JSON
/// 3. `ccrelay.yml` / `ccrelay.yaml` - YAML format
///
/// Also checks hidden variants (`.ccrelay.*`) and `~/.config/ccrelay/` for global config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CcrelayConfig {
    /// Upstream profiles, in configuration order
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,

    /// Load balancing, health and proxy settings
    #[serde(default)]
    pub settings: SystemSettings,
}

// ============================================================================
// Profiles
// ============================================================================

/// One configured upstream target.
///
/// # Example
///
/// ```yaml
/// profiles:
///   - name: openrouter
///     baseUrl: https://openrouter.ai/api
///     apiKey: ${OPENROUTER_API_KEY}
///     model: anthropic/claude-sonnet-4.5
///     transformer: auto
///     priority: 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    pub name: String,

    #[serde(default)]
    pub base_url: String,

    #[serde(default, alias = "authToken")]
    pub api_key: String,

    #[serde(default)]
    pub model: Option<String>,

    /// Explicit transformer name, or `"auto"` for domain detection
    #[serde(default)]
    pub transformer: Option<String>,

    /// Allows proxying without a model (settings-only passthrough)
    #[serde(default)]
    pub transformer_enabled: bool,

    /// Lower values are preferred; ties keep configuration order
    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ProfileConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: String::new(),
            model: None,
            transformer: None,
            transformer_enabled: false,
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_transformer(mut self, transformer: impl Into<String>) -> Self {
        self.transformer = Some(transformer.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Base URL, API key and model are all present.
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && self.model.as_deref().is_some_and(|m| !m.trim().is_empty())
    }

    /// Usable without a model because transformation is switched on.
    pub fn is_transform_eligible(&self) -> bool {
        self.transformer_enabled
            && !self.base_url.trim().is_empty()
            && !self.api_key.trim().is_empty()
    }
}

// ============================================================================
// System settings
// ============================================================================

/// Endpoint selection algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Priority order; the first healthy endpoint wins
    #[default]
    #[serde(alias = "failover")]
    Fallback,
    /// Round-robin over healthy endpoints
    #[serde(alias = "roundRobin")]
    Polling,
    /// Lowest ranked average latency
    #[serde(alias = "speed-first", alias = "speed_first")]
    SpeedFirst,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fallback => "fallback",
            Self::Polling => "polling",
            Self::SpeedFirst => "speedFirst",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown strategy '{0}' (expected fallback, polling or speed-first)")]
pub struct ParseStrategyError(String);

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "fallback" | "failover" => Ok(Self::Fallback),
            "polling" | "roundrobin" => Ok(Self::Polling),
            "speedfirst" => Ok(Self::SpeedFirst),
            _ => Err(ParseStrategyError(s.to_string())),
        }
    }
}

/// How latency samples are collected for `SpeedFirst`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpeedTestStrategy {
    /// Latency of real proxied requests
    #[default]
    ResponseTime,
    /// Background `HEAD` request to each endpoint
    HeadRequest,
    /// Background TCP connect to each endpoint
    Ping,
}

/// Load balancer settings, fully defaulted at deserialization time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSettings {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub health_check: HealthCheckSettings,

    #[serde(default)]
    pub failed_endpoint: FailedEndpointSettings,

    #[serde(default)]
    pub speed_first: SpeedFirstSettings,

    #[serde(default)]
    pub proxy: ProxySettings,
}

/// Background health probing.
///
/// # Example
///
/// ```yaml
/// settings:
///   healthCheck:
///     enabled: true
///     intervalMs: 30000
///     timeoutMs: 10000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSettings {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEndpointSettings {
    #[serde(default = "default_ban_duration_seconds")]
    pub ban_duration_seconds: u64,
}

impl Default for FailedEndpointSettings {
    fn default() -> Self {
        Self {
            ban_duration_seconds: default_ban_duration_seconds(),
        }
    }
}

impl FailedEndpointSettings {
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_seconds)
    }
}

fn default_ban_duration_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedFirstSettings {
    #[serde(default = "default_response_time_window_ms")]
    pub response_time_window_ms: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_speed_test_interval_seconds")]
    pub speed_test_interval_seconds: u64,

    #[serde(default)]
    pub speed_test_strategy: SpeedTestStrategy,
}

impl Default for SpeedFirstSettings {
    fn default() -> Self {
        Self {
            response_time_window_ms: default_response_time_window_ms(),
            min_samples: default_min_samples(),
            speed_test_interval_seconds: default_speed_test_interval_seconds(),
            speed_test_strategy: SpeedTestStrategy::default(),
        }
    }
}

impl SpeedFirstSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.response_time_window_ms)
    }

    pub fn speed_test_interval(&self) -> Duration {
        Duration::from_secs(self.speed_test_interval_seconds.max(1))
    }
}

fn default_response_time_window_ms() -> u64 {
    300_000
}

fn default_min_samples() -> usize {
    2
}

fn default_speed_test_interval_seconds() -> u64 {
    60
}

/// Listening socket and request lifecycle of the local proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default = "default_proxy_host")]
    pub host: String,

    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Upper bound on waiting for upstream response headers
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long in-flight requests may run after shutdown is requested
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl ProxySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8788
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}
