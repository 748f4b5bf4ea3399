//! Configuration management for the crawlgate gateway
//!
//! Configuration is loaded from a TOML file, then overridden by `CRAWLGATE_*`
//! environment variables, then validated. Every section carries serde
//! defaults so a minimal file only needs to list the backends.
//!
//! Legacy camelCase option names (`maxConcurrentSessions`, `probeIntervalMs`,
//! `leaseTtlMs`, `backendList`, ...) are accepted as aliases.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::retry::RetryConfig;

// ============================================================================
// Top-level configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP surface
    pub server: ServerConfig,

    /// Browser-session admission control
    pub admission: AdmissionConfig,

    /// Resource ledger backing store
    pub ledger: LedgerConfig,

    /// Backend health probing
    pub probe: ProbeConfig,

    /// Static worker backend list
    #[serde(alias = "backendList")]
    pub backends: Vec<BackendConfig>,

    /// Proxy and identity rotation
    pub rotation: RotationConfig,

    /// Asynchronous queue intake
    pub intake: IntakeConfig,

    /// Remote WebDriver endpoint
    pub browser: BrowserConfig,

    /// Retry policy for backend and browser calls
    pub retry: RetryConfig,

    /// Logging
    pub logging: LoggingConfig,
}

/// Gateway HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: SocketAddr,

    /// Enable CORS for API
    pub enable_cors: bool,

    /// Enable request logging
    pub enable_request_logging: bool,

    /// API key required by admin endpoints (optional)
    pub admin_api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
            enable_request_logging: true,
            admin_api_key: None,
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of live browser-session leases across all replicas
    #[serde(alias = "maxConcurrentSessions")]
    pub max_concurrent_sessions: u32,

    /// Lease lifetime without renewal
    #[serde(alias = "leaseTtlMs")]
    pub lease_ttl_ms: u64,

    /// Expiry sweep cadence
    pub sweep_interval_ms: u64,

    /// How long `schedule` waits for a lease before `ResourceUnavailable`
    pub acquire_timeout_ms: u64,

    /// Ledger poll cadence while waiting (covers grants made by other replicas)
    pub poll_interval_ms: u64,

    /// Spiders that always need a browser session
    pub browser_task_types: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            lease_ttl_ms: 600_000,
            sweep_interval_ms: 5_000,
            acquire_timeout_ms: 30_000,
            poll_interval_ms: 250,
            browser_task_types: Vec::new(),
        }
    }
}

impl AdmissionConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which store holds leases and the wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// In-process ledger (single replica only)
    #[default]
    Memory,
    /// Redis ledger shared by every replica
    Redis,
}

/// Resource ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Key namespace, so several gateways can share one Redis
    pub key_prefix: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// How long a job id stays claimed while its placement is in progress
    pub dispatch_claim_ms: u64,

    /// How long a dispatched job id is remembered for redelivery checks
    pub dispatch_retention_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            redis_url: String::from("redis://127.0.0.1:6379"),
            key_prefix: String::from("crawlgate:admission"),
            pool_size: 16,
            dispatch_claim_ms: 120_000,
            dispatch_retention_ms: 86_400_000,
        }
    }
}

impl LedgerConfig {
    pub fn dispatch_claim(&self) -> Duration {
        Duration::from_millis(self.dispatch_claim_ms)
    }

    pub fn dispatch_retention(&self) -> Duration {
        Duration::from_millis(self.dispatch_retention_ms)
    }
}

/// Health probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    #[serde(alias = "probeIntervalMs")]
    pub probe_interval_ms: u64,

    /// Timeout for a single status request
    pub probe_timeout_ms: u64,

    /// Consecutive failures before a node is marked offline
    pub failure_threshold: u32,

    /// Cadence of the dispatched-job status poller
    pub job_poll_interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 2_000,
            failure_threshold: 3,
            job_poll_interval_ms: 10_000,
        }
    }
}

impl ProbeConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}

/// A statically configured worker backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable node identifier (also the tie-breaker when ranking)
    pub id: String,

    /// Base URL, e.g. `http://scrapyd-1:6800`
    #[serde(alias = "base_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            username: None,
            password: None,
        }
    }

    /// Set basic-auth credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// An identity entry in the rotation catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub value: String,
    pub device_class: String,
    pub browser_family: String,
}

/// Rotation store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    #[serde(alias = "proxyRotationEnabled")]
    pub proxy_rotation_enabled: bool,

    /// Used when rotation is disabled or the pool is empty
    #[serde(alias = "defaultProxy")]
    pub default_proxy: Option<String>,

    /// Initial proxy pool
    pub proxies: Vec<String>,

    /// Proxies at or above this failure count are skipped while healthier ones exist
    pub proxy_failure_threshold: u32,

    #[serde(alias = "identityRotationEnabled")]
    pub identity_rotation_enabled: bool,

    #[serde(alias = "defaultIdentity")]
    pub default_identity: Option<String>,

    /// Identity catalog; the built-in catalog is used when empty
    pub identities: Vec<IdentityConfig>,

    /// JSON file holding the catalogs and usage counters across restarts
    #[serde(alias = "dataFile")]
    pub state_file: Option<PathBuf>,

    /// How often usage counters are written to `state_file`
    pub state_flush_interval_ms: u64,

    /// Proxy health-check cadence; 0 disables the checker
    #[serde(alias = "healthCheckInterval")]
    pub health_check_interval_ms: u64,

    /// URL fetched through each proxy by the health check
    #[serde(alias = "healthCheckUrl")]
    pub health_check_url: String,

    #[serde(alias = "healthCheckTimeout")]
    pub health_check_timeout_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            proxy_rotation_enabled: false,
            default_proxy: None,
            proxies: Vec::new(),
            proxy_failure_threshold: 3,
            identity_rotation_enabled: true,
            default_identity: None,
            identities: Vec::new(),
            state_file: None,
            state_flush_interval_ms: 30_000,
            health_check_interval_ms: 60_000,
            health_check_url: "http://httpbin.org/ip".to_string(),
            health_check_timeout_ms: 5_000,
        }
    }
}

impl RotationConfig {
    pub fn state_flush_interval(&self) -> Duration {
        Duration::from_millis(self.state_flush_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Queue intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub enabled: bool,

    /// Durable queue name (Redis list key)
    pub queue_name: String,

    /// Broker URL; falls back to `ledger.redis_url`
    pub redis_url: Option<String>,

    /// Concurrent consumer tasks
    pub workers: usize,

    /// Sleep between empty receives
    pub poll_interval_ms: u64,

    /// Delay before a transiently rejected message is requeued
    pub requeue_delay_ms: u64,

    /// Consumer name (processing list suffix); defaults to the hostname-free
    /// `gateway`
    pub consumer_name: String,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_name: String::from("crawlgate:tasks"),
            redis_url: None,
            workers: 2,
            poll_interval_ms: 500,
            requeue_delay_ms: 2_000,
            consumer_name: String::from("gateway"),
        }
    }
}

/// Remote WebDriver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// WebDriver hub URL; sessions are not created when absent
    pub endpoint: Option<String>,

    /// `browserName` capability
    pub browser_name: String,

    /// Timeout for session create/delete calls
    pub session_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            browser_name: String::from("chrome"),
            session_timeout_ms: 30_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl GatewayConfig {
    /// Create a new config builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: String::from("<inline>"),
            reason: e.to_string(),
        })
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `CRAWLGATE_*` environment overrides in place
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(addr) = env_var("CRAWLGATE_BIND_ADDRESS") {
            self.server.bind_address = parse_field("CRAWLGATE_BIND_ADDRESS", &addr)?;
        }
        if let Some(key) = env_var("CRAWLGATE_ADMIN_API_KEY") {
            self.server.admin_api_key = Some(key);
        }
        if let Some(v) = env_var("CRAWLGATE_MAX_CONCURRENT_SESSIONS") {
            self.admission.max_concurrent_sessions =
                parse_field("CRAWLGATE_MAX_CONCURRENT_SESSIONS", &v)?;
        }
        if let Some(v) = env_var("CRAWLGATE_LEASE_TTL_MS") {
            self.admission.lease_ttl_ms = parse_field("CRAWLGATE_LEASE_TTL_MS", &v)?;
        }
        if let Some(v) = env_var("CRAWLGATE_PROBE_INTERVAL_MS") {
            self.probe.probe_interval_ms = parse_field("CRAWLGATE_PROBE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = env_var("CRAWLGATE_LEDGER") {
            self.ledger.backend = match v.to_ascii_lowercase().as_str() {
                "memory" => LedgerBackend::Memory,
                "redis" => LedgerBackend::Redis,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "CRAWLGATE_LEDGER".to_string(),
                        reason: format!("unknown ledger backend '{other}'"),
                    })
                }
            };
        }
        if let Some(url) = env_var("CRAWLGATE_REDIS_URL") {
            self.ledger.redis_url = url;
        }
        if let Some(list) = env_var("CRAWLGATE_BACKENDS") {
            self.backends = parse_backend_list(&list)?;
        }
        if let Some(proxy) = env_var("CRAWLGATE_DEFAULT_PROXY") {
            self.rotation.default_proxy = Some(proxy);
        }
        if let Some(v) = env_var("CRAWLGATE_PROXY_ROTATION_ENABLED") {
            self.rotation.proxy_rotation_enabled =
                parse_field("CRAWLGATE_PROXY_ROTATION_ENABLED", &v)?;
        }
        if let Some(identity) = env_var("CRAWLGATE_DEFAULT_IDENTITY") {
            self.rotation.default_identity = Some(identity);
        }
        if let Some(v) = env_var("CRAWLGATE_IDENTITY_ROTATION_ENABLED") {
            self.rotation.identity_rotation_enabled =
                parse_field("CRAWLGATE_IDENTITY_ROTATION_ENABLED", &v)?;
        }
        if let Some(path) = env_var("CRAWLGATE_ROTATION_STATE_FILE") {
            self.rotation.state_file = Some(PathBuf::from(path));
        }
        if let Some(v) = env_var("CRAWLGATE_INTAKE_ENABLED") {
            self.intake.enabled = parse_field("CRAWLGATE_INTAKE_ENABLED", &v)?;
        }
        if let Some(endpoint) = env_var("CRAWLGATE_BROWSER_ENDPOINT") {
            self.browser.endpoint = Some(endpoint);
        }
        if let Some(level) = env_var("CRAWLGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_var("CRAWLGATE_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::MissingField {
                field: "backends".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "backends.id".to_string(),
                    reason: "Backend id must not be empty".to_string(),
                });
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "backends.id".to_string(),
                    reason: format!("Duplicate backend id '{}'", backend.id),
                });
            }
            if url::Url::parse(&backend.url).is_err() {
                return Err(ConfigError::InvalidValue {
                    field: format!("backends.{}.url", backend.id),
                    reason: format!("Invalid URL: {}", backend.url),
                });
            }
        }

        if self.admission.lease_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "admission.lease_ttl_ms".to_string(),
                reason: "Lease TTL must be greater than 0".to_string(),
            });
        }

        if self.admission.sweep_interval_ms == 0 || self.admission.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "admission.sweep_interval_ms".to_string(),
                reason: "Sweep and poll intervals must be greater than 0".to_string(),
            });
        }

        if self.probe.probe_interval_ms == 0 || self.probe.job_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "probe.probe_interval_ms".to_string(),
                reason: "Probe intervals must be greater than 0".to_string(),
            });
        }

        // Running jobs only keep their lease through the status poller
        if self.probe.job_poll_interval_ms.saturating_mul(2) > self.admission.lease_ttl_ms {
            return Err(ConfigError::InvalidValue {
                field: "probe.job_poll_interval_ms".to_string(),
                reason: format!(
                    "Job poll interval ({}ms) must be at most half of admission.lease_ttl_ms ({}ms)",
                    self.probe.job_poll_interval_ms, self.admission.lease_ttl_ms
                ),
            });
        }

        if self.probe.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "probe.failure_threshold".to_string(),
                reason: "Must tolerate at least 1 failure".to_string(),
            });
        }

        if self.ledger.backend == LedgerBackend::Redis && self.ledger.pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ledger.pool_size".to_string(),
                reason: "pool_size must be greater than 0".to_string(),
            });
        }

        if self.ledger.dispatch_claim_ms <= self.admission.acquire_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "ledger.dispatch_claim_ms".to_string(),
                reason: "Dispatch claim must outlast admission.acquire_timeout_ms".to_string(),
            });
        }

        if self.ledger.dispatch_retention_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ledger.dispatch_retention_ms".to_string(),
                reason: "Dispatch retention must be greater than 0".to_string(),
            });
        }

        if self.rotation.state_file.is_some() && self.rotation.state_flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "rotation.state_flush_interval_ms".to_string(),
                reason: "Flush interval must be greater than 0".to_string(),
            });
        }

        if self.rotation.health_check_interval_ms > 0 {
            if url::Url::parse(&self.rotation.health_check_url).is_err() {
                return Err(ConfigError::InvalidValue {
                    field: "rotation.health_check_url".to_string(),
                    reason: format!("Invalid URL: {}", self.rotation.health_check_url),
                });
            }
            if self.rotation.health_check_timeout_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "rotation.health_check_timeout_ms".to_string(),
                    reason: "Health-check timeout must be greater than 0".to_string(),
                });
            }
        }

        if self.intake.enabled && self.intake.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "intake.workers".to_string(),
                reason: "At least one worker is required when intake is enabled".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                reason: format!("Unknown format '{}'", self.logging.format),
            });
        }

        Ok(())
    }

    /// Broker URL for intake
    pub fn intake_redis_url(&self) -> &str {
        self.intake
            .redis_url
            .as_deref()
            .unwrap_or(&self.ledger.redis_url)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("Cannot parse '{value}'"),
    })
}

/// Parse `id=url,id=url` (a bare URL gets a positional id)
pub fn parse_backend_list(list: &str) -> Result<Vec<BackendConfig>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once('=') {
            Some((id, url)) if !id.contains(':') => Ok(BackendConfig::new(id.trim(), url.trim())),
            _ if entry.contains("://") => Ok(BackendConfig::new(format!("node-{}", i + 1), entry)),
            _ => Err(ConfigError::InvalidValue {
                field: "backends".to_string(),
                reason: format!("Cannot parse backend entry '{entry}'"),
            }),
        })
        .collect()
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for GatewayConfig
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set bind address from string
    pub fn bind_address_str(mut self, addr: &str) -> Result<Self, ConfigError> {
        self.config.server.bind_address = addr.parse().map_err(|_| ConfigError::InvalidValue {
            field: "bind_address".to_string(),
            reason: format!("Invalid address: {}", addr),
        })?;
        Ok(self)
    }

    /// Add a backend
    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.config.backends.push(backend);
        self
    }

    /// Set the global session cap
    pub fn max_concurrent_sessions(mut self, max: u32) -> Self {
        self.config.admission.max_concurrent_sessions = max;
        self
    }

    /// Set lease TTL
    pub fn lease_ttl_ms(mut self, ms: u64) -> Self {
        self.config.admission.lease_ttl_ms = ms;
        self
    }

    /// Set admission wait timeout
    pub fn acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.admission.acquire_timeout_ms = ms;
        self
    }

    /// Set probe cadence
    pub fn probe_interval_ms(mut self, ms: u64) -> Self {
        self.config.probe.probe_interval_ms = ms;
        self
    }

    /// Set dispatched-job poll cadence
    pub fn job_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.probe.job_poll_interval_ms = ms;
        self
    }

    /// Set admin API key
    pub fn admin_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.server.admin_api_key = Some(key.into());
        self
    }

    /// Set retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the config
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io { path: String, reason: String },
    Parse { path: String, reason: String },
    InvalidValue { field: String, reason: String },
    MissingField { field: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, reason } => {
                write!(f, "Failed to read config file {}: {}", path, reason)
            }
            Self::Parse { path, reason } => {
                write!(f, "Failed to parse config file {}: {}", path, reason)
            }
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
            Self::MissingField { field } => {
                write!(f, "Missing required field: {}", field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_backend() -> GatewayConfig {
        GatewayConfig::builder()
            .backend(BackendConfig::new("node-1", "http://localhost:6800"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_needs_backends() {
        let config = GatewayConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
        assert!(one_backend().validate().is_ok());
    }

    #[test]
    fn test_legacy_aliases() {
        let toml = r#"
            backendList = [{ id = "a", url = "http://a:6800" }]

            [admission]
            maxConcurrentSessions = 7
            leaseTtlMs = 60000

            [probe]
            probeIntervalMs = 250

            [rotation]
            defaultProxy = "http://p:3128"
            proxyRotationEnabled = true
        "#;
        let config = GatewayConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.admission.max_concurrent_sessions, 7);
        assert_eq!(config.admission.lease_ttl_ms, 60000);
        assert_eq!(config.probe.probe_interval_ms, 250);
        assert_eq!(config.rotation.default_proxy.as_deref(), Some("http://p:3128"));
        assert!(config.rotation.proxy_rotation_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_backend_rejected() {
        let result = GatewayConfig::builder()
            .backend(BackendConfig::new("a", "http://a:6800"))
            .backend(BackendConfig::new("a", "http://b:6800"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_sessions_is_valid() {
        let config = GatewayConfig::builder()
            .backend(BackendConfig::new("a", "http://a:6800"))
            .max_concurrent_sessions(0)
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn test_job_poll_must_undercut_lease_ttl() {
        let build = |ttl: u64, poll: u64| {
            GatewayConfig::builder()
                .backend(BackendConfig::new("a", "http://a:6800"))
                .lease_ttl_ms(ttl)
                .job_poll_interval_ms(poll)
                .build()
        };
        assert!(build(20_000, 10_000).is_ok());
        match build(1_000, 10_000) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "probe.job_poll_interval_ms"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(build(15_000, 10_000).is_err());
    }

    #[test]
    fn test_dispatch_claim_outlasts_acquire_timeout() {
        let mut config = one_backend();
        config.ledger.dispatch_claim_ms = config.admission.acquire_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_backend_list() {
        let backends = parse_backend_list("a=http://a:6800, http://b:6800").unwrap();
        assert_eq!(backends[0], BackendConfig::new("a", "http://a:6800"));
        assert_eq!(backends[1], BackendConfig::new("node-2", "http://b:6800"));
        assert!(parse_backend_list("garbage").is_err());
    }

    #[test]
    fn test_intake_url_falls_back_to_ledger() {
        let mut config = one_backend();
        assert_eq!(config.intake_redis_url(), config.ledger.redis_url);
        config.intake.redis_url = Some("redis://queue:6379".to_string());
        assert_eq!(config.intake_redis_url(), "redis://queue:6379");
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidValue {
            field: "x".to_string(),
            reason: "bad".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid value for 'x': bad");
    }
}
