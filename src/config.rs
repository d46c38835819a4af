//! Engine and server configuration
//!
//! Every setting has a default and can be overridden from `VIGIL_*`
//! environment variables. Malformed values fall back to the default.

use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::RetryPolicy;

/// Evaluation engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the scheduler checks for due rules
    pub tick_resolution: Duration,
    /// Maximum evaluations running at once
    pub max_concurrency: usize,
    /// Deadline for one telemetry query attempt
    pub query_timeout: Duration,
    /// Telemetry attempts per evaluation, including the first
    pub max_query_attempts: u32,
    pub retry_base_delay: Duration,
    /// How long shutdown waits for in-flight evaluations
    pub shutdown_grace: Duration,
    /// How long a dispatched transition is remembered for dedup
    pub dedup_ttl: Duration,
    /// Rule state checkpoint file; checkpointing is off when unset
    pub checkpoint_path: Option<PathBuf>,
    pub checkpoint_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_resolution: Duration::from_millis(250),
            max_concurrency: num_cpus::get() * 4,
            query_timeout: Duration::from_secs(30),
            max_query_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(10),
            dedup_ttl: Duration::from_secs(24 * 60 * 60),
            checkpoint_path: None,
            checkpoint_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `VIGIL_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            tick_resolution: env_parse("VIGIL_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_resolution),
            max_concurrency: env_parse("VIGIL_MAX_CONCURRENCY").unwrap_or(defaults.max_concurrency),
            query_timeout: env_parse("VIGIL_QUERY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.query_timeout),
            max_query_attempts: env_parse("VIGIL_QUERY_ATTEMPTS")
                .unwrap_or(defaults.max_query_attempts),
            retry_base_delay: env_parse("VIGIL_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            shutdown_grace: env_parse("VIGIL_SHUTDOWN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            dedup_ttl: env_parse("VIGIL_DEDUP_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
            checkpoint_path: std::env::var("VIGIL_CHECKPOINT_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            checkpoint_interval: env_parse("VIGIL_CHECKPOINT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.checkpoint_interval),
        }
        .sanitized()
    }

    pub fn with_tick_resolution(mut self, tick: Duration) -> Self {
        self.tick_resolution = tick;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn with_max_query_attempts(mut self, attempts: u32) -> Self {
        self.max_query_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>, interval: Duration) -> Self {
        self.checkpoint_path = Some(path.into());
        self.checkpoint_interval = interval;
        self
    }

    /// Retry policy for telemetry queries
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_query_attempts.max(1),
            base_delay: self.retry_base_delay,
            attempt_timeout: self.query_timeout,
            ..RetryPolicy::default()
        }
    }

    /// Replace zero values that would stall the engine
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.tick_resolution.is_zero() {
            self.tick_resolution = defaults.tick_resolution;
        }
        if self.max_concurrency == 0 {
            self.max_concurrency = defaults.max_concurrency;
        }
        if self.query_timeout.is_zero() {
            self.query_timeout = defaults.query_timeout;
        }
        if self.checkpoint_interval.is_zero() {
            self.checkpoint_interval = defaults.checkpoint_interval;
        }
        self
    }
}

/// A webhook channel declared in configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub id: String,
    pub url: String,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the telemetry backend
    pub telemetry_url: String,
    pub webhooks: Vec<WebhookConfig>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            telemetry_url: "http://127.0.0.1:8080".to_string(),
            webhooks: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: std::env::var("VIGIL_HOST").unwrap_or(defaults.host),
            port: env_parse("VIGIL_PORT").unwrap_or(defaults.port),
            telemetry_url: std::env::var("VIGIL_TELEMETRY_URL").unwrap_or(defaults.telemetry_url),
            webhooks: std::env::var("VIGIL_WEBHOOKS")
                .map(|s| parse_webhooks(&s))
                .unwrap_or_default(),
            engine: EngineConfig::from_env(),
        }
    }
}

/// Parse `id=url` pairs separated by commas; malformed entries are skipped
pub fn parse_webhooks(s: &str) -> Vec<WebhookConfig> {
    s.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| {
            let Some((id, url)) = entry.split_once('=') else {
                tracing::warn!(entry = %entry.trim(), "Ignoring webhook without an id; expected id=url");
                return None;
            };
            let (id, url) = (id.trim(), url.trim());
            if id.is_empty() || url.is_empty() {
                tracing::warn!(entry = %entry.trim(), "Ignoring incomplete webhook entry");
                return None;
            }
            Some(WebhookConfig {
                id: id.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
