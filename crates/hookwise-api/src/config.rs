//! Service configuration.

use std::{
    collections::BTreeMap, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookwise_core::Clock;
use hookwise_dispatch::{DeliveryMode, PipelineConfig, RetryPolicy};
use hookwise_ingest::{
    DeliveryCache, SchemaRegistry, SourceAllowlist, Validator, WebhookSecret,
    DEFAULT_MAX_PAYLOAD_BYTES,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "HOOKWISE_";

/// How the HTTP layer hands notifications to the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Validate within the request so the sender learns the outcome.
    #[default]
    Immediate,
    /// Enqueue and acknowledge; validation happens on a worker.
    Queued,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `HOOKWISE_` (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use hookwise_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Listening on {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Server
    /// Server bind address.
    pub host: String,
    /// Server bind port.
    pub port: u16,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,

    // Authentication
    /// Shared secret for `X-Hub-Signature-256` verification.
    ///
    /// Environment variable: `HOOKWISE_WEBHOOK_SECRET`
    pub webhook_secret: Option<String>,
    /// Skips signature verification. Never enable in production.
    pub disable_signature_verification: bool,

    // Delivery cache
    /// How long a delivery id is remembered, in seconds.
    pub delivery_cache_retention_secs: u64,
    /// Interval between cache sweeps in seconds; 0 disables sweeping.
    pub delivery_cache_gc_interval_secs: u64,

    // Workers
    /// Number of concurrent ingest workers.
    pub worker_pool_size: usize,
    /// Capacity of the inbound queue.
    pub queue_capacity: usize,
    /// Budget for graceful shutdown in seconds.
    pub shutdown_timeout_secs: u64,

    // Retry
    /// Retries after the initial dispatch attempt.
    pub max_retry_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub retry_initial_backoff_ms: u64,
    /// Upper bound on any retry delay, in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Multiplier applied per failed attempt.
    pub retry_backoff_factor: f64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    pub retry_jitter_factor: f64,

    // Handlers
    /// Per-handler call timeout in seconds.
    pub handler_timeout_secs: u64,
    /// Registers an event-bus publishing handler per event type at startup.
    pub auto_register_default_handlers: bool,
    /// Event types covered by the default handlers.
    pub default_handler_event_types: Vec<String>,

    // Validation
    /// Largest accepted payload in bytes.
    pub max_payload_bytes: usize,
    /// Checks payloads against per-event schemas.
    pub validate_payload_schemas: bool,
    /// Extra schema files keyed by event type; these replace bundled ones.
    pub webhook_schemas: BTreeMap<String, PathBuf>,
    /// CIDR ranges allowed to deliver webhooks. Empty allows any source.
    pub allowed_source_ranges: Vec<String>,

    // Routing
    /// How accepted events reach handlers.
    pub delivery_mode: DeliveryMode,
    /// How the HTTP layer hands notifications to the pipeline.
    pub ingest_mode: IngestMode,
    /// Releases exhausted delivery ids from the cache so a manual
    /// redelivery is admitted.
    pub forget_exhausted_deliveries: bool,
}

impl Config {
    /// Loads configuration from defaults, `config.toml` and `HOOKWISE_`
    /// environment variables, then validates it.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Layered configuration sources without extraction.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extracts and validates configuration from `figment`.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse server socket address from host and port configuration.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Per-handler call timeout.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// Delivery id retention.
    pub fn delivery_cache_retention(&self) -> Duration {
        Duration::from_secs(self.delivery_cache_retention_secs)
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            backoff_factor: self.retry_backoff_factor,
            jitter: self.retry_jitter_factor,
        }
    }

    /// Convert to pipeline configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            worker_count: self.worker_pool_size,
            queue_capacity: self.queue_capacity,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            delivery_mode: self.delivery_mode,
            retry_policy: self.to_retry_policy(),
            cache_gc_interval: (self.delivery_cache_gc_interval_secs > 0)
                .then(|| Duration::from_secs(self.delivery_cache_gc_interval_secs)),
            release_exhausted_deliveries: self.forget_exhausted_deliveries,
        }
    }

    /// Builds the validator described by this configuration.
    ///
    /// # Errors
    ///
    /// Fails if a schema file cannot be loaded or a source range is invalid.
    pub fn build_validator(
        &self,
        cache: Arc<dyn DeliveryCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Validator> {
        let secret = self.webhook_secret.clone().and_then(WebhookSecret::new);
        let mut validator = Validator::new(secret, cache)
            .with_clock(clock)
            .with_max_payload_bytes(self.max_payload_bytes);

        if self.disable_signature_verification {
            validator = validator.without_signature_verification();
        }

        if self.validate_payload_schemas {
            let mut schemas = SchemaRegistry::with_defaults();
            for (event_type, path) in &self.webhook_schemas {
                schemas
                    .register_file(event_type, path)
                    .with_context(|| format!("Failed to load schema for {event_type}"))?;
            }
            validator = validator.with_schemas(schemas);
        }

        if !self.allowed_source_ranges.is_empty() {
            let allowlist = SourceAllowlist::parse(&self.allowed_source_ranges)
                .context("Invalid allowed_source_ranges")?;
            validator = validator.with_allowlist(allowlist);
        }

        Ok(validator)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.max_payload_bytes == 0 {
            anyhow::bail!("max_payload_bytes must be greater than 0");
        }

        if self.handler_timeout_secs == 0 {
            anyhow::bail!("handler_timeout_secs must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if !(self.retry_backoff_factor >= 1.0 && self.retry_backoff_factor.is_finite()) {
            anyhow::bail!("retry_backoff_factor must be at least 1.0");
        }

        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            anyhow::bail!("retry_initial_backoff_ms cannot exceed retry_max_backoff_ms");
        }

        if let Err(e) = SourceAllowlist::parse(&self.allowed_source_ranges) {
            anyhow::bail!("allowed_source_ranges is invalid: {e}");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            webhook_secret: None,
            disable_signature_verification: false,
            delivery_cache_retention_secs: 24 * 60 * 60,
            delivery_cache_gc_interval_secs: 600,
            worker_pool_size: 4,
            queue_capacity: 100,
            shutdown_timeout_secs: 5,
            max_retry_attempts: 5,
            retry_initial_backoff_ms: 1_000,
            retry_max_backoff_ms: 60 * 60 * 1_000,
            retry_backoff_factor: 2.0,
            retry_jitter_factor: 0.2,
            handler_timeout_secs: 30,
            auto_register_default_handlers: true,
            default_handler_event_types: ["push", "pull_request", "issues", "release"]
                .map(String::from)
                .to_vec(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            validate_payload_schemas: true,
            webhook_schemas: BTreeMap::new(),
            allowed_source_ranges: Vec::new(),
            delivery_mode: DeliveryMode::Reliable,
            ingest_mode: IngestMode::Immediate,
            forget_exhausted_deliveries: false,
        }
    }
}
