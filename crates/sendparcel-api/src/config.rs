//! Configuration for the shipping callback service.

use std::{collections::HashMap, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use sendparcel_retry::{RetryPolicy, SweepConfig, WorkerConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Default header carrying a provider's payload signature.
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-signature";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Providers are configured per slug, either in `config.toml`:
///
/// ```toml
/// [providers.inpost]
/// signing_secret = "..."
/// ```
///
/// or through nested environment variables such as
/// `PROVIDERS__INPOST__SIGNING_SECRET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Retry
    /// Whether transiently failed callbacks are queued for retry.
    ///
    /// Environment variable: `RETRY_ENABLED`
    #[serde(default = "default_retry_enabled", alias = "RETRY_ENABLED")]
    pub retry_enabled: bool,
    /// Attempts before a queued callback is exhausted.
    ///
    /// Environment variable: `RETRY_MAX_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: u32,
    /// Base delay for exponential backoff in seconds.
    ///
    /// Environment variable: `RETRY_BACKOFF_SECONDS`
    #[serde(default = "default_backoff_seconds", alias = "RETRY_BACKOFF_SECONDS")]
    pub retry_backoff_seconds: u64,

    // Sweep
    /// Pause between sweep passes in seconds.
    ///
    /// Environment variable: `SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_sweep_interval", alias = "SWEEP_INTERVAL_SECONDS")]
    pub sweep_interval_seconds: u64,
    /// Records claimed per sweep pass.
    ///
    /// Environment variable: `SWEEP_BATCH_SIZE`
    #[serde(default = "default_sweep_batch_size", alias = "SWEEP_BATCH_SIZE")]
    pub sweep_batch_size: usize,
    /// Lease on a claimed record in seconds.
    ///
    /// Environment variable: `CLAIM_TIMEOUT_SECONDS`
    #[serde(default = "default_claim_timeout", alias = "CLAIM_TIMEOUT_SECONDS")]
    pub claim_timeout_seconds: u64,
    /// Whether replays re-run provider signature verification.
    ///
    /// Environment variable: `VERIFY_ON_REPLAY`
    #[serde(default = "default_verify_on_replay", alias = "VERIFY_ON_REPLAY")]
    pub verify_on_replay: bool,

    // Providers
    /// Provider integrations keyed by slug.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Provider used when a create-shipment request names none.
    ///
    /// Environment variable: `DEFAULT_PROVIDER`
    #[serde(default, alias = "DEFAULT_PROVIDER")]
    pub default_provider: Option<String>,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

/// Settings for one signed-callback provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Shared secret the provider signs callbacks with.
    pub signing_secret: String,
    /// Header carrying the signature.
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("").split("__")),
        )
    }

    /// Extracts and validates configuration from an explicit figment.
    ///
    /// # Errors
    ///
    /// Returns error if extraction fails or a value is invalid.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Retry policy for the dispatcher and sweep.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.retry_enabled,
            max_attempts: self.retry_max_attempts,
            backoff_seconds: self.retry_backoff_seconds,
        }
    }

    /// Per-pass sweep configuration.
    pub fn to_sweep_config(&self) -> SweepConfig {
        SweepConfig {
            batch_size: self.sweep_batch_size,
            claim_timeout: Duration::from_secs(self.claim_timeout_seconds),
            verify_on_replay: self.verify_on_replay,
        }
    }

    /// Sweep worker scheduling.
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            interval: Duration::from_secs(self.sweep_interval_seconds),
            shutdown_timeout: Duration::from_secs(self.request_timeout),
        }
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be greater than 0");
        }

        if self.retry_backoff_seconds == 0 {
            anyhow::bail!("retry_backoff_seconds must be greater than 0");
        }

        if self.sweep_interval_seconds == 0 {
            anyhow::bail!("sweep_interval_seconds must be greater than 0");
        }

        if self.sweep_batch_size == 0 {
            anyhow::bail!("sweep_batch_size must be greater than 0");
        }

        if self.claim_timeout_seconds == 0 {
            anyhow::bail!("claim_timeout_seconds must be greater than 0");
        }

        for (slug, provider) in &self.providers {
            if provider.signing_secret.is_empty() {
                anyhow::bail!("provider '{slug}' has an empty signing_secret");
            }
            if provider.signature_header.is_empty() {
                anyhow::bail!("provider '{slug}' has an empty signature_header");
            }
        }

        if self.default_provider.as_deref() == Some("") {
            anyhow::bail!("default_provider cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            retry_enabled: default_retry_enabled(),
            retry_max_attempts: default_max_attempts(),
            retry_backoff_seconds: default_backoff_seconds(),
            sweep_interval_seconds: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            claim_timeout_seconds: default_claim_timeout(),
            verify_on_replay: default_verify_on_replay(),
            providers: HashMap::new(),
            default_provider: None,
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/sendparcel".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_seconds() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_sweep_batch_size() -> usize {
    100
}

fn default_claim_timeout() -> u64 {
    300
}

fn default_verify_on_replay() -> bool {
    true
}

fn default_signature_header() -> String {
    DEFAULT_SIGNATURE_HEADER.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
