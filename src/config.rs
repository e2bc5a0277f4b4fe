//! Configuration management for Turnstile.
//!
//! Settings are layered: built-in defaults, then an optional config file
//! (YAML, TOML or JSON, picked by extension), then `TURNSTILE__`-prefixed
//! environment variables such as `TURNSTILE__LIMITER__CAPACITY=20`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::Limits;

const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Token bucket configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Per-account quota configuration
    #[serde(default)]
    pub quotas: QuotaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upper bound on the time spent serving one request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_request_timeout() -> u64 {
    30
}

/// Token bucket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Bucket size, i.e. the largest burst admitted at once
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Sustained admission rate
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,

    /// Buckets untouched for this long are evicted
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// How often the background sweeper looks for idle buckets
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate_per_second: default_refill_rate(),
            idle_ttl_secs: default_idle_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_capacity() -> u64 {
    10
}

fn default_refill_rate() -> f64 {
    5.0
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

impl LimiterConfig {
    /// The bucket limits described by this configuration.
    pub fn limits(&self) -> Limits {
        Limits::new(self.capacity, self.refill_rate_per_second)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.limits().validate()?;
        if self.idle_ttl_secs == 0 {
            return Err(TurnstileError::Config(
                "idle_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-account quota configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Path to the quota rules file; quotas are disabled when unset
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// How long a fetched quota stays fresh
    #[serde(default = "default_refresh_period")]
    pub refresh_period_secs: u64,

    /// Limits used while a key's quota is unknown; defaults to the limiter's limits
    #[serde(default)]
    pub failsafe: Option<Limits>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            refresh_period_secs: default_refresh_period(),
            failsafe: None,
        }
    }
}

fn default_refresh_period() -> u64 {
    60
}

impl QuotaConfig {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_period_secs == 0 {
            return Err(TurnstileError::Config(
                "quotas.refresh_period_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(failsafe) = &self.failsafe {
            failsafe.validate()?;
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        Self::finish(settings)
    }

    /// Like [`load`](Self::load), reading overrides from `env` instead of the
    /// process environment when given.
    fn load_with_env(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(TurnstileError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let settings = builder
            .build()
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        Self::finish(settings)
    }

    fn finish(settings: Config) -> Result<Self> {
        let config: TurnstileConfig = settings
            .try_deserialize()
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.request_timeout_secs == 0 {
            return Err(TurnstileError::Config(
                "server.request_timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.limiter.validate()?;
        self.quotas.validate()
    }

    /// Limits handed out before a key's quota is known.
    pub fn failsafe_limits(&self) -> Limits {
        self.quotas.failsafe.unwrap_or_else(|| self.limiter.limits())
    }
}
