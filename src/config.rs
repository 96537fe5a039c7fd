//! Configuration management for Ratekeeper.
//!
//! Configuration is layered: an optional YAML file, then environment
//! variables prefixed with `RATEKEEPER__` (double underscore separates
//! nesting, e.g. `RATEKEEPER__LIMITER__CAPACITY=10`). Anything left unset
//! falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateKeeperError, Result};
use crate::ratelimit::{Algorithm, DEFAULT_MAX_IN_FLIGHT};

/// Main configuration for Ratekeeper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateKeeperConfig {
    /// Limiter selection and parameters
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parameters for the active limiter, tagged by `algorithm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    FixedWindow {
        #[serde(default = "default_fixed_window_ms")]
        window_ms: u64,
        #[serde(default = "default_fixed_window_capacity")]
        capacity: u64,
    },
    SlidingWindowLog {
        #[serde(default = "default_sliding_window_ms")]
        window_ms: u64,
        #[serde(default = "default_sliding_window_limit")]
        limit: usize,
    },
    TokenBucket {
        #[serde(default = "default_token_capacity")]
        capacity: u64,
        #[serde(default = "default_refill_interval_ms")]
        refill_interval_ms: u64,
    },
    LeakyBucket {
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
        #[serde(default = "default_process_interval_ms")]
        process_interval_ms: u64,
        #[serde(default = "default_max_in_flight")]
        max_in_flight: usize,
    },
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::defaults_for(Algorithm::TokenBucket)
    }
}

fn default_fixed_window_ms() -> u64 {
    60_000
}

fn default_fixed_window_capacity() -> u64 {
    3
}

fn default_sliding_window_ms() -> u64 {
    10_000
}

fn default_sliding_window_limit() -> usize {
    3
}

fn default_token_capacity() -> u64 {
    5
}

fn default_refill_interval_ms() -> u64 {
    2_000
}

fn default_queue_capacity() -> usize {
    3
}

fn default_process_interval_ms() -> u64 {
    3_000
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

impl LimiterConfig {
    /// Default parameters for the given algorithm.
    pub fn defaults_for(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::FixedWindow => LimiterConfig::FixedWindow {
                window_ms: default_fixed_window_ms(),
                capacity: default_fixed_window_capacity(),
            },
            Algorithm::SlidingWindowLog => LimiterConfig::SlidingWindowLog {
                window_ms: default_sliding_window_ms(),
                limit: default_sliding_window_limit(),
            },
            Algorithm::TokenBucket => LimiterConfig::TokenBucket {
                capacity: default_token_capacity(),
                refill_interval_ms: default_refill_interval_ms(),
            },
            Algorithm::LeakyBucket => LimiterConfig::LeakyBucket {
                queue_capacity: default_queue_capacity(),
                process_interval_ms: default_process_interval_ms(),
                max_in_flight: default_max_in_flight(),
            },
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            LimiterConfig::FixedWindow { .. } => Algorithm::FixedWindow,
            LimiterConfig::SlidingWindowLog { .. } => Algorithm::SlidingWindowLog,
            LimiterConfig::TokenBucket { .. } => Algorithm::TokenBucket,
            LimiterConfig::LeakyBucket { .. } => Algorithm::LeakyBucket,
        }
    }

    /// The interval that drives this limiter's window, refill or drain.
    pub fn interval(&self) -> Duration {
        let ms = match self {
            LimiterConfig::FixedWindow { window_ms, .. } => *window_ms,
            LimiterConfig::SlidingWindowLog { window_ms, .. } => *window_ms,
            LimiterConfig::TokenBucket {
                refill_interval_ms, ..
            } => *refill_interval_ms,
            LimiterConfig::LeakyBucket {
                process_interval_ms,
                ..
            } => *process_interval_ms,
        };
        Duration::from_millis(ms)
    }

    /// Reject zero capacities and intervals before any limiter is built.
    pub fn validate(&self) -> Result<()> {
        let algorithm = self.algorithm();
        if self.interval().is_zero() {
            return Err(RateKeeperError::Config(format!(
                "{algorithm}: interval must be greater than zero"
            )));
        }

        let (name, value) = match self {
            LimiterConfig::FixedWindow { capacity, .. } => ("capacity", *capacity),
            LimiterConfig::SlidingWindowLog { limit, .. } => ("limit", *limit as u64),
            LimiterConfig::TokenBucket { capacity, .. } => ("capacity", *capacity),
            LimiterConfig::LeakyBucket {
                queue_capacity,
                max_in_flight,
                ..
            } => {
                if *max_in_flight == 0 {
                    return Err(RateKeeperError::Config(format!(
                        "{algorithm}: max_in_flight must be greater than zero"
                    )));
                }
                ("queue_capacity", *queue_capacity as u64)
            }
        };

        if value == 0 {
            return Err(RateKeeperError::Config(format!(
                "{algorithm}: {name} must be greater than zero"
            )));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RateKeeperConfig {
    /// Load configuration from an optional YAML file overlaid with
    /// `RATEKEEPER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // Only the tag is seeded. Per-algorithm fields keep their own serde
        // defaults, so a file that switches algorithm never inherits another
        // algorithm's parameters.
        let mut builder = ::config::Config::builder().set_default(
            "limiter.algorithm",
            LimiterConfig::default().algorithm().as_str(),
        )?;

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("RATEKEEPER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RateKeeperConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateKeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateKeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()
    }
}
