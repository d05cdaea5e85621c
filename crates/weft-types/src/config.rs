//! Configuration types for the dispatch layers and the engine.
//!
//! Layer configurations are structured objects with camelCase fields. They
//! are never applied incrementally: every field that is absent from a
//! supplied object takes its default, not its previous value. `EngineConfig`
//! groups them into the `weft.toml` shape; reading that file is the caller's
//! concern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Number of reissues after the first failure (default 0).
    pub max_retries: i64,
    /// Delay before the first reissue, in milliseconds (default 1000).
    pub initial_delay: i64,
    /// Upper bound on any delay, in milliseconds (default 5000).
    pub max_delay: i64,
    /// Multiplier applied per further reissue (default 1.0).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: 1000,
            max_delay: 5000,
            backoff_factor: 1.0,
        }
    }
}

impl RetryConfig {
    /// Overlay `partial` on the defaults and validate the result. `null`
    /// stands for an empty object.
    pub fn from_json(partial: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self = if partial.is_null() {
            Self::default()
        } else {
            serde_json::from_value(partial.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 0 {
            return Err(ConfigError::Invalid {
                field: "maxRetries",
                reason: format!("must be >= 0, got {}", self.max_retries),
            });
        }
        if self.initial_delay < 0 {
            return Err(ConfigError::Invalid {
                field: "initialDelay",
                reason: format!("must be >= 0, got {}", self.initial_delay),
            });
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::Invalid {
                field: "maxDelay",
                reason: format!(
                    "must be >= initialDelay ({}), got {}",
                    self.initial_delay, self.max_delay
                ),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "backoffFactor",
                reason: format!("must be a positive number, got {}", self.backoff_factor),
            });
        }
        Ok(())
    }

    /// Delay before reissue number `retry` (0-based).
    ///
    /// `initialDelay * backoffFactor^retry`, capped at `maxDelay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.initial_delay as f64 * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

// ---------------------------------------------------------------------------
// ParallelizeConfig
// ---------------------------------------------------------------------------

/// Bound on concurrently dispatched jobs per owning process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ParallelizeConfig {
    /// Maximum jobs in flight (default 1).
    pub max_jobs: i64,
}

impl Default for ParallelizeConfig {
    fn default() -> Self {
        Self { max_jobs: 1 }
    }
}

impl ParallelizeConfig {
    pub fn from_json(partial: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self = if partial.is_null() {
            Self::default()
        } else {
            serde_json::from_value(partial.clone()).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jobs < 1 {
            return Err(ConfigError::Invalid {
                field: "maxJobs",
                reason: format!("must be >= 1, got {}", self.max_jobs),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Monitor settings for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    /// Attach a monitor to new dispatch stacks (default true).
    pub enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Log output for the engine process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TracingConfig {
    /// Filter directives used when `RUST_LOG` is unset (default `"info"`).
    pub filter: String,
    /// Log span close events with their timing (default true).
    pub span_events: bool,
    /// Bridge spans to OpenTelemetry (default false).
    pub otel: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            span_events: true,
            otel: false,
        }
    }
}

/// Top-level engine configuration. All sections have defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub parallelize: ParallelizeConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub tracing: TracingConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.parallelize.validate()?;
        config.retry.validate()?;
        Ok(config)
    }
}
