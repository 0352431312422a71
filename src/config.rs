//! Configuration for the mesh core.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::deadline::{TimeoutConfig, MAX_TIMEOUT};
use crate::error::MeshError;
use crate::load_balancer::LoadBalancingPolicy;
use crate::retry::{RetryConfig, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const MAX_TIMEOUT_MS: u64 = MAX_TIMEOUT.as_millis() as u64;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An environment variable or field could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// Threshold that would disable the state machine.
    #[error("invalid threshold: {reason}")]
    InvalidThreshold { reason: String },

    /// Seeded service entry is unusable.
    #[error("invalid service seed '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    /// Configuration text could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration file could not be read.
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
}

impl From<ConfigError> for MeshError {
    fn from(err: ConfigError) -> Self {
        MeshError::InvalidConfig(err.to_string())
    }
}

/// One instance to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSeed {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Overrides the registry-wide TTL for this instance.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// A service and its initial instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSeed {
    pub name: String,
    #[serde(default)]
    pub instances: Vec<InstanceSeed>,
}

/// Mesh configuration loaded at startup.
///
/// # Environment Variables
///
/// * `MESH_ENABLED` - Whether routing is active (default: true)
/// * `MESH_DEFAULT_TIMEOUT_MS` - Request timeout in milliseconds (default: 30000)
/// * `MESH_CIRCUIT_FAILURE_THRESHOLD` - Failures before a circuit opens (default: 5)
/// * `MESH_CIRCUIT_RECOVERY_TIMEOUT_MS` - Open to half-open delay (default: 30000)
/// * `MESH_RETRY_MAX_ATTEMPTS` - Attempts before giving up (default: 3)
/// * `MESH_RETRY_STRATEGY` - fixed, linear, exponential, fibonacci, jitter or none (default: exponential)
/// * `MESH_RETRY_BASE_DELAY_MS` - Base retry delay (default: 100)
/// * `MESH_RETRY_MAX_DELAY_MS` - Retry delay ceiling, 0 for none (default: 10000)
/// * `MESH_LB_ALGORITHM` - Load balancing algorithm (default: round_robin)
/// * `MESH_INSTANCE_TTL_MS` - Heartbeat TTL, 0 for never (default: 0)
/// * `MESH_PROXY_ID` - Sidecar id stamped on traffic (default: "default")
/// * `MESH_SWEEP_INTERVAL_MS` - Expired instance sweep period (default: 5000)
///
/// # Example
///
/// ```
/// use servicemesh_core::config::MeshConfig;
///
/// let config = MeshConfig::from_toml("retry_strategy = \"linear\"").unwrap();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub enabled: bool,
    pub default_timeout_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_timeout_ms: u64,
    pub circuit_success_threshold: u32,
    pub retry_max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    pub retry_base_delay_ms: u64,
    /// 0 disables the ceiling.
    pub retry_max_delay_ms: u64,
    pub lb_algorithm: LoadBalancingPolicy,
    /// 0 means instances never expire.
    pub instance_ttl_ms: u64,
    pub proxy_id: String,
    pub sweep_interval_ms: u64,
    /// Services registered by [`MeshGateway::initialize`](crate::gateway::MeshGateway::initialize).
    pub services: Vec<ServiceSeed>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout_ms: 30_000,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout_ms: 30_000,
            circuit_success_threshold: 1,
            retry_max_attempts: 3,
            retry_strategy: RetryStrategy::Exponential,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            lb_algorithm: LoadBalancingPolicy::RoundRobin,
            instance_ttl_ms: 0,
            proxy_id: "default".to_string(),
            sweep_interval_ms: 5_000,
            services: Vec::new(),
        }
    }
}

fn parse_var<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}

impl MeshConfig {
    /// Loads configuration from `MESH_*` environment variables with fallback
    /// to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from environment variables and validates it.
    pub fn from_env_validated() -> Result<Self, ConfigError> {
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            enabled: parse_var("MESH_ENABLED", var("MESH_ENABLED"), defaults.enabled)?,
            default_timeout_ms: parse_var(
                "MESH_DEFAULT_TIMEOUT_MS",
                var("MESH_DEFAULT_TIMEOUT_MS"),
                defaults.default_timeout_ms,
            )?,
            circuit_failure_threshold: parse_var(
                "MESH_CIRCUIT_FAILURE_THRESHOLD",
                var("MESH_CIRCUIT_FAILURE_THRESHOLD"),
                defaults.circuit_failure_threshold,
            )?,
            circuit_recovery_timeout_ms: parse_var(
                "MESH_CIRCUIT_RECOVERY_TIMEOUT_MS",
                var("MESH_CIRCUIT_RECOVERY_TIMEOUT_MS"),
                defaults.circuit_recovery_timeout_ms,
            )?,
            circuit_success_threshold: defaults.circuit_success_threshold,
            retry_max_attempts: parse_var(
                "MESH_RETRY_MAX_ATTEMPTS",
                var("MESH_RETRY_MAX_ATTEMPTS"),
                defaults.retry_max_attempts,
            )?,
            retry_strategy: parse_var(
                "MESH_RETRY_STRATEGY",
                var("MESH_RETRY_STRATEGY"),
                defaults.retry_strategy,
            )?,
            retry_base_delay_ms: parse_var(
                "MESH_RETRY_BASE_DELAY_MS",
                var("MESH_RETRY_BASE_DELAY_MS"),
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: parse_var(
                "MESH_RETRY_MAX_DELAY_MS",
                var("MESH_RETRY_MAX_DELAY_MS"),
                defaults.retry_max_delay_ms,
            )?,
            lb_algorithm: parse_var(
                "MESH_LB_ALGORITHM",
                var("MESH_LB_ALGORITHM"),
                defaults.lb_algorithm,
            )?,
            instance_ttl_ms: parse_var(
                "MESH_INSTANCE_TTL_MS",
                var("MESH_INSTANCE_TTL_MS"),
                defaults.instance_ttl_ms,
            )?,
            proxy_id: var("MESH_PROXY_ID").unwrap_or(defaults.proxy_id),
            sweep_interval_ms: parse_var(
                "MESH_SWEEP_INTERVAL_MS",
                var("MESH_SWEEP_INTERVAL_MS"),
                defaults.sweep_interval_ms,
            )?,
            services: Vec::new(),
        })
    }

    /// Parses TOML; missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parses JSON; missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reads a file, choosing the format by extension (`.json`, otherwise TOML).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_toml(&text),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The default timeout is zero or longer than an hour
    /// - A circuit threshold is zero
    /// - The proxy id is empty or the sweep interval is zero
    /// - A seeded service has no name or an instance without host or port
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        if self.default_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidTimeout {
                reason: "timeout must not exceed 1 hour".to_string(),
            });
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidTimeout {
                reason: "sweep interval must be greater than zero".to_string(),
            });
        }

        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                reason: "circuit failure threshold must be at least 1".to_string(),
            });
        }
        if self.circuit_success_threshold == 0 {
            return Err(ConfigError::InvalidThreshold {
                reason: "circuit success threshold must be at least 1".to_string(),
            });
        }

        if self.proxy_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "proxy_id".to_string(),
                value: self.proxy_id.clone(),
                reason: "must not be empty".to_string(),
            });
        }

        for service in &self.services {
            if service.name.is_empty() {
                return Err(ConfigError::InvalidService {
                    service: service.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            for instance in &service.instances {
                if instance.host.is_empty() || instance.port == 0 {
                    return Err(ConfigError::InvalidService {
                        service: service.name.clone(),
                        reason: format!(
                            "instance '{}:{}' needs a host and a non-zero port",
                            instance.host, instance.port
                        ),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn instance_ttl(&self) -> Duration {
        Duration::from_millis(self.instance_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: Duration::from_millis(self.circuit_recovery_timeout_ms),
            success_threshold: self.circuit_success_threshold,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let config = RetryConfig::new()
            .with_max_attempts(self.retry_max_attempts)
            .with_strategy(self.retry_strategy)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms));
        match self.retry_max_delay_ms {
            0 => config.without_max_delay(),
            ms => config.with_max_delay(Duration::from_millis(ms)),
        }
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig::default().with_request(self.default_timeout())
    }
}
