//! Per-service circuit breakers.
//!
//! Each service gets its own state machine:
//! - **Closed**: normal operation, requests flow through
//! - **Open**: too many failures, reject requests until the recovery timeout
//! - **HalfOpen**: recovery mode, probe requests decide whether to close
//!
//! Administrators can additionally pin a circuit open or closed, or disable
//! it so outcomes are counted but never change the state.

use crate::clock::{self, SharedClock};
use crate::error::{MeshError, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    #[default]
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the service recovered
    HalfOpen,
    /// Pinned open by an operator
    ForcedOpen,
    /// Pinned closed by an operator
    ForcedClosed,
    /// Outcomes are ignored
    Disabled,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
            CircuitState::ForcedOpen => "forced_open",
            CircuitState::ForcedClosed => "forced_closed",
            CircuitState::Disabled => "disabled",
        }
    }

    /// Returns true while requests are being rejected.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open | CircuitState::ForcedOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub recovery_timeout: Duration,
    /// Number of successful probes in HalfOpen before closing
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Rejects thresholds that would make the state machine meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(MeshError::invalid("circuit failure threshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(MeshError::invalid("circuit success threshold must be at least 1"));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

/// Degraded response producer used while a circuit is open.
pub type Fallback = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    times_opened: u64,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
}

impl Circuit {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            config,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            times_opened: 0,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.times_opened += 1;
    }
}

/// Lifetime counters for one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    pub service: String,
    pub state: CircuitState,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub times_opened: u64,
}

/// Circuit breakers keyed by service name.
///
/// # Example
///
/// ```
/// use servicemesh_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(1));
/// assert!(cb.can_execute("api"));
/// assert_eq!(cb.record_failure("api"), CircuitState::Open);
/// assert!(!cb.can_execute("api"));
/// ```
pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    overrides: DashMap<String, CircuitBreakerConfig>,
    fallbacks: DashMap<String, Fallback>,
    default_config: CircuitBreakerConfig,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Creates a breaker set using the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, clock::system())
    }

    /// Creates a breaker set reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            circuits: DashMap::new(),
            overrides: DashMap::new(),
            fallbacks: DashMap::new(),
            default_config: config,
            clock,
        }
    }

    /// Overrides thresholds for one service.
    pub fn configure(&self, service: &str, config: CircuitBreakerConfig) -> Result<()> {
        config.validate()?;
        if let Some(mut circuit) = self.circuits.get_mut(service) {
            circuit.config = config.clone();
        }
        self.overrides.insert(service.to_string(), config);
        Ok(())
    }

    fn config_for(&self, service: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(service)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn circuit_mut(&self, service: &str) -> dashmap::mapref::one::RefMut<'_, String, Circuit> {
        let config = self.config_for(service);
        self.circuits
            .entry(service.to_string())
            .or_insert_with(|| Circuit::new(config))
    }

    /// Checks if a request to `service` should be allowed through.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits the caller.
    pub fn can_execute(&self, service: &str) -> bool {
        let Some(mut circuit) = self.circuits.get_mut(service) else {
            return true;
        };

        match circuit.state {
            CircuitState::Closed
            | CircuitState::HalfOpen
            | CircuitState::ForcedClosed
            | CircuitState::Disabled => true,
            CircuitState::ForcedOpen => false,
            CircuitState::Open => {
                let now = self.clock.now();
                let ready = circuit
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened) >= circuit.config.recovery_timeout)
                    .unwrap_or(true);
                if ready {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.consecutive_successes = 0;
                    info!(service = %service, "circuit breaker half-open");
                }
                ready
            }
        }
    }

    /// Records a successful call and returns the resulting state.
    pub fn record_success(&self, service: &str) -> CircuitState {
        let mut circuit = self.circuit_mut(service);
        circuit.total_calls += 1;
        circuit.total_successes += 1;

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= circuit.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.consecutive_failures = 0;
                    circuit.consecutive_successes = 0;
                    circuit.opened_at = None;
                    info!(service = %service, "circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            CircuitState::Open
            | CircuitState::ForcedOpen
            | CircuitState::ForcedClosed
            | CircuitState::Disabled => {}
        }
        circuit.state
    }

    /// Records a failed call and returns the resulting state.
    pub fn record_failure(&self, service: &str) -> CircuitState {
        let now = self.clock.now();
        let mut circuit = self.circuit_mut(service);
        circuit.total_calls += 1;
        circuit.total_failures += 1;

        match circuit.state {
            CircuitState::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= circuit.config.failure_threshold {
                    circuit.trip(now);
                    warn!(
                        service = %service,
                        failures = circuit.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.consecutive_failures += 1;
                circuit.trip(now);
                warn!(service = %service, "circuit breaker reopened from half-open");
            }
            CircuitState::Open => {
                circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            }
            CircuitState::ForcedOpen | CircuitState::ForcedClosed | CircuitState::Disabled => {}
        }
        circuit.state
    }

    /// Pins the circuit open until [`reset`](Self::reset).
    pub fn force_open(&self, service: &str) {
        let now = self.clock.now();
        let mut circuit = self.circuit_mut(service);
        circuit.state = CircuitState::ForcedOpen;
        circuit.opened_at = Some(now);
        info!(service = %service, "circuit breaker forced open");
    }

    /// Pins the circuit closed until [`reset`](Self::reset).
    pub fn force_close(&self, service: &str) {
        let mut circuit = self.circuit_mut(service);
        circuit.state = CircuitState::ForcedClosed;
        circuit.opened_at = None;
        info!(service = %service, "circuit breaker forced closed");
    }

    /// Stops the circuit from reacting to outcomes.
    pub fn disable(&self, service: &str) {
        self.circuit_mut(service).state = CircuitState::Disabled;
        info!(service = %service, "circuit breaker disabled");
    }

    /// Deletes the circuit; the service is implicitly closed again.
    ///
    /// Returns false when the service had no circuit.
    pub fn reset(&self, service: &str) -> bool {
        let removed = self.circuits.remove(service).is_some();
        if removed {
            debug!(service = %service, "circuit breaker reset");
        }
        removed
    }

    /// Returns the current state; unknown services are closed.
    pub fn get_state(&self, service: &str) -> CircuitState {
        self.circuits
            .get(service)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    /// Registers a degraded response for an open circuit.
    pub fn set_fallback<F>(&self, service: &str, fallback: F)
    where
        F: Fn() -> serde_json::Value + Send + Sync + 'static,
    {
        self.fallbacks.insert(service.to_string(), Arc::new(fallback));
    }

    /// Produces the fallback response, if one is registered.
    pub fn get_fallback(&self, service: &str) -> Option<serde_json::Value> {
        // Clone the handle so the shard lock is released before user code runs.
        let fallback = self.fallbacks.get(service).map(|f| Arc::clone(f.value()))?;
        Some(fallback())
    }

    /// Returns lifetime counters for a service.
    pub fn get_metrics(&self, service: &str) -> Option<CircuitMetrics> {
        self.circuits.get(service).map(|c| CircuitMetrics {
            service: service.to_string(),
            state: c.state,
            total_calls: c.total_calls,
            total_successes: c.total_successes,
            total_failures: c.total_failures,
            consecutive_failures: c.consecutive_failures,
            times_opened: c.times_opened,
        })
    }

    /// Returns the number of tracked circuits.
    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }

    /// Returns the number of circuits currently rejecting requests.
    pub fn open_count(&self) -> usize {
        self.circuits.iter().filter(|c| c.state.is_open()).count()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
