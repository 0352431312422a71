//! Retry decisions with backoff strategies and retry budgets.
//!
//! The policy never sleeps or re-issues anything itself. Callers ask
//! [`RetryPolicy::should_retry`] after a failed attempt and honour the
//! returned delay on their own.

use crate::error::{MeshError, Result};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const HISTORY_CAPACITY: usize = 1000;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Always the base delay.
    Fixed,
    /// base × (attempt + 1)
    Linear,
    /// base × 2^attempt
    #[default]
    Exponential,
    /// base × fib(attempt + 1)
    Fibonacci,
    /// Exponential scaled by a random factor in [0.5, 1.5).
    Jitter,
    /// Retry without waiting.
    #[serde(rename = "none")]
    Immediate,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Fibonacci => "fibonacci",
            RetryStrategy::Jitter => "jitter",
            RetryStrategy::Immediate => "none",
        }
    }

    /// Multiplier applied to the base delay for a 0-based attempt.
    fn factor(&self, attempt: u32) -> f64 {
        match self {
            RetryStrategy::Fixed => 1.0,
            RetryStrategy::Linear => f64::from(attempt) + 1.0,
            RetryStrategy::Exponential => 2f64.powf(f64::from(attempt)),
            RetryStrategy::Fibonacci => fibonacci(attempt.saturating_add(1)),
            RetryStrategy::Jitter => {
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                2f64.powf(f64::from(attempt)) * jitter
            }
            RetryStrategy::Immediate => 0.0,
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(RetryStrategy::Fixed),
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            "fibonacci" => Ok(RetryStrategy::Fibonacci),
            "jitter" => Ok(RetryStrategy::Jitter),
            "none" => Ok(RetryStrategy::Immediate),
            other => Err(MeshError::invalid(format!("unknown retry strategy '{other}'"))),
        }
    }
}

/// fib(1) = fib(2) = 1. Saturates to infinity instead of overflowing.
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (0.0_f64, 1.0_f64);
    for _ in 0..n {
        if a.is_infinite() {
            break;
        }
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts allowed before giving up; attempt numbers are 0-based.
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the backoff strategy.
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the base delay between retries.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay between retries.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Removes the delay ceiling.
    pub fn without_max_delay(mut self) -> Self {
        self.max_delay = None;
        self
    }

    /// Calculates the delay before retrying after a 0-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.max_delay.unwrap_or(Duration::MAX);
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let secs = self.base_delay.as_secs_f64() * self.strategy.factor(attempt);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(Duration::MAX)
            .min(ceiling)
    }
}

/// Why a retry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStopReason {
    MaxAttempts,
    BudgetExhausted,
}

impl RetryStopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStopReason::MaxAttempts => "max_attempts",
            RetryStopReason::BudgetExhausted => "budget_exhausted",
        }
    }
}

impl fmt::Display for RetryStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryDecision {
    pub retry: bool,
    /// The attempt number the retry would run as.
    pub attempt: u32,
    pub delay: Duration,
    pub reason: Option<RetryStopReason>,
}

impl RetryDecision {
    /// Returns the delay to wait, or the matching error when refused.
    pub fn into_result(self, service: &str) -> Result<Duration> {
        match self.reason {
            None => Ok(self.delay),
            Some(RetryStopReason::MaxAttempts) => Err(MeshError::MaxAttemptsReached {
                attempts: self.attempt.saturating_sub(1),
            }),
            Some(RetryStopReason::BudgetExhausted) => Err(MeshError::BudgetExhausted {
                service: service.to_string(),
            }),
        }
    }
}

/// Retry allowance for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryBudget {
    pub max_retries: u32,
    pub consumed: u32,
}

impl RetryBudget {
    pub fn remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.consumed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.consumed >= self.max_retries
    }
}

/// One entry of the decision history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    pub service: String,
    pub attempt: u32,
    pub retry: bool,
    pub delay: Duration,
    pub reason: Option<RetryStopReason>,
}

/// Retry policy that determines when and how to retry.
pub struct RetryPolicy {
    defaults: RetryConfig,
    policies: DashMap<String, RetryConfig>,
    budgets: DashMap<String, RetryBudget>,
    idempotent: DashSet<String>,
    history: Mutex<VecDeque<RetryRecord>>,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given default configuration.
    pub fn new(defaults: RetryConfig) -> Self {
        Self {
            defaults,
            policies: DashMap::new(),
            budgets: DashMap::new(),
            idempotent: DashSet::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Overrides the defaults for one service.
    pub fn set_policy(&self, service: &str, config: RetryConfig) {
        debug!(
            service = %service,
            strategy = %config.strategy,
            max_attempts = config.max_attempts,
            "retry policy set"
        );
        self.policies.insert(service.to_string(), config);
    }

    /// Drops a per-service override. Returns false if there was none.
    pub fn remove_policy(&self, service: &str) -> bool {
        self.policies.remove(service).is_some()
    }

    /// Returns the configuration in force for a service.
    pub fn config_for(&self, service: &str) -> RetryConfig {
        self.policies
            .get(service)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Decides whether a failed 0-based `attempt` should be retried.
    ///
    /// A configured budget is consulted, and charged, before the attempt
    /// limit.
    pub fn should_retry(&self, service: &str, attempt: u32) -> RetryDecision {
        let config = self.config_for(service);
        let next = attempt.saturating_add(1);

        let decision = if !self.try_consume_budget(service) {
            warn!(service = %service, attempt, "retry budget exhausted");
            RetryDecision {
                retry: false,
                attempt: next,
                delay: Duration::ZERO,
                reason: Some(RetryStopReason::BudgetExhausted),
            }
        } else if attempt >= config.max_attempts {
            debug!(service = %service, attempt, max_attempts = config.max_attempts, "retry attempts exhausted");
            RetryDecision {
                retry: false,
                attempt: next,
                delay: Duration::ZERO,
                reason: Some(RetryStopReason::MaxAttempts),
            }
        } else {
            let delay = config.delay_for(attempt);
            debug!(
                service = %service,
                attempt = next,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );
            RetryDecision {
                retry: true,
                attempt: next,
                delay,
                reason: None,
            }
        };

        self.record(service, &decision);
        decision
    }

    /// Returns false when a budget exists and is used up; otherwise charges one unit.
    fn try_consume_budget(&self, service: &str) -> bool {
        match self.budgets.get_mut(service) {
            Some(mut budget) => {
                if budget.is_exhausted() {
                    return false;
                }
                budget.consumed += 1;
                true
            }
            None => true,
        }
    }

    fn record(&self, service: &str, decision: &RetryDecision) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(RetryRecord {
            service: service.to_string(),
            attempt: decision.attempt,
            retry: decision.retry,
            delay: decision.delay,
            reason: decision.reason,
        });
    }

    /// Caps total retries for a service, starting from zero consumed.
    pub fn set_budget(&self, service: &str, max_retries: u32) {
        self.budgets.insert(
            service.to_string(),
            RetryBudget {
                max_retries,
                consumed: 0,
            },
        );
    }

    /// Zeroes the consumed count. Returns false if there is no budget.
    pub fn reset_budget(&self, service: &str) -> bool {
        match self.budgets.get_mut(service) {
            Some(mut budget) => {
                budget.consumed = 0;
                true
            }
            None => false,
        }
    }

    /// Returns the budget for a service, if one is set.
    pub fn budget(&self, service: &str) -> Option<RetryBudget> {
        self.budgets.get(service).map(|b| *b)
    }

    /// Records an idempotency key. Returns false if it was already known.
    pub fn mark_idempotent(&self, key: &str) -> bool {
        self.idempotent.insert(key.to_string())
    }

    pub fn is_idempotent(&self, key: &str) -> bool {
        self.idempotent.contains(key)
    }

    /// Returns past decisions, oldest first, optionally for one service.
    pub fn history(&self, service: Option<&str>) -> Vec<RetryRecord> {
        self.history
            .lock()
            .iter()
            .filter(|r| service.map_or(true, |s| r.service == s))
            .cloned()
            .collect()
    }

    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    pub fn budget_count(&self) -> usize {
        self.budgets.len()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_exponential_delays() {
        let config = RetryConfig::new()
            .with_base_delay(secs(1))
            .without_max_delay();
        assert_eq!(config.delay_for(0), secs(1));
        assert_eq!(config.delay_for(1), secs(2));
        assert_eq!(config.delay_for(2), secs(4));
    }

    #[test]
    fn test_fixed_and_linear_delays() {
        let fixed = RetryConfig::new()
            .with_strategy(RetryStrategy::Fixed)
            .with_base_delay(secs(2));
        assert_eq!(fixed.delay_for(0), secs(2));
        assert_eq!(fixed.delay_for(5), secs(2));

        let linear = RetryConfig::new()
            .with_strategy(RetryStrategy::Linear)
            .with_base_delay(secs(1));
        assert_eq!(linear.delay_for(0), secs(1));
        assert_eq!(linear.delay_for(2), secs(3));
    }

    #[test]
    fn test_fibonacci_delays() {
        let config = RetryConfig::new()
            .with_strategy(RetryStrategy::Fibonacci)
            .with_base_delay(secs(1))
            .without_max_delay();
        let delays: Vec<_> = (0..6).map(|a| config.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn test_jitter_within_bounds() {
        let config = RetryConfig::new()
            .with_strategy(RetryStrategy::Jitter)
            .with_base_delay(Duration::from_millis(100))
            .without_max_delay();
        for _ in 0..50 {
            let delay = config.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(600));
        }
    }

    #[test]
    fn test_immediate_has_no_delay() {
        let config = RetryConfig::new().with_strategy(RetryStrategy::Immediate);
        assert_eq!(config.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let config = RetryConfig::new()
            .with_base_delay(secs(1))
            .with_max_delay(secs(5));
        assert_eq!(config.delay_for(2), secs(4));
        assert_eq!(config.delay_for(3), secs(5));
        assert_eq!(config.delay_for(10), secs(5));
    }

    #[test]
    fn test_delay_monotonic_and_saturating() {
        for strategy in [RetryStrategy::Exponential, RetryStrategy::Linear, RetryStrategy::Fibonacci] {
            let config = RetryConfig::new()
                .with_strategy(strategy)
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(secs(30));
            let mut previous = Duration::ZERO;
            for attempt in [0, 1, 2, 3, 5, 8, 13, 40, 100, 2000, u32::MAX - 1] {
                let delay = config.delay_for(attempt);
                assert!(delay >= previous, "{strategy} attempt {attempt}");
                assert!(delay <= secs(30));
                previous = delay;
            }
            assert_eq!(previous, secs(30));
        }
    }

    #[test]
    fn test_should_retry_until_max_attempts() {
        let policy = RetryPolicy::new(RetryConfig::new().with_max_attempts(2));
        assert!(policy.should_retry("api", 0).retry);
        assert!(policy.should_retry("api", 1).retry);

        let decision = policy.should_retry("api", 2);
        assert!(!decision.retry);
        assert_eq!(decision.reason, Some(RetryStopReason::MaxAttempts));
        assert_eq!(decision.attempt, 3);
        assert!(matches!(
            decision.into_result("api"),
            Err(MeshError::MaxAttemptsReached { attempts: 2 })
        ));
    }

    #[test]
    fn test_service_override() {
        let policy = RetryPolicy::default();
        policy.set_policy(
            "api",
            RetryConfig::new()
                .with_strategy(RetryStrategy::Fixed)
                .with_base_delay(secs(2))
                .with_max_attempts(1),
        );
        assert_eq!(policy.should_retry("api", 0).delay, secs(2));
        assert!(!policy.should_retry("api", 1).retry);
        assert!(policy.should_retry("other", 1).retry);

        assert!(policy.remove_policy("api"));
        assert!(policy.should_retry("api", 1).retry);
    }

    #[test]
    fn test_budget_exhaustion_and_reset() {
        let policy = RetryPolicy::default();
        policy.set_budget("api", 2);

        assert!(policy.should_retry("api", 0).retry);
        assert!(policy.should_retry("api", 0).retry);

        let refused = policy.should_retry("api", 0);
        assert_eq!(refused.reason, Some(RetryStopReason::BudgetExhausted));
        assert_eq!(policy.budget("api").unwrap().remaining(), 0);

        assert!(policy.reset_budget("api"));
        assert!(policy.should_retry("api", 0).retry);
        assert!(!policy.reset_budget("unknown"));
    }

    #[test]
    fn test_budget_checked_before_attempts() {
        let policy = RetryPolicy::new(RetryConfig::new().with_max_attempts(1));
        policy.set_budget("api", 0);
        let decision = policy.should_retry("api", 5);
        assert_eq!(decision.reason, Some(RetryStopReason::BudgetExhausted));
    }

    #[test]
    fn test_idempotency_keys() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_idempotent("order-1"));
        assert!(policy.mark_idempotent("order-1"));
        assert!(!policy.mark_idempotent("order-1"));
        assert!(policy.is_idempotent("order-1"));
    }

    #[test]
    fn test_history_filter() {
        let policy = RetryPolicy::default();
        policy.should_retry("api", 0);
        policy.should_retry("web", 0);
        policy.should_retry("api", 9);

        assert_eq!(policy.history(None).len(), 3);
        let api = policy.history(Some("api"));
        assert_eq!(api.len(), 2);
        assert_eq!(api[1].reason, Some(RetryStopReason::MaxAttempts));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("none".parse::<RetryStrategy>().unwrap(), RetryStrategy::Immediate);
        assert_eq!("fibonacci".parse::<RetryStrategy>().unwrap(), RetryStrategy::Fibonacci);
        assert!("quadratic".parse::<RetryStrategy>().is_err());
    }
}
