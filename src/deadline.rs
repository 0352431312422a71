//! Request deadlines, deadline propagation and per-service time budgets.
//!
//! Nothing here owns a timer. Callers poll [`DeadlineManager::check_timeout`]
//! and cancel work themselves.

use crate::clock::{self, SharedClock};
use crate::error::{MeshError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 1000;

/// Longest accepted timeout of any kind.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Timeouts for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub request: Duration,
    pub idle: Duration,
}

impl TimeoutConfig {
    pub fn with_connect(mut self, timeout: Duration) -> Self {
        self.connect = timeout;
        self
    }

    pub fn with_request(mut self, timeout: Duration) -> Self {
        self.request = timeout;
        self
    }

    pub fn with_idle(mut self, timeout: Duration) -> Self {
        self.idle = timeout;
        self
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            request: Duration::from_secs(30),
            idle: Duration::from_secs(60),
        }
    }
}

/// Returned when a deadline is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineTicket {
    pub request_id: String,
    pub service: String,
    pub deadline: Instant,
    pub remaining: Duration,
}

/// Result of polling a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeoutCheck {
    pub timed_out: bool,
    pub remaining: Duration,
    /// How far past the deadline `now` is; zero while in time.
    pub overrun: Duration,
}

impl TimeoutCheck {
    /// Returns the remaining time, or [`MeshError::TimedOut`].
    pub fn into_result(self, request_id: &str) -> Result<Duration> {
        if self.timed_out {
            Err(MeshError::TimedOut {
                request_id: request_id.to_string(),
                overrun: self.overrun,
            })
        } else {
            Ok(self.remaining)
        }
    }
}

/// State of a service's cumulative time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub ceiling: Duration,
    pub consumed: Duration,
    pub remaining: Duration,
    pub exhausted: bool,
}

/// A recorded deadline overrun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeoutEvent {
    pub request_id: String,
    pub service: String,
    pub overrun: Duration,
}

#[derive(Debug, Clone)]
struct DeadlineEntry {
    service: String,
    deadline: Instant,
    started_at: Instant,
    timed_out: bool,
}

#[derive(Debug, Clone, Copy)]
struct TimeBudget {
    ceiling: Duration,
    consumed: Duration,
}

impl TimeBudget {
    fn status(&self) -> BudgetStatus {
        BudgetStatus {
            ceiling: self.ceiling,
            consumed: self.consumed,
            remaining: self.ceiling.saturating_sub(self.consumed),
            exhausted: self.consumed >= self.ceiling,
        }
    }
}

/// Tracks in-flight request deadlines.
pub struct DeadlineManager {
    defaults: TimeoutConfig,
    timeouts: DashMap<String, TimeoutConfig>,
    entries: DashMap<String, DeadlineEntry>,
    budgets: DashMap<String, TimeBudget>,
    timeout_count: AtomicU64,
    events: Mutex<VecDeque<TimeoutEvent>>,
    clock: SharedClock,
}

impl DeadlineManager {
    pub fn new(defaults: TimeoutConfig) -> Self {
        Self::with_clock(defaults, clock::system())
    }

    pub fn with_clock(defaults: TimeoutConfig, clock: SharedClock) -> Self {
        Self {
            defaults,
            timeouts: DashMap::new(),
            entries: DashMap::new(),
            budgets: DashMap::new(),
            timeout_count: AtomicU64::new(0),
            events: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    /// Overrides the timeouts of one service.
    ///
    /// Each timeout must be non-zero and at most [`MAX_TIMEOUT`].
    pub fn set_timeout(&self, service: &str, config: TimeoutConfig) -> Result<()> {
        for (name, value) in [
            ("connect", config.connect),
            ("request", config.request),
            ("idle", config.idle),
        ] {
            if value.is_zero() || value > MAX_TIMEOUT {
                return Err(MeshError::invalid(format!(
                    "{name} timeout for {service} must be between 1ms and {}s, got {value:?}",
                    MAX_TIMEOUT.as_secs()
                )));
            }
        }
        self.timeouts.insert(service.to_string(), config);
        Ok(())
    }

    /// Returns the service's timeouts, or the defaults.
    pub fn get_timeout(&self, service: &str) -> TimeoutConfig {
        self.timeouts.get(service).map(|c| *c).unwrap_or(self.defaults)
    }

    /// Registers a request. Without an explicit deadline the service's
    /// request timeout applies from now.
    pub fn start_request(
        &self,
        request_id: &str,
        service: &str,
        deadline: Option<Instant>,
    ) -> DeadlineTicket {
        let now = self.clock.now();
        let deadline = deadline.unwrap_or_else(|| deadline_after(now, self.get_timeout(service).request));
        self.insert(request_id, service, now, deadline)
    }

    fn insert(&self, request_id: &str, service: &str, now: Instant, deadline: Instant) -> DeadlineTicket {
        self.entries.insert(
            request_id.to_string(),
            DeadlineEntry {
                service: service.to_string(),
                deadline,
                started_at: now,
                timed_out: false,
            },
        );

        let remaining = deadline.saturating_duration_since(now);
        debug!(
            request_id = %request_id,
            service = %service,
            remaining_ms = remaining.as_millis() as u64,
            "deadline started"
        );
        DeadlineTicket {
            request_id: request_id.to_string(),
            service: service.to_string(),
            deadline,
            remaining,
        }
    }

    /// Polls a deadline. `None` for unknown requests.
    ///
    /// The first poll past the deadline is recorded as a timeout.
    pub fn check_timeout(&self, request_id: &str) -> Option<TimeoutCheck> {
        let now = self.clock.now();
        let mut entry = self.entries.get_mut(request_id)?;

        if now <= entry.deadline {
            return Some(TimeoutCheck {
                timed_out: false,
                remaining: entry.deadline - now,
                overrun: Duration::ZERO,
            });
        }

        let overrun = now - entry.deadline;
        if !entry.timed_out {
            entry.timed_out = true;
            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                request_id = %request_id,
                service = %entry.service,
                overrun_ms = overrun.as_millis() as u64,
                "request deadline exceeded"
            );

            let mut events = self.events.lock();
            if events.len() == EVENT_CAPACITY {
                events.pop_front();
            }
            events.push_back(TimeoutEvent {
                request_id: request_id.to_string(),
                service: entry.service.clone(),
                overrun,
            });
        }

        Some(TimeoutCheck {
            timed_out: true,
            remaining: Duration::ZERO,
            overrun,
        })
    }

    /// Removes a request and returns how long it was tracked.
    pub fn end_request(&self, request_id: &str) -> Option<Duration> {
        let (_, entry) = self.entries.remove(request_id)?;
        Some(self.clock.now().saturating_duration_since(entry.started_at))
    }

    /// Returns the time left for a request without recording anything.
    pub fn remaining(&self, request_id: &str) -> Result<Duration> {
        let now = self.clock.now();
        self.entries
            .get(request_id)
            .map(|e| e.deadline.saturating_duration_since(now))
            .ok_or_else(|| MeshError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }

    /// Registers `child_id` with a deadline no later than its parent's.
    ///
    /// An unknown parent leaves the child with only its own service timeout.
    pub fn propagate_deadline(&self, parent_id: &str, child_id: &str, service: &str) -> DeadlineTicket {
        let now = self.clock.now();
        let own = deadline_after(now, self.get_timeout(service).request);
        let deadline = match self.entries.get(parent_id).map(|p| p.deadline) {
            Some(parent) => parent.min(own),
            None => own,
        };
        self.insert(child_id, service, now, deadline)
    }

    /// Sets a cumulative time ceiling for a service, starting from zero consumed.
    pub fn set_budget(&self, service: &str, ceiling: Duration) {
        self.budgets.insert(
            service.to_string(),
            TimeBudget {
                ceiling,
                consumed: Duration::ZERO,
            },
        );
    }

    /// Charges `amount` against a service budget. `None` when no budget is set.
    pub fn consume_budget(&self, service: &str, amount: Duration) -> Option<BudgetStatus> {
        let mut budget = self.budgets.get_mut(service)?;
        budget.consumed = budget.consumed.saturating_add(amount);
        let status = budget.status();
        if status.exhausted {
            debug!(service = %service, "time budget exhausted");
        }
        Some(status)
    }

    pub fn budget(&self, service: &str) -> Option<BudgetStatus> {
        self.budgets.get(service).map(|b| b.status())
    }

    /// Zeroes consumed time. Returns false if there is no budget.
    pub fn reset_budget(&self, service: &str) -> bool {
        match self.budgets.get_mut(service) {
            Some(mut budget) => {
                budget.consumed = Duration::ZERO;
                true
            }
            None => false,
        }
    }

    /// Number of requests currently tracked.
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of deadlines that have been observed as exceeded.
    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    /// Recorded overruns, oldest first, optionally for one service.
    pub fn timeout_history(&self, service: Option<&str>) -> Vec<TimeoutEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| service.map_or(true, |s| e.service == s))
            .cloned()
            .collect()
    }
}

impl Default for DeadlineManager {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

/// `now + timeout`, saturating at the furthest representable instant.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(MAX_TIMEOUT))
        .unwrap_or(now)
}
