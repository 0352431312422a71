//! Mesh-wide policies: path routes, rate limits, access control, fault
//! injection and free-form declarative policies.

use crate::clock::{self, SharedClock};
use crate::error::{MeshError, Result};
use dashmap::DashMap;
use http::Method;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pattern matching every path.
pub const WILDCARD: &str = "*";

/// Maps a request path on a service to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    /// Path prefix, or `"*"` for any path.
    pub path_pattern: String,
    /// When set, only requests with this method match.
    pub method: Option<Method>,
    pub destination: String,
}

impl RouteRule {
    pub fn new(path_pattern: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            method: None,
            destination: destination.into(),
        }
    }

    /// Restricts the rule to one method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    fn is_wildcard(&self) -> bool {
        self.path_pattern == WILDCARD
    }

    fn method_matches(&self, method: Option<&Method>) -> bool {
        match &self.method {
            None => true,
            Some(required) => method == Some(required),
        }
    }
}

/// Token bucket for rate limiting.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of available tokens.
    tokens: f64,
    /// Maximum capacity of the bucket.
    capacity: f64,
    /// Rate at which tokens are added (per second).
    refill_rate: f64,
    /// Last time the bucket was updated.
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_update: now,
        }
    }

    /// Refills tokens based on elapsed time.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = self.last_update.max(now);
    }

    /// Attempts to consume a token.
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns the estimated wait time until a token is available.
    fn wait_time(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_rate <= 0.0 {
            Duration::MAX
        } else {
            let needed = 1.0 - self.tokens;
            Duration::try_from_secs_f64(needed / self.refill_rate).unwrap_or(Duration::MAX)
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Tokens left after this check.
    pub remaining: f64,
    /// Wait before a token is available; zero when allowed.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: f64::INFINITY,
            retry_after: Duration::ZERO,
        }
    }

    pub fn is_limited(&self) -> bool {
        !self.allowed
    }

    /// Returns `Ok(())` when allowed, otherwise [`MeshError::RateLimited`].
    pub fn into_result(self, service: &str) -> Result<()> {
        if self.allowed {
            Ok(())
        } else {
            Err(MeshError::RateLimited {
                service: service.to_string(),
                retry_after: self.retry_after,
            })
        }
    }
}

/// Allow/deny lists for callers of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub denied_sources: Vec<String>,
}

impl AccessPolicy {
    /// Deny wins over allow; an empty allow list admits everyone not denied.
    pub fn permits(&self, source: &str) -> bool {
        if self.denied_sources.iter().any(|s| s == source) {
            return false;
        }
        self.allowed_sources.is_empty() || self.allowed_sources.iter().any(|s| s == source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Delay,
    Abort,
}

/// Fault to simulate before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultInjection {
    pub kind: FaultKind,
    /// Chance in [0, 1] that a request is affected.
    pub probability: f64,
    #[serde(default)]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub status_code: Option<u16>,
}

impl FaultInjection {
    pub fn delay(probability: f64, delay: Duration) -> Self {
        Self {
            kind: FaultKind::Delay,
            probability,
            delay: Some(delay),
            status_code: None,
        }
    }

    pub fn abort(probability: f64, status_code: u16) -> Self {
        Self {
            kind: FaultKind::Abort,
            probability,
            delay: None,
            status_code: Some(status_code),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.probability.is_finite() || !(0.0..=1.0).contains(&self.probability) {
            return Err(MeshError::invalid(format!(
                "fault probability must be within [0, 1], got {}",
                self.probability
            )));
        }
        if let Some(code) = self.status_code {
            if !(100..=599).contains(&code) {
                return Err(MeshError::invalid(format!("invalid fault status code {code}")));
            }
        }
        Ok(())
    }
}

/// A named policy document stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeclarativePolicy {
    pub name: String,
    pub kind: String,
    pub spec: serde_json::Value,
    #[serde(skip)]
    pub created_at: Instant,
}

/// Policy store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyStats {
    pub routes: usize,
    pub rate_limits: usize,
    pub access_policies: usize,
    pub fault_injections: usize,
    pub policies: usize,
    pub rate_limited: u64,
    pub access_denied: u64,
}

/// Holds every mesh policy keyed by service.
pub struct MeshPolicyStore {
    routes: DashMap<String, Vec<RouteRule>>,
    rate_limits: DashMap<String, TokenBucket>,
    access: DashMap<String, AccessPolicy>,
    faults: DashMap<String, FaultInjection>,
    policies: DashMap<String, DeclarativePolicy>,
    rate_limited: AtomicU64,
    access_denied: AtomicU64,
    clock: SharedClock,
}

impl MeshPolicyStore {
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            routes: DashMap::new(),
            rate_limits: DashMap::new(),
            access: DashMap::new(),
            faults: DashMap::new(),
            policies: DashMap::new(),
            rate_limited: AtomicU64::new(0),
            access_denied: AtomicU64::new(0),
            clock,
        }
    }

    pub fn add_route(&self, service: &str, rule: RouteRule) -> Result<()> {
        if rule.path_pattern.is_empty() {
            return Err(MeshError::invalid("route path pattern must not be empty"));
        }
        debug!(
            service = %service,
            pattern = %rule.path_pattern,
            destination = %rule.destination,
            "route added"
        );
        self.routes.entry(service.to_string()).or_default().push(rule);
        Ok(())
    }

    pub fn routes(&self, service: &str) -> Vec<RouteRule> {
        self.routes
            .get(service)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Removes all routes of a service. Returns how many were removed.
    pub fn clear_routes(&self, service: &str) -> usize {
        self.routes.remove(service).map_or(0, |(_, r)| r.len())
    }

    /// Finds the destination for a path: longest matching prefix first, then
    /// the wildcard.
    pub fn match_route(&self, service: &str, path: &str, method: Option<&Method>) -> Option<String> {
        let routes = self.routes.get(service)?;

        let mut best: Option<&RouteRule> = None;
        let mut wildcard: Option<&RouteRule> = None;
        for rule in routes.iter().filter(|r| r.method_matches(method)) {
            if rule.is_wildcard() {
                wildcard = wildcard.or(Some(rule));
            } else if path.starts_with(rule.path_pattern.as_str())
                && best.map_or(true, |b| rule.path_pattern.len() > b.path_pattern.len())
            {
                best = Some(rule);
            }
        }

        best.or(wildcard).map(|r| r.destination.clone())
    }

    /// Installs a token bucket; `burst` defaults to `rps`.
    pub fn set_rate_limit(&self, service: &str, rps: f64, burst: Option<f64>) -> Result<()> {
        if !rps.is_finite() || rps < 0.0 {
            return Err(MeshError::invalid(format!(
                "rate limit for {service} must be a non-negative number, got {rps}"
            )));
        }
        let burst = burst.unwrap_or(rps);
        if !burst.is_finite() || burst < 1.0 {
            return Err(MeshError::invalid(format!(
                "burst for {service} must be at least 1, got {burst}"
            )));
        }

        info!(service = %service, rps, burst, "rate limit set");
        self.rate_limits.insert(
            service.to_string(),
            TokenBucket::new(burst, rps, self.clock.now()),
        );
        Ok(())
    }

    pub fn remove_rate_limit(&self, service: &str) -> bool {
        self.rate_limits.remove(service).is_some()
    }

    /// Takes one token for `service`. Services without a limit are always allowed.
    pub fn check_rate_limit(&self, service: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let Some(mut bucket) = self.rate_limits.get_mut(service) else {
            return RateLimitDecision::unlimited();
        };

        let allowed = bucket.try_consume(now);
        let decision = RateLimitDecision {
            allowed,
            remaining: bucket.tokens,
            retry_after: if allowed { Duration::ZERO } else { bucket.wait_time() },
        };

        if !allowed {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            warn!(
                service = %service,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
        }
        decision
    }

    pub fn set_access_policy(&self, service: &str, allowed: Vec<String>, denied: Vec<String>) {
        self.access.insert(
            service.to_string(),
            AccessPolicy {
                allowed_sources: allowed,
                denied_sources: denied,
            },
        );
    }

    pub fn get_access_policy(&self, service: &str) -> Option<AccessPolicy> {
        self.access.get(service).map(|p| p.clone())
    }

    pub fn remove_access_policy(&self, service: &str) -> bool {
        self.access.remove(service).is_some()
    }

    /// Returns whether `source` may call `service`. No policy allows all.
    pub fn check_access(&self, service: &str, source: &str) -> bool {
        let permitted = self
            .access
            .get(service)
            .map_or(true, |p| p.permits(source));
        if !permitted {
            self.access_denied.fetch_add(1, Ordering::Relaxed);
            warn!(service = %service, source = %source, "access denied");
        }
        permitted
    }

    /// Stores the fault rule for a service, replacing any previous one.
    pub fn inject_fault(&self, service: &str, fault: FaultInjection) -> Result<()> {
        fault.validate()?;
        info!(service = %service, kind = ?fault.kind, probability = fault.probability, "fault injection set");
        self.faults.insert(service.to_string(), fault);
        Ok(())
    }

    pub fn get_fault_injection(&self, service: &str) -> Option<FaultInjection> {
        self.faults.get(service).map(|f| f.clone())
    }

    pub fn remove_fault_injection(&self, service: &str) -> bool {
        self.faults.remove(service).is_some()
    }

    /// Rolls the fault probability; returns the fault when it fires.
    pub fn sample_fault(&self, service: &str) -> Option<FaultInjection> {
        let fault = self.get_fault_injection(service)?;
        if rand::thread_rng().gen::<f64>() < fault.probability {
            debug!(service = %service, kind = ?fault.kind, "fault injected");
            Some(fault)
        } else {
            None
        }
    }

    /// Stores a named policy document, replacing one with the same name.
    pub fn set_policy(&self, name: &str, kind: &str, spec: serde_json::Value) -> Result<()> {
        if name.is_empty() || kind.is_empty() {
            return Err(MeshError::invalid("policy name and kind must not be empty"));
        }
        self.policies.insert(
            name.to_string(),
            DeclarativePolicy {
                name: name.to_string(),
                kind: kind.to_string(),
                spec,
                created_at: self.clock.now(),
            },
        );
        Ok(())
    }

    pub fn get_policy(&self, name: &str) -> Option<DeclarativePolicy> {
        self.policies.get(name).map(|p| p.clone())
    }

    pub fn remove_policy(&self, name: &str) -> Result<()> {
        self.policies
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MeshError::PolicyNotFound {
                name: name.to_string(),
            })
    }

    /// Lists stored policies sorted by name, optionally of one kind.
    pub fn list_policies(&self, kind: Option<&str>) -> Vec<DeclarativePolicy> {
        let mut policies: Vec<_> = self
            .policies
            .iter()
            .filter(|p| kind.map_or(true, |k| p.kind == k))
            .map(|p| p.value().clone())
            .collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            routes: self.routes.iter().map(|r| r.len()).sum(),
            rate_limits: self.rate_limits.len(),
            access_policies: self.access.len(),
            fault_injections: self.faults.len(),
            policies: self.policies.len(),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
        }
    }
}

impl Default for MeshPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> (MeshPolicyStore, ManualClock) {
        let clock = ManualClock::new();
        (MeshPolicyStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (s, _) = store();
        s.add_route("api", RouteRule::new("/users", "users-v1")).unwrap();
        s.add_route("api", RouteRule::new("/users/admin", "admin")).unwrap();
        s.add_route("api", RouteRule::new(WILDCARD, "fallback")).unwrap();

        assert_eq!(s.match_route("api", "/users/admin/1", None).as_deref(), Some("admin"));
        assert_eq!(s.match_route("api", "/users/7", None).as_deref(), Some("users-v1"));
        assert_eq!(s.match_route("api", "/orders", None).as_deref(), Some("fallback"));
        assert!(s.match_route("web", "/", None).is_none());
    }

    #[test]
    fn test_route_method_must_match() {
        let (s, _) = store();
        s.add_route("api", RouteRule::new("/items", "writer").with_method(Method::POST))
            .unwrap();
        s.add_route("api", RouteRule::new("/items", "reader")).unwrap();

        assert_eq!(
            s.match_route("api", "/items", Some(&Method::POST)).as_deref(),
            Some("writer")
        );
        assert_eq!(
            s.match_route("api", "/items", Some(&Method::GET)).as_deref(),
            Some("reader")
        );
        assert_eq!(s.match_route("api", "/items", None).as_deref(), Some("reader"));
    }

    #[test]
    fn test_no_route_without_wildcard() {
        let (s, _) = store();
        s.add_route("api", RouteRule::new("/users", "users")).unwrap();
        assert!(s.match_route("api", "/orders", None).is_none());
        assert!(s.add_route("api", RouteRule::new("", "x")).is_err());
        assert_eq!(s.clear_routes("api"), 1);
    }

    #[test]
    fn test_rate_limit_same_instant() {
        let (s, _) = store();
        s.set_rate_limit("api", 1.0, Some(1.0)).unwrap();
        assert!(s.check_rate_limit("api").allowed);

        let second = s.check_rate_limit("api");
        assert!(second.is_limited());
        assert_eq!(second.retry_after, Duration::from_secs(1));
        assert!(matches!(
            second.into_result("api"),
            Err(MeshError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_rate_limit_refills() {
        let (s, clock) = store();
        s.set_rate_limit("api", 2.0, Some(2.0)).unwrap();
        assert!(s.check_rate_limit("api").allowed);
        assert!(s.check_rate_limit("api").allowed);
        assert!(!s.check_rate_limit("api").allowed);

        clock.advance(Duration::from_millis(500));
        assert!(s.check_rate_limit("api").allowed);
        assert!(!s.check_rate_limit("api").allowed);

        clock.advance(Duration::from_secs(10));
        assert!(s.check_rate_limit("api").allowed);
        assert!(s.check_rate_limit("api").allowed);
        assert!(!s.check_rate_limit("api").allowed);
        assert_eq!(s.stats().rate_limited, 3);
    }

    #[test]
    fn test_rate_limit_validation() {
        let (s, _) = store();
        assert!(s.set_rate_limit("api", -1.0, None).is_err());
        assert!(s.set_rate_limit("api", 5.0, Some(0.0)).is_err());
        assert!(s.set_rate_limit("api", f64::NAN, None).is_err());
        assert!(s.set_rate_limit("api", 0.0, None).is_err());
        assert!(s.check_rate_limit("api").allowed);
    }

    #[test]
    fn test_burst_defaults_to_rps() {
        let (s, _) = store();
        s.set_rate_limit("api", 3.0, None).unwrap();
        let allowed = (0..5).filter(|_| s.check_rate_limit("api").allowed).count();
        assert_eq!(allowed, 3);

        assert!(s.remove_rate_limit("api"));
        assert!(s.check_rate_limit("api").allowed);
    }

    #[test]
    fn test_access_policy() {
        let (s, _) = store();
        assert!(s.check_access("api", "anyone"));

        s.set_access_policy(
            "api",
            vec!["web".to_string(), "batch".to_string()],
            vec!["batch".to_string()],
        );
        assert!(s.check_access("api", "web"));
        assert!(!s.check_access("api", "batch"));
        assert!(!s.check_access("api", "mobile"));
        assert_eq!(s.stats().access_denied, 2);

        s.set_access_policy("api", vec![], vec!["mobile".to_string()]);
        assert!(s.check_access("api", "web"));
        assert!(!s.check_access("api", "mobile"));
    }

    #[test]
    fn test_fault_injection() {
        let (s, _) = store();
        assert!(s.inject_fault("api", FaultInjection::abort(1.5, 503)).is_err());
        assert!(s.inject_fault("api", FaultInjection::abort(0.5, 42)).is_err());

        s.inject_fault("api", FaultInjection::delay(1.0, Duration::from_millis(200)))
            .unwrap();
        s.inject_fault("api", FaultInjection::abort(1.0, 503)).unwrap();

        let fault = s.get_fault_injection("api").unwrap();
        assert_eq!(fault.kind, FaultKind::Abort);
        assert_eq!(s.sample_fault("api"), Some(fault));

        s.inject_fault("api", FaultInjection::abort(0.0, 503)).unwrap();
        assert!(s.sample_fault("api").is_none());

        assert!(s.remove_fault_injection("api"));
        assert!(s.get_fault_injection("api").is_none());
    }

    #[test]
    fn test_declarative_policies() {
        let (s, _) = store();
        s.set_policy("retry-api", "retry", json!({"max_attempts": 5})).unwrap();
        s.set_policy("lb-api", "load_balancing", json!({"algorithm": "random"}))
            .unwrap();
        assert!(s.set_policy("", "retry", json!({})).is_err());

        assert_eq!(s.policy_count(), 2);
        assert_eq!(s.get_policy("retry-api").unwrap().spec["max_attempts"], 5);
        assert_eq!(s.list_policies(Some("retry")).len(), 1);

        s.remove_policy("retry-api").unwrap();
        assert!(matches!(
            s.remove_policy("retry-api"),
            Err(MeshError::PolicyNotFound { .. })
        ));
    }
}
