//! Instance selection with pluggable load-balancing strategies.
//!
//! The algorithm is chosen once when the [`LoadBalancer`] is built and
//! resolved into a strategy object; per-call work is only the selection
//! itself. Sticky sessions are consulted before the strategy runs.

use crate::error::{MeshError, Result};
use crate::hash::fnv1a_64;
use crate::registry::ServiceInstance;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Positions on the consistent-hash ring are reduced modulo this size.
pub const HASH_RING_SIZE: u64 = 1 << 32;

const DEFAULT_WEIGHT: f64 = 1.0;

/// Largest weight accepted by [`LoadBalancer::set_weight`].
pub const MAX_WEIGHT: f64 = 1_000_000.0;

/// Load balancing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Round-robin selection.
    #[default]
    RoundRobin,
    /// Fewest tracked open connections.
    LeastConnections,
    /// Random draw proportional to per-instance weight.
    Weighted,
    /// Uniform random selection.
    Random,
    /// Hash ring keyed by session id.
    ConsistentHash,
    /// Round-robin over instances not marked unhealthy.
    HealthAware,
}

impl LoadBalancingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingPolicy::RoundRobin => "round_robin",
            LoadBalancingPolicy::LeastConnections => "least_connections",
            LoadBalancingPolicy::Weighted => "weighted",
            LoadBalancingPolicy::Random => "random",
            LoadBalancingPolicy::ConsistentHash => "consistent_hash",
            LoadBalancingPolicy::HealthAware => "health_aware",
        }
    }
}

impl fmt::Display for LoadBalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingPolicy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round_robin" => Ok(LoadBalancingPolicy::RoundRobin),
            "least_connections" => Ok(LoadBalancingPolicy::LeastConnections),
            "weighted" => Ok(LoadBalancingPolicy::Weighted),
            "random" => Ok(LoadBalancingPolicy::Random),
            "consistent_hash" => Ok(LoadBalancingPolicy::ConsistentHash),
            "health_aware" => Ok(LoadBalancingPolicy::HealthAware),
            other => Err(MeshError::invalid(format!(
                "unknown load balancing algorithm '{other}'"
            ))),
        }
    }
}

/// Mutable bookkeeping shared by all strategies.
#[derive(Default)]
struct BalancerState {
    cursors: DashMap<String, usize>,
    connections: DashMap<String, usize>,
    weights: DashMap<String, f64>,
    health: DashMap<String, bool>,
}

impl BalancerState {
    fn next_cursor(&self, service: &str, len: usize) -> usize {
        let mut cursor = self.cursors.entry(service.to_string()).or_insert(0);
        let idx = *cursor % len;
        *cursor = cursor.wrapping_add(1);
        idx
    }

    fn connections(&self, key: &str) -> usize {
        self.connections.get(key).map(|c| *c).unwrap_or(0)
    }

    fn weight(&self, key: &str) -> f64 {
        self.weights.get(key).map(|w| *w).unwrap_or(DEFAULT_WEIGHT)
    }

    fn is_healthy(&self, key: &str) -> bool {
        self.health.get(key).map(|h| *h).unwrap_or(true)
    }
}

/// A selection algorithm. Returns an index into `candidates`.
trait SelectionStrategy: Send + Sync {
    fn pick(
        &self,
        state: &BalancerState,
        service: &str,
        candidates: &[&ServiceInstance],
        session_id: Option<&str>,
    ) -> Option<usize>;
}

struct RoundRobin;

impl SelectionStrategy for RoundRobin {
    fn pick(
        &self,
        state: &BalancerState,
        service: &str,
        candidates: &[&ServiceInstance],
        _session_id: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(state.next_cursor(service, candidates.len()))
    }
}

struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn pick(
        &self,
        state: &BalancerState,
        _service: &str,
        candidates: &[&ServiceInstance],
        _session_id: Option<&str>,
    ) -> Option<usize> {
        // min_by_key keeps the first of equal minima.
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| state.connections(&instance.key()))
            .map(|(idx, _)| idx)
    }
}

struct Weighted;

impl SelectionStrategy for Weighted {
    fn pick(
        &self,
        state: &BalancerState,
        service: &str,
        candidates: &[&ServiceInstance],
        session_id: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<f64> = candidates.iter().map(|i| state.weight(&i.key())).collect();
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return RoundRobin.pick(state, service, candidates, session_id);
        }

        let draw = rand::thread_rng().gen_range(0.0..total);
        let mut cumulative = 0.0;
        for (idx, weight) in weights.iter().enumerate() {
            cumulative += weight;
            if draw < cumulative {
                return Some(idx);
            }
        }
        // Float rounding can leave the draw just past the last boundary.
        weights.iter().rposition(|w| *w > 0.0)
    }
}

struct Random;

impl SelectionStrategy for Random {
    fn pick(
        &self,
        _state: &BalancerState,
        _service: &str,
        candidates: &[&ServiceInstance],
        _session_id: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }
}

struct ConsistentHash;

impl SelectionStrategy for ConsistentHash {
    fn pick(
        &self,
        _state: &BalancerState,
        _service: &str,
        candidates: &[&ServiceInstance],
        session_id: Option<&str>,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let generated;
        let key = match session_id {
            Some(id) => id,
            None => {
                generated = rand::thread_rng().gen::<u64>().to_string();
                generated.as_str()
            }
        };
        let point = ring_position(key);

        let positions: Vec<u64> = candidates.iter().map(|i| ring_position(&i.key())).collect();
        let clockwise = positions
            .iter()
            .enumerate()
            .filter(|(_, pos)| **pos >= point)
            .min_by_key(|(_, pos)| **pos)
            .map(|(idx, _)| idx);

        clockwise.or_else(|| {
            positions
                .iter()
                .enumerate()
                .min_by_key(|(_, pos)| **pos)
                .map(|(idx, _)| idx)
        })
    }
}

struct HealthAware;

impl SelectionStrategy for HealthAware {
    fn pick(
        &self,
        state: &BalancerState,
        service: &str,
        candidates: &[&ServiceInstance],
        _session_id: Option<&str>,
    ) -> Option<usize> {
        let healthy: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, i)| state.is_healthy(&i.key()))
            .map(|(idx, _)| idx)
            .collect();

        if healthy.is_empty() {
            return None;
        }
        Some(healthy[state.next_cursor(service, healthy.len())])
    }
}

fn ring_position(key: &str) -> u64 {
    fnv1a_64(key.as_bytes()) % HASH_RING_SIZE
}

fn strategy_for(policy: LoadBalancingPolicy) -> Box<dyn SelectionStrategy> {
    match policy {
        LoadBalancingPolicy::RoundRobin => Box::new(RoundRobin),
        LoadBalancingPolicy::LeastConnections => Box::new(LeastConnections),
        LoadBalancingPolicy::Weighted => Box::new(Weighted),
        LoadBalancingPolicy::Random => Box::new(Random),
        LoadBalancingPolicy::ConsistentHash => Box::new(ConsistentHash),
        LoadBalancingPolicy::HealthAware => Box::new(HealthAware),
    }
}

/// Load balancer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: LoadBalancingPolicy,
    /// Selections per instance key.
    pub selections: HashMap<String, u64>,
    pub total_connections: usize,
    pub sticky_sessions: usize,
}

/// Load balancer for distributing requests across service instances.
pub struct LoadBalancer {
    policy: LoadBalancingPolicy,
    strategy: Box<dyn SelectionStrategy>,
    state: BalancerState,
    /// (service, session id) -> instance key.
    sticky: DashMap<(String, String), String>,
    selections: DashMap<String, u64>,
}

impl LoadBalancer {
    /// Creates a new load balancer.
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            strategy: strategy_for(policy),
            state: BalancerState::default(),
            sticky: DashMap::new(),
            selections: DashMap::new(),
        }
    }

    /// Returns the configured algorithm.
    pub fn algorithm(&self) -> LoadBalancingPolicy {
        self.policy
    }

    /// Selects one active instance.
    ///
    /// With a `session_id`, an earlier selection for the same session is
    /// reused while that instance is still a candidate.
    pub fn select(
        &self,
        service: &str,
        instances: &[ServiceInstance],
        session_id: Option<&str>,
    ) -> Option<ServiceInstance> {
        let candidates: Vec<&ServiceInstance> = instances.iter().filter(|i| i.is_active()).collect();
        if candidates.is_empty() {
            warn!(service = %service, "no active instances to select from");
            return None;
        }

        if let Some(session) = session_id {
            let sticky_key = (service.to_string(), session.to_string());
            if let Some(bound) = self.sticky.get(&sticky_key) {
                if let Some(instance) = candidates.iter().find(|i| i.key() == *bound) {
                    debug!(service = %service, session = %session, instance = %bound.as_str(), "sticky session hit");
                    return Some(self.record_selection(instance));
                }
            }
        }

        let idx = self
            .strategy
            .pick(&self.state, service, &candidates, session_id)?;
        let selected = self.record_selection(candidates[idx]);

        if let Some(session) = session_id {
            self.sticky
                .insert((service.to_string(), session.to_string()), selected.key());
        }

        debug!(
            service = %service,
            algorithm = %self.policy,
            instance = %selected.key(),
            "selected instance"
        );
        Some(selected)
    }

    fn record_selection(&self, instance: &ServiceInstance) -> ServiceInstance {
        *self.selections.entry(instance.key()).or_insert(0) += 1;
        instance.clone()
    }

    /// Drops one session binding, or all of them with `None`.
    ///
    /// Returns the number of bindings removed.
    pub fn clear_sticky(&self, session_id: Option<&str>) -> usize {
        match session_id {
            Some(session) => {
                let before = self.sticky.len();
                self.sticky.retain(|(_, s), _| s != session);
                before - self.sticky.len()
            }
            None => {
                let removed = self.sticky.len();
                self.sticky.clear();
                removed
            }
        }
    }

    /// Returns the number of active session bindings.
    pub fn sticky_count(&self) -> usize {
        self.sticky.len()
    }

    /// Increments the open-connection count for an instance.
    pub fn add_connection(&self, instance_key: &str) -> usize {
        let mut count = self
            .state
            .connections
            .entry(instance_key.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Decrements the open-connection count for an instance.
    pub fn remove_connection(&self, instance_key: &str) -> usize {
        match self.state.connections.get_mut(instance_key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        }
    }

    /// Returns the open-connection count for an instance.
    pub fn connections(&self, instance_key: &str) -> usize {
        self.state.connections(instance_key)
    }

    /// Returns the open-connection count across all instances.
    pub fn total_connections(&self) -> usize {
        self.state.connections.iter().map(|c| *c.value()).sum()
    }

    /// Sets the weight used by the weighted algorithm.
    pub fn set_weight(&self, instance_key: &str, weight: f64) -> Result<()> {
        if !(0.0..=MAX_WEIGHT).contains(&weight) {
            return Err(MeshError::invalid(format!(
                "weight for {instance_key} must be between 0 and {MAX_WEIGHT}, got {weight}"
            )));
        }
        self.state.weights.insert(instance_key.to_string(), weight);
        Ok(())
    }

    /// Marks an instance healthy or unhealthy for the health-aware algorithm.
    pub fn set_health(&self, instance_key: &str, healthy: bool) {
        self.state.health.insert(instance_key.to_string(), healthy);
    }

    /// Returns the health mark for an instance; unmarked instances are healthy.
    pub fn is_healthy(&self, instance_key: &str) -> bool {
        self.state.is_healthy(instance_key)
    }

    /// Returns statistics for this balancer.
    pub fn stats(&self) -> LoadBalancerStats {
        LoadBalancerStats {
            algorithm: self.policy,
            selections: self
                .selections
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            total_connections: self.total_connections(),
            sticky_sessions: self.sticky_count(),
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ServiceRegistry, ServiceStatus, Registration};

    fn instances(hosts: &[&str]) -> Vec<ServiceInstance> {
        let reg = ServiceRegistry::new();
        for host in hosts {
            reg.register("svc", host, 8080, Registration::new()).unwrap();
        }
        reg.get_instances("svc", false)
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::RoundRobin);
        let pool = instances(&["a", "b", "c"]);

        let picks: Vec<_> = (0..4)
            .map(|_| lb.select("svc", &pool, None).unwrap().host)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_round_robin_cursor_per_service() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::RoundRobin);
        let pool = instances(&["a", "b"]);
        assert_eq!(lb.select("one", &pool, None).unwrap().host, "a");
        assert_eq!(lb.select("two", &pool, None).unwrap().host, "a");
        assert_eq!(lb.select("one", &pool, None).unwrap().host, "b");
    }

    #[test]
    fn test_inactive_instances_skipped() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::RoundRobin);
        let mut pool = instances(&["a", "b"]);
        pool[0].status = ServiceStatus::Draining;
        for _ in 0..3 {
            assert_eq!(lb.select("svc", &pool, None).unwrap().host, "b");
        }
    }

    #[test]
    fn test_least_connections() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::LeastConnections);
        lb.add_connection("a:8080");
        lb.add_connection("a:8080");
        let pool = instances(&["a", "b"]);
        assert_eq!(lb.select("svc", &pool, None).unwrap().host, "b");
    }

    #[test]
    fn test_least_connections_tie_takes_first() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::LeastConnections);
        let pool = instances(&["a", "b", "c"]);
        assert_eq!(lb.select("svc", &pool, None).unwrap().host, "a");
    }

    #[test]
    fn test_weighted_prefers_heavier() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Weighted);
        lb.set_weight("a:8080", 0.0).unwrap();
        lb.set_weight("b:8080", 10.0).unwrap();
        let pool = instances(&["a", "b"]);
        for _ in 0..20 {
            assert_eq!(lb.select("svc", &pool, None).unwrap().host, "b");
        }
    }

    #[test]
    fn test_weighted_convergence() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Weighted);
        lb.set_weight("a:8080", 1.0).unwrap();
        lb.set_weight("b:8080", 9.0).unwrap();
        let pool = instances(&["a", "b"]);

        let draws = 20_000;
        let b_hits = (0..draws)
            .filter(|_| lb.select("svc", &pool, None).unwrap().host == "b")
            .count();
        let ratio = b_hits as f64 / draws as f64;
        assert!((ratio - 0.9).abs() < 0.02, "ratio was {ratio}");
    }

    #[test]
    fn test_weighted_all_zero_falls_back() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Weighted);
        lb.set_weight("a:8080", 0.0).unwrap();
        lb.set_weight("b:8080", 0.0).unwrap();
        let pool = instances(&["a", "b"]);
        assert!(lb.select("svc", &pool, None).is_some());
    }

    #[test]
    fn test_set_weight_rejects_invalid() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Weighted);
        assert!(lb.set_weight("a:8080", -1.0).is_err());
        assert!(lb.set_weight("a:8080", f64::NAN).is_err());
        assert!(lb.set_weight("a:8080", f64::INFINITY).is_err());
        assert!(lb.set_weight("a:8080", f64::MAX).is_err());
        assert!(lb.set_weight("a:8080", MAX_WEIGHT).is_ok());
    }

    #[test]
    fn test_weighted_overflowing_total_falls_back() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Weighted);
        lb.state.weights.insert("a:8080".to_string(), f64::MAX);
        lb.state.weights.insert("b:8080".to_string(), f64::MAX);
        let pool = instances(&["a", "b"]);

        let first = lb.select("svc", &pool, None).unwrap();
        let second = lb.select("svc", &pool, None).unwrap();
        assert_ne!(first.key(), second.key());
    }

    #[test]
    fn test_random_returns_candidate() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::Random);
        let pool = instances(&["a", "b", "c"]);
        for _ in 0..20 {
            let picked = lb.select("svc", &pool, None).unwrap();
            assert!(pool.contains(&picked));
        }
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let pool = instances(&["a", "b", "c", "d"]);
        let first = LoadBalancer::new(LoadBalancingPolicy::ConsistentHash);
        let second = LoadBalancer::new(LoadBalancingPolicy::ConsistentHash);

        for session in ["user-1", "user-2", "user-3"] {
            let a = first.select("svc", &pool, Some(session)).unwrap();
            first.clear_sticky(None);
            let b = second.select("svc", &pool, Some(session)).unwrap();
            assert_eq!(a.key(), b.key());
        }
    }

    #[test]
    fn test_consistent_hash_picks_next_position() {
        let pool = instances(&["a", "b", "c"]);
        let lb = LoadBalancer::new(LoadBalancingPolicy::ConsistentHash);
        let session = "session-42";
        let point = ring_position(session);

        let expected = pool
            .iter()
            .filter(|i| ring_position(&i.key()) >= point)
            .min_by_key(|i| ring_position(&i.key()))
            .or_else(|| pool.iter().min_by_key(|i| ring_position(&i.key())))
            .unwrap();
        assert_eq!(lb.select("svc", &pool, Some(session)).unwrap().key(), expected.key());
    }

    #[test]
    fn test_health_aware() {
        let lb = LoadBalancer::new(LoadBalancingPolicy::HealthAware);
        lb.set_health("a:8080", false);
        lb.set_health("b:8080", true);
        let pool = instances(&["a", "b"]);
        for _ in 0..5 {
            assert_eq!(lb.select("svc", &pool, None).unwrap().host, "b");
        }

        lb.set_health("b:8080", false);
        assert!(lb.select("svc", &pool, None).is_none());
    }

    #[test]
    fn test_empty_instances() {
        let lb = LoadBalancer::default();
        assert!(lb.select("svc", &[], None).is_none());
    }

    #[test]
    fn test_sticky_session() {
        let lb = LoadBalancer::default();
        let pool = instances(&["a", "b"]);
        let r1 = lb.select("svc", &pool, Some("s1")).unwrap();
        let r2 = lb.select("svc", &pool, Some("s1")).unwrap();
        assert_eq!(r1.key(), r2.key());
        assert_eq!(lb.sticky_count(), 1);
    }

    #[test]
    fn test_sticky_rebinds_when_instance_gone() {
        let lb = LoadBalancer::default();
        let pool = instances(&["a", "b"]);
        let first = lb.select("svc", &pool, Some("s1")).unwrap();

        let remaining: Vec<_> = pool.into_iter().filter(|i| i.key() != first.key()).collect();
        let second = lb.select("svc", &remaining, Some("s1")).unwrap();
        assert_ne!(first.key(), second.key());
        assert_eq!(lb.select("svc", &remaining, Some("s1")).unwrap().key(), second.key());
    }

    #[test]
    fn test_clear_sticky() {
        let lb = LoadBalancer::default();
        let pool = instances(&["a"]);
        lb.select("svc", &pool, Some("s1"));
        lb.select("svc", &pool, Some("s2"));
        assert_eq!(lb.clear_sticky(Some("s1")), 1);
        assert_eq!(lb.clear_sticky(Some("missing")), 0);
        assert_eq!(lb.clear_sticky(None), 1);
        assert_eq!(lb.sticky_count(), 0);
    }

    #[test]
    fn test_connections() {
        let lb = LoadBalancer::default();
        assert_eq!(lb.add_connection("a"), 1);
        assert_eq!(lb.add_connection("a"), 2);
        assert_eq!(lb.remove_connection("a"), 1);
        assert_eq!(lb.remove_connection("missing"), 0);
        assert_eq!(lb.total_connections(), 1);
    }

    #[test]
    fn test_stats_count_selections() {
        let lb = LoadBalancer::default();
        let pool = instances(&["a"]);
        lb.select("svc", &pool, None);
        let stats = lb.stats();
        assert_eq!(stats.selections.get("a:8080"), Some(&1));
        assert_eq!(stats.algorithm, LoadBalancingPolicy::RoundRobin);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "health_aware".parse::<LoadBalancingPolicy>().unwrap(),
            LoadBalancingPolicy::HealthAware
        );
        assert!("fastest".parse::<LoadBalancingPolicy>().is_err());
    }
}
