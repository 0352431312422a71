//! Request admission and dispatch decisions across every mesh component.
//!
//! [`MeshGateway::route_request`] runs the gates in a fixed order: circuit
//! breaker, access policy, rate limit, instance discovery, version
//! selection, path routing and load balancing. [`MeshGateway::record_result`]
//! feeds the caller's outcome back.

use crate::circuit_breaker::{CircuitBreaker, CircuitMetrics, CircuitState};
use crate::clock::{self, SharedClock};
use crate::config::{MeshConfig, ServiceSeed};
use crate::deadline::{BudgetStatus, DeadlineManager};
use crate::error::{MeshError, Result};
use crate::load_balancer::{LoadBalancer, LoadBalancerStats};
use crate::metrics::MeshMetrics;
use crate::policy::{FaultInjection, MeshPolicyStore, PolicyStats};
use crate::proxy::{EdgeProxy, ProxyStats};
use crate::registry::{Registration, ServiceInstance, ServiceRecord, ServiceRegistry, DEFAULT_VERSION};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::traffic::{RoutingKind, TrafficManager, TrafficStats};
use dashmap::DashMap;
use http::Method;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Request metadata supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub request_id: String,
    /// Calling service, checked against access policies.
    pub source: Option<String>,
    pub path: Option<String>,
    pub method: Option<Method>,
    /// Enables sticky instance selection.
    pub session_id: Option<String>,
    /// 0-based attempt number, used for retry decisions.
    pub attempt: u32,
    /// Absolute deadline; defaults to the service request timeout.
    pub deadline: Option<Instant>,
}

impl RouteRequest {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Outcome class of a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Routed,
    CircuitOpen,
    AccessDenied,
    RateLimited,
    NoInstances,
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStatus::Routed => "routed",
            RouteStatus::CircuitOpen => "circuit_open",
            RouteStatus::AccessDenied => "access_denied",
            RouteStatus::RateLimited => "rate_limited",
            RouteStatus::NoInstances => "no_instances",
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the caller needs to dispatch, or the reason not to.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub service: String,
    pub request_id: String,
    pub status: RouteStatus,
    pub instance: Option<ServiceInstance>,
    pub version: Option<String>,
    pub routing: Option<RoutingKind>,
    /// Destination of the matching path route.
    pub destination: Option<String>,
    /// Shadow version to mirror the request to.
    pub mirror_to: Option<String>,
    /// Fault the caller should simulate before dispatch.
    pub fault: Option<FaultInjection>,
    pub deadline_remaining: Option<Duration>,
    /// Set when rate limited.
    pub retry_after: Option<Duration>,
    /// Degraded response registered for an open circuit.
    pub fallback: Option<serde_json::Value>,
    #[serde(skip)]
    source: Option<String>,
}

impl RoutingDecision {
    fn empty(service: &str, request: &RouteRequest, status: RouteStatus) -> Self {
        Self {
            service: service.to_string(),
            request_id: request.request_id.clone(),
            status,
            instance: None,
            version: None,
            routing: None,
            destination: None,
            mirror_to: None,
            fault: None,
            deadline_remaining: None,
            retry_after: None,
            fallback: None,
            source: request.source.clone(),
        }
    }

    pub fn is_routed(&self) -> bool {
        self.status == RouteStatus::Routed
    }

    /// Returns the decision when routed, otherwise the matching error.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            RouteStatus::Routed => Ok(self),
            RouteStatus::CircuitOpen => Err(MeshError::CircuitOpen {
                service: self.service,
            }),
            RouteStatus::AccessDenied => Err(MeshError::AccessDenied {
                service: self.service,
                source_name: self.source.unwrap_or_default(),
            }),
            RouteStatus::RateLimited => Err(MeshError::RateLimited {
                service: self.service,
                retry_after: self.retry_after.unwrap_or_default(),
            }),
            RouteStatus::NoInstances => Err(MeshError::NoHealthyInstances {
                service: self.service,
            }),
        }
    }
}

/// What `record_result` changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub circuit_state: CircuitState,
    /// Time the request was tracked by the deadline manager.
    pub elapsed: Option<Duration>,
    pub budget: Option<BudgetStatus>,
    /// Next-attempt advice; only for failures.
    pub retry: Option<RetryDecision>,
}

/// Health summary of one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub circuit_state: CircuitState,
    pub circuit: Option<CircuitMetrics>,
    pub in_flight: usize,
    /// Healthy instances exist and the circuit admits traffic.
    pub healthy: bool,
}

/// Point-in-time view of all components.
#[derive(Debug, Clone, Serialize)]
pub struct MeshSnapshot {
    pub enabled: bool,
    pub services: Vec<ServiceRecord>,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub circuits: usize,
    pub open_circuits: usize,
    pub in_flight: usize,
    pub active_deadlines: usize,
    pub load_balancer: LoadBalancerStats,
    pub traffic: TrafficStats,
    pub policy: PolicyStats,
    pub proxy: ProxyStats,
    pub request_count: u64,
}

/// Aggregated decision statistics.
#[derive(Debug, Clone, Serialize)]
pub struct MeshAnalytics {
    pub request_count: u64,
    pub by_status: HashMap<String, u64>,
    pub by_service: HashMap<String, u64>,
    /// Share of requests that were routed, 0 when there were none.
    pub routed_ratio: f64,
    pub results_recorded: u64,
    pub failures_recorded: u64,
    pub retry_decisions: usize,
    pub retries_refused: usize,
    pub timeouts: u64,
}

#[derive(Debug, Clone)]
struct InFlight {
    service: String,
    instance_key: String,
    attempt: u32,
}

/// Front door of the mesh core.
pub struct MeshGateway {
    config: MeshConfig,
    registry: ServiceRegistry,
    load_balancer: LoadBalancer,
    circuit_breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    deadlines: DeadlineManager,
    traffic: TrafficManager,
    proxy: EdgeProxy,
    policies: MeshPolicyStore,
    metrics: MeshMetrics,
    in_flight: DashMap<String, InFlight>,
    by_status: DashMap<RouteStatus, u64>,
    by_service: DashMap<String, u64>,
    request_count: AtomicU64,
    results_recorded: AtomicU64,
    failures_recorded: AtomicU64,
}

impl MeshGateway {
    /// Builds a gateway from validated configuration using the system clock.
    pub fn new(config: MeshConfig) -> Result<Self> {
        Self::with_clock(config, clock::system())
    }

    /// Builds a gateway whose components all read time from `clock`.
    pub fn with_clock(config: MeshConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;

        let gateway = Self {
            registry: ServiceRegistry::with_clock(config.instance_ttl(), clock.clone()),
            load_balancer: LoadBalancer::new(config.lb_algorithm),
            circuit_breaker: CircuitBreaker::with_clock(config.circuit_config(), clock.clone()),
            retry_policy: RetryPolicy::new(config.retry_config()),
            deadlines: DeadlineManager::with_clock(config.timeout_config(), clock.clone()),
            traffic: TrafficManager::new(),
            proxy: EdgeProxy::with_clock(&config.proxy_id, clock.clone())?,
            policies: MeshPolicyStore::with_clock(clock),
            metrics: MeshMetrics::new(),
            in_flight: DashMap::new(),
            by_status: DashMap::new(),
            by_service: DashMap::new(),
            request_count: AtomicU64::new(0),
            results_recorded: AtomicU64::new(0),
            failures_recorded: AtomicU64::new(0),
            config,
        };
        info!(
            proxy_id = %gateway.config.proxy_id,
            algorithm = %gateway.config.lb_algorithm,
            enabled = gateway.config.enabled,
            "mesh gateway created"
        );
        Ok(gateway)
    }

    /// Registers every seeded instance. Returns the number registered.
    pub fn initialize(&self, services: &[ServiceSeed]) -> Result<usize> {
        let mut registered = 0;
        for seed in services {
            for instance in &seed.instances {
                let registration = Registration {
                    version: instance.version.clone(),
                    metadata: instance.metadata.clone(),
                    ttl: instance.ttl_ms.map(Duration::from_millis),
                };
                self.registry
                    .register(&seed.name, &instance.host, instance.port, registration)?;
                registered += 1;
            }
        }
        self.metrics
            .set_registered_instances(self.registry.total_instances());
        info!(
            services = services.len(),
            instances = registered,
            "mesh initialized"
        );
        Ok(registered)
    }

    /// Decides whether and where to send a request.
    pub fn route_request(&self, service: &str, request: RouteRequest) -> RoutingDecision {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.by_service.entry(service.to_string()).or_insert(0) += 1;

        let decision = if self.config.enabled {
            self.decide(service, &request)
        } else {
            self.pass_through(service, &request)
        };

        *self.by_status.entry(decision.status).or_insert(0) += 1;
        self.metrics.record_routing(service, decision.status.as_str());
        debug!(
            service = %service,
            request_id = %request.request_id,
            status = %decision.status,
            instance = ?decision.instance.as_ref().map(ServiceInstance::key),
            "routing decision"
        );
        decision
    }

    fn decide(&self, service: &str, request: &RouteRequest) -> RoutingDecision {
        if !self.circuit_breaker.can_execute(service) {
            let mut decision = RoutingDecision::empty(service, request, RouteStatus::CircuitOpen);
            decision.fallback = self.circuit_breaker.get_fallback(service);
            return decision;
        }

        if let Some(source) = &request.source {
            if !self.policies.check_access(service, source) {
                return RoutingDecision::empty(service, request, RouteStatus::AccessDenied);
            }
        }

        let limit = self.policies.check_rate_limit(service);
        if limit.is_limited() {
            let mut decision = RoutingDecision::empty(service, request, RouteStatus::RateLimited);
            decision.retry_after = Some(limit.retry_after);
            return decision;
        }

        let healthy = self.registry.get_instances(service, true);
        if healthy.is_empty() {
            return RoutingDecision::empty(service, request, RouteStatus::NoInstances);
        }

        let route = self.traffic.route_request(service, &request.request_id);
        let candidates = if route.version == DEFAULT_VERSION {
            healthy
        } else {
            let matching: Vec<ServiceInstance> = healthy
                .iter()
                .filter(|i| i.version == route.version)
                .cloned()
                .collect();
            if matching.is_empty() {
                healthy
            } else {
                matching
            }
        };

        let destination = request
            .path
            .as_deref()
            .and_then(|path| self.policies.match_route(service, path, request.method.as_ref()));

        let Some(instance) =
            self.load_balancer
                .select(service, &candidates, request.session_id.as_deref())
        else {
            return RoutingDecision::empty(service, request, RouteStatus::NoInstances);
        };

        let mut decision = RoutingDecision::empty(service, request, RouteStatus::Routed);
        self.dispatch(&mut decision, request, instance);
        decision.version = Some(route.version);
        decision.routing = Some(route.routing);
        decision.destination = destination;
        decision.mirror_to = self.traffic.should_mirror(service, &request.request_id);
        decision.fault = self.policies.sample_fault(service);
        decision
    }

    /// Routing with every gate switched off.
    fn pass_through(&self, service: &str, request: &RouteRequest) -> RoutingDecision {
        let healthy = self.registry.get_instances(service, true);
        match self
            .load_balancer
            .select(service, &healthy, request.session_id.as_deref())
        {
            Some(instance) => {
                let mut decision = RoutingDecision::empty(service, request, RouteStatus::Routed);
                self.dispatch(&mut decision, request, instance);
                decision
            }
            None => RoutingDecision::empty(service, request, RouteStatus::NoInstances),
        }
    }

    /// Connection, deadline and in-flight bookkeeping for a routed request.
    fn dispatch(&self, decision: &mut RoutingDecision, request: &RouteRequest, instance: ServiceInstance) {
        let instance_key = instance.key();
        self.load_balancer.add_connection(&instance_key);
        let ticket = self
            .deadlines
            .start_request(&request.request_id, &decision.service, request.deadline);

        // A reused request id replaces the earlier attempt.
        if let Some(previous) = self.in_flight.insert(
            request.request_id.clone(),
            InFlight {
                service: decision.service.clone(),
                instance_key,
                attempt: request.attempt,
            },
        ) {
            self.load_balancer.remove_connection(&previous.instance_key);
        }

        decision.deadline_remaining = Some(ticket.remaining);
        decision.instance = Some(instance);
    }

    /// Feeds a call outcome back and returns what changed.
    pub fn record_result(
        &self,
        service: &str,
        request_id: &str,
        success: bool,
        latency: Option<Duration>,
    ) -> RecordOutcome {
        self.results_recorded.fetch_add(1, Ordering::Relaxed);
        let before = self.circuit_breaker.get_state(service);
        let circuit_state = if success {
            self.circuit_breaker.record_success(service)
        } else {
            self.failures_recorded.fetch_add(1, Ordering::Relaxed);
            self.circuit_breaker.record_failure(service)
        };
        if circuit_state != before {
            self.metrics.record_transition(service, circuit_state.as_str());
        }

        // Bookkeeping is keyed by request id alone, like the deadline entry.
        let in_flight = self.in_flight.remove(request_id).map(|(_, f)| f);
        if let Some(entry) = &in_flight {
            if entry.service != service {
                warn!(
                    request_id = %request_id,
                    routed_to = %entry.service,
                    reported_for = %service,
                    "result reported for a different service than routed"
                );
            }
            self.load_balancer.remove_connection(&entry.instance_key);
        }

        let elapsed = self.deadlines.end_request(request_id);
        let budget = latency
            .or(elapsed)
            .and_then(|spent| self.deadlines.consume_budget(service, spent));
        self.metrics
            .record_outcome(service, success, latency.or(elapsed).map(|d| d.as_secs_f64()));

        let retry = (!success).then(|| {
            let attempt = in_flight.as_ref().map_or(0, |f| f.attempt);
            self.retry_policy.should_retry(service, attempt)
        });

        debug!(
            service = %service,
            request_id = %request_id,
            success,
            circuit = %circuit_state,
            "result recorded"
        );
        RecordOutcome {
            circuit_state,
            elapsed,
            budget,
            retry,
        }
    }

    /// Removes instances whose heartbeat TTL lapsed.
    pub fn cleanup_expired(&self) -> usize {
        let removed = self.registry.cleanup_expired();
        self.metrics
            .set_registered_instances(self.registry.total_instances());
        removed
    }

    /// Returns `None` for services neither registered nor tracked by a circuit.
    pub fn service_health(&self, service: &str) -> Option<ServiceHealth> {
        let record = self.registry.get_service(service);
        let circuit = self.circuit_breaker.get_metrics(service);
        if record.is_none() && circuit.is_none() {
            return None;
        }

        let (total, healthy) = record
            .map(|r| (r.instance_count, r.healthy_count))
            .unwrap_or((0, 0));
        let circuit_state = self.circuit_breaker.get_state(service);
        let in_flight = self
            .in_flight
            .iter()
            .filter(|f| f.service == service)
            .count();

        Some(ServiceHealth {
            service: service.to_string(),
            total_instances: total,
            healthy_instances: healthy,
            circuit_state,
            circuit,
            in_flight,
            healthy: healthy > 0 && !circuit_state.is_open(),
        })
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            enabled: self.config.enabled,
            services: self.registry.list_services(),
            total_instances: self.registry.total_instances(),
            healthy_instances: self.registry.healthy_instances(),
            circuits: self.circuit_breaker.circuit_count(),
            open_circuits: self.circuit_breaker.open_count(),
            in_flight: self.in_flight.len(),
            active_deadlines: self.deadlines.active_count(),
            load_balancer: self.load_balancer.stats(),
            traffic: self.traffic.stats(),
            policy: self.policies.stats(),
            proxy: self.proxy.stats(),
            request_count: self.request_count(),
        }
    }

    pub fn analytics(&self) -> MeshAnalytics {
        let request_count = self.request_count();
        let routed = self
            .by_status
            .get(&RouteStatus::Routed)
            .map_or(0, |c| *c);
        let history = self.retry_policy.history(None);

        MeshAnalytics {
            request_count,
            by_status: self
                .by_status
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
            by_service: self
                .by_service
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            routed_ratio: if request_count == 0 {
                0.0
            } else {
                routed as f64 / request_count as f64
            },
            results_recorded: self.results_recorded.load(Ordering::Relaxed),
            failures_recorded: self.failures_recorded.load(Ordering::Relaxed),
            retry_decisions: history.len(),
            retries_refused: history.iter().filter(|r| !r.retry).count(),
            timeouts: self.deadlines.timeout_count(),
        }
    }

    /// Total `route_request` calls.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn deadlines(&self) -> &DeadlineManager {
        &self.deadlines
    }

    pub fn traffic(&self) -> &TrafficManager {
        &self.traffic
    }

    pub fn proxy(&self) -> &EdgeProxy {
        &self.proxy
    }

    pub fn policies(&self) -> &MeshPolicyStore {
        &self.policies
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }
}
