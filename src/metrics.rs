//! Prometheus metrics for routing decisions and reported outcomes.
//!
//! Each [`MeshGateway`](crate::gateway::MeshGateway) owns its own registry so
//! independent gateways never share counters.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;

/// Labels for routing decisions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub service: String,
    /// routed, circuit_open, access_denied, rate_limited or no_instances
    pub status: String,
}

/// Labels for circuit transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CircuitLabels {
    pub service: String,
    /// State entered.
    pub state: String,
}

/// Labels for reported outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub service: String,
    pub outcome: String,
}

/// Metrics collector for one gateway.
pub struct MeshMetrics {
    registry: Registry,
    routing_decisions: Family<RouteLabels, Counter>,
    circuit_transitions: Family<CircuitLabels, Counter>,
    outcomes: Family<OutcomeLabels, Counter>,
    request_latency_seconds: Family<OutcomeLabels, Histogram>,
    registered_instances: Gauge,
}

impl MeshMetrics {
    /// Creates a collector with its own registry.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("mesh");

        let routing_decisions = Family::<RouteLabels, Counter>::default();
        registry.register(
            "routing_decisions",
            "Routing decisions by outcome",
            routing_decisions.clone(),
        );

        let circuit_transitions = Family::<CircuitLabels, Counter>::default();
        registry.register(
            "circuit_transitions",
            "Circuit breaker state changes",
            circuit_transitions.clone(),
        );

        let outcomes = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "request_outcomes",
            "Outcomes reported by callers",
            outcomes.clone(),
        );

        let request_latency_seconds =
            Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 12))
            });
        registry.register(
            "request_latency_seconds",
            "Caller-reported request latency in seconds",
            request_latency_seconds.clone(),
        );

        let registered_instances = Gauge::default();
        registry.register(
            "registered_instances",
            "Instances currently in the registry",
            registered_instances.clone(),
        );

        Self {
            registry,
            routing_decisions,
            circuit_transitions,
            outcomes,
            request_latency_seconds,
            registered_instances,
        }
    }

    pub fn record_routing(&self, service: &str, status: &str) {
        self.routing_decisions
            .get_or_create(&RouteLabels {
                service: service.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_transition(&self, service: &str, state: &str) {
        self.circuit_transitions
            .get_or_create(&CircuitLabels {
                service: service.to_string(),
                state: state.to_string(),
            })
            .inc();
    }

    /// Records a reported outcome and, when known, its latency.
    pub fn record_outcome(&self, service: &str, success: bool, latency_secs: Option<f64>) {
        let labels = OutcomeLabels {
            service: service.to_string(),
            outcome: if success { "success" } else { "failure" }.to_string(),
        };
        self.outcomes.get_or_create(&labels).inc();
        if let Some(secs) = latency_secs {
            self.request_latency_seconds
                .get_or_create(&labels)
                .observe(secs);
        }
    }

    pub fn set_registered_instances(&self, count: usize) {
        self.registered_instances
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, io::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;
        Ok(buffer)
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}
