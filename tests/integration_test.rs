use servicemesh_core::circuit_breaker::CircuitState;
use servicemesh_core::clock::ManualClock;
use servicemesh_core::config::{InstanceSeed, ServiceSeed};
use servicemesh_core::deadline::TimeoutConfig;
use servicemesh_core::load_balancer::LoadBalancingPolicy;
use servicemesh_core::retry::RetryStopReason;
use servicemesh_core::{MeshConfig, MeshError, MeshGateway, RouteRequest, RouteStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn seed(name: &str, instances: &[(&str, &str)]) -> ServiceSeed {
    ServiceSeed {
        name: name.to_string(),
        instances: instances
            .iter()
            .map(|(host, version)| InstanceSeed {
                host: host.to_string(),
                port: 8080,
                version: Some(version.to_string()),
                metadata: HashMap::new(),
                ttl_ms: None,
            })
            .collect(),
    }
}

fn gateway_with(config: MeshConfig) -> (MeshGateway, ManualClock) {
    let clock = ManualClock::new();
    let gateway = MeshGateway::with_clock(config, Arc::new(clock.clone())).unwrap();
    (gateway, clock)
}

#[test]
fn test_circuit_lifecycle_through_gateway() {
    let config = MeshConfig {
        circuit_failure_threshold: 1,
        circuit_recovery_timeout_ms: 5_000,
        ..Default::default()
    };
    let (gateway, clock) = gateway_with(config);
    gateway
        .initialize(&[seed("api", &[("10.0.0.1", "v1"), ("10.0.0.2", "v1")])])
        .unwrap();

    let first = gateway.route_request("api", RouteRequest::new("req-1"));
    assert_eq!(first.status, RouteStatus::Routed);

    let outcome = gateway.record_result("api", "req-1", false, Some(Duration::from_millis(40)));
    assert_eq!(outcome.circuit_state, CircuitState::Open);
    assert!(outcome.retry.unwrap().retry);

    let blocked = gateway.route_request("api", RouteRequest::new("req-2"));
    assert_eq!(blocked.status, RouteStatus::CircuitOpen);
    assert!(matches!(
        blocked.into_result(),
        Err(MeshError::CircuitOpen { .. })
    ));

    clock.advance(Duration::from_secs(5));
    let probe = gateway.route_request("api", RouteRequest::new("req-3"));
    assert!(probe.is_routed());
    assert_eq!(gateway.circuit_breaker().get_state("api"), CircuitState::HalfOpen);

    let recovered = gateway.record_result("api", "req-3", true, None);
    assert_eq!(recovered.circuit_state, CircuitState::Closed);
    assert!(recovered.retry.is_none());

    let metrics = gateway.circuit_breaker().get_metrics("api").unwrap();
    assert_eq!(metrics.total_calls, 2);
    assert_eq!(metrics.times_opened, 1);
    assert_eq!(gateway.load_balancer().total_connections(), 0);
}

#[test]
fn test_circuit_gate_runs_before_rate_limit() {
    let config = MeshConfig {
        circuit_failure_threshold: 1,
        circuit_recovery_timeout_ms: 1_500,
        ..Default::default()
    };
    let (gateway, clock) = gateway_with(config);
    gateway.initialize(&[seed("api", &[("10.0.0.1", "v1")])]).unwrap();
    gateway.policies().set_rate_limit("api", 1.0, Some(1.0)).unwrap();

    let mut statuses = Vec::new();

    statuses.push(gateway.route_request("api", RouteRequest::new("r1")).status);
    gateway.record_result("api", "r1", false, None);

    // Bucket is empty here, so only the circuit gate can explain the rejection.
    statuses.push(gateway.route_request("api", RouteRequest::new("r2")).status);

    // The bucket refills here; a rejected request must leave the token alone.
    clock.advance(Duration::from_secs(1));
    statuses.push(gateway.route_request("api", RouteRequest::new("r3")).status);

    clock.advance(Duration::from_millis(500));
    let recovered = gateway.route_request("api", RouteRequest::new("r4"));
    statuses.push(recovered.status);
    assert_eq!(recovered.instance.unwrap().host, "10.0.0.1");

    statuses.push(gateway.route_request("api", RouteRequest::new("r5")).status);

    assert_eq!(
        statuses,
        vec![
            RouteStatus::Routed,
            RouteStatus::CircuitOpen,
            RouteStatus::CircuitOpen,
            RouteStatus::Routed,
            RouteStatus::RateLimited,
        ]
    );
    assert_eq!(gateway.policies().stats().rate_limited, 1);
    assert_eq!(gateway.circuit_breaker().get_state("api"), CircuitState::HalfOpen);

    gateway.record_result("api", "r4", true, None);
    assert_eq!(gateway.circuit_breaker().get_state("api"), CircuitState::Closed);
}

#[test]
fn test_rate_limit_and_access_gates() {
    let (gateway, clock) = gateway_with(MeshConfig::default());
    gateway.initialize(&[seed("api", &[("10.0.0.1", "v1")])]).unwrap();
    gateway.policies().set_rate_limit("api", 1.0, Some(1.0)).unwrap();
    gateway
        .policies()
        .set_access_policy("api", vec![], vec!["untrusted".to_string()]);

    let denied = gateway.route_request("api", RouteRequest::new("r0").with_source("untrusted"));
    assert_eq!(denied.status, RouteStatus::AccessDenied);

    assert!(gateway.route_request("api", RouteRequest::new("r1")).is_routed());
    let limited = gateway.route_request("api", RouteRequest::new("r2"));
    assert_eq!(limited.status, RouteStatus::RateLimited);
    assert!(matches!(
        limited.into_result(),
        Err(MeshError::RateLimited { retry_after, .. }) if retry_after == Duration::from_secs(1)
    ));

    clock.advance(Duration::from_secs(1));
    assert!(gateway.route_request("api", RouteRequest::new("r3")).is_routed());

    let stats = gateway.policies().stats();
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.access_denied, 1);
}

#[test]
fn test_canary_promote_and_rollback() {
    let (gateway, _) = gateway_with(MeshConfig::default());
    gateway
        .initialize(&[seed("api", &[("stable", "v1"), ("canary", "v2")])])
        .unwrap();

    gateway.traffic().setup_canary("api", "v2", 100.0).unwrap();
    for i in 0..10 {
        let decision = gateway.route_request("api", RouteRequest::new(format!("c{i}")));
        assert_eq!(decision.instance.unwrap().host, "canary");
    }

    assert!(gateway.traffic().rollback_canary("api"));
    let hosts: Vec<String> = (0..4)
        .map(|i| {
            gateway
                .route_request("api", RouteRequest::new(format!("d{i}")))
                .instance
                .unwrap()
                .host
        })
        .collect();
    assert!(hosts.contains(&"stable".to_string()));
    assert!(hosts.contains(&"canary".to_string()));

    gateway.traffic().setup_canary("api", "v2", 0.0).unwrap();
    assert_eq!(gateway.traffic().promote_canary("api").as_deref(), Some("v2"));
    let promoted = gateway.route_request("api", RouteRequest::new("p1"));
    assert_eq!(promoted.version.as_deref(), Some("v2"));
    assert_eq!(promoted.instance.unwrap().host, "canary");
}

#[test]
fn test_concurrent_failures_open_once() {
    let (gateway, _) = gateway_with(MeshConfig::default());
    let gateway = Arc::new(gateway);

    thread::scope(|scope| {
        for t in 0..8 {
            let gateway = Arc::clone(&gateway);
            scope.spawn(move || {
                for i in 0..50 {
                    gateway.record_result("api", &format!("t{t}-{i}"), false, None);
                }
            });
        }
    });

    let metrics = gateway.circuit_breaker().get_metrics("api").unwrap();
    assert_eq!(metrics.state, CircuitState::Open);
    assert_eq!(metrics.total_failures, 400);
    assert_eq!(metrics.times_opened, 1);
}

#[test]
fn test_concurrent_routing_balances_connections() {
    let (gateway, _) = gateway_with(MeshConfig {
        lb_algorithm: LoadBalancingPolicy::LeastConnections,
        ..Default::default()
    });
    gateway
        .initialize(&[seed("api", &[("a", "v1"), ("b", "v1")])])
        .unwrap();
    let gateway = Arc::new(gateway);

    thread::scope(|scope| {
        for t in 0..4 {
            let gateway = Arc::clone(&gateway);
            scope.spawn(move || {
                for i in 0..25 {
                    let id = format!("t{t}-{i}");
                    let decision = gateway.route_request("api", RouteRequest::new(id.as_str()));
                    assert!(decision.is_routed());
                    gateway.record_result("api", &id, true, None);
                }
            });
        }
    });

    assert_eq!(gateway.request_count(), 100);
    assert_eq!(gateway.load_balancer().total_connections(), 0);
    assert_eq!(gateway.snapshot().in_flight, 0);
}

#[test]
fn test_deadline_propagation_and_timeouts() {
    let (gateway, clock) = gateway_with(MeshConfig::default());
    let deadlines = gateway.deadlines();
    deadlines
        .set_timeout("db", TimeoutConfig::default().with_request(Duration::from_secs(60)))
        .unwrap();

    deadlines.start_request("parent", "api", None);
    clock.advance(Duration::from_secs(10));

    let child = deadlines.propagate_deadline("parent", "child", "db");
    assert_eq!(child.remaining, Duration::from_secs(20));

    let orphan = deadlines.propagate_deadline("missing", "orphan", "db");
    assert_eq!(orphan.remaining, Duration::from_secs(60));

    clock.advance(Duration::from_secs(25));
    let check = deadlines.check_timeout("child").unwrap();
    assert!(check.timed_out);
    assert!(matches!(
        check.into_result("child"),
        Err(MeshError::TimedOut { .. })
    ));
    deadlines.check_timeout("child");
    assert_eq!(deadlines.timeout_count(), 1);
    assert!(!deadlines.check_timeout("orphan").unwrap().timed_out);
}

#[test]
fn test_retry_budget_shared_across_requests() {
    let (gateway, _) = gateway_with(MeshConfig::default());
    gateway.initialize(&[seed("api", &[("a", "v1")])]).unwrap();
    gateway.retry_policy().set_budget("api", 1);

    gateway.route_request("api", RouteRequest::new("r1"));
    let first = gateway.record_result("api", "r1", false, None).retry.unwrap();
    assert!(first.retry);

    gateway.route_request("api", RouteRequest::new("r2"));
    let second = gateway.record_result("api", "r2", false, None).retry.unwrap();
    assert!(!second.retry);
    assert_eq!(second.reason, Some(RetryStopReason::BudgetExhausted));

    let analytics = gateway.analytics();
    assert_eq!(analytics.retry_decisions, 2);
    assert_eq!(analytics.retries_refused, 1);
}

#[test]
fn test_sticky_sessions_through_gateway() {
    let (gateway, _) = gateway_with(MeshConfig::default());
    gateway
        .initialize(&[seed("api", &[("a", "v1"), ("b", "v1"), ("c", "v1")])])
        .unwrap();

    let first = gateway
        .route_request("api", RouteRequest::new("s1").with_session("user-7"))
        .instance
        .unwrap();
    for i in 0..5 {
        let again = gateway
            .route_request("api", RouteRequest::new(format!("s{}", i + 2)).with_session("user-7"))
            .instance
            .unwrap();
        assert_eq!(again.key(), first.key());
    }
    assert_eq!(gateway.load_balancer().clear_sticky(Some("user-7")), 1);
}

#[test]
fn test_gateways_do_not_share_state() {
    let (first, _) = gateway_with(MeshConfig::default());
    let (second, _) = gateway_with(MeshConfig::default());
    first.initialize(&[seed("api", &[("a", "v1")])]).unwrap();
    first.route_request("api", RouteRequest::new("r1"));
    first.circuit_breaker().force_open("api");

    assert_eq!(second.registry().service_count(), 0);
    assert_eq!(second.request_count(), 0);
    assert_eq!(second.circuit_breaker().get_state("api"), CircuitState::Closed);
    assert!(!second.metrics().encode().unwrap().contains("service=\"api\""));
}

#[test]
fn test_config_from_toml_seeds_gateway() {
    let config = MeshConfig::from_toml(
        r#"
        lb_algorithm = "least_connections"
        proxy_id = "edge-1"

        [[services]]
        name = "api"

        [[services.instances]]
        host = "10.0.0.1"
        port = 8080
        version = "v1"
        "#,
    )
    .unwrap();
    let seeds = config.services.clone();
    let (gateway, _) = gateway_with(config);

    assert_eq!(gateway.initialize(&seeds).unwrap(), 1);
    assert_eq!(gateway.proxy().proxy_id(), "edge-1");
    assert_eq!(
        gateway.load_balancer().algorithm(),
        LoadBalancingPolicy::LeastConnections
    );
    assert!(gateway.route_request("api", RouteRequest::new("r1")).is_routed());
}
