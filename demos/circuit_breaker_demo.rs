//! Circuit breaker demonstration.
//!
//! Routes requests for one service through a gateway while the simulated
//! upstream fails, then watches the circuit open, probe and recover.
//!
//! Run with:
//! ```bash
//! cargo run --example circuit_breaker_demo
//! ```

use servicemesh_core::circuit_breaker::CircuitState;
use servicemesh_core::config::{InstanceSeed, ServiceSeed};
use servicemesh_core::{MeshConfig, MeshGateway, RouteRequest, RouteStatus};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    info!("Circuit Breaker Demonstration");
    info!("==============================\n");

    let config = MeshConfig {
        circuit_failure_threshold: 3,
        circuit_recovery_timeout_ms: 2_000,
        circuit_success_threshold: 2,
        ..Default::default()
    };

    info!("Configuration:");
    info!("  Failure threshold: {}", config.circuit_failure_threshold);
    info!("  Recovery timeout: {}ms", config.circuit_recovery_timeout_ms);
    info!("  Success threshold: {}\n", config.circuit_success_threshold);

    let gateway = MeshGateway::new(config)?;
    gateway.initialize(&[ServiceSeed {
        name: "payments".to_string(),
        instances: vec![InstanceSeed {
            host: "10.0.0.7".to_string(),
            port: 8443,
            version: None,
            metadata: HashMap::new(),
            ttl_ms: None,
        }],
    }])?;
    gateway
        .circuit_breaker()
        .set_fallback("payments", || serde_json::json!({"status": "queued"}));

    info!("Scenario 1: Failures open the circuit");
    for i in 1..=3 {
        let id = format!("req-{i}");
        if call(&gateway, &id, false).await == RouteStatus::Routed {
            info!("  Request #{} routed and failed", i);
        }
    }
    let state = gateway.circuit_breaker().get_state("payments");
    info!("State: {}\n", state);
    assert_eq!(state, CircuitState::Open);

    info!("Scenario 2: Requests short-circuit to the fallback");
    let decision = gateway.route_request("payments", RouteRequest::new("req-4"));
    warn!("  Status: {}, fallback: {:?}\n", decision.status, decision.fallback);

    info!("Scenario 3: Recovery timeout admits probes");
    sleep(Duration::from_secs(2)).await;
    for i in 5..=6 {
        let status = call(&gateway, &format!("req-{i}"), true).await;
        info!("  Probe #{} {}", i, status);
    }
    let state = gateway.circuit_breaker().get_state("payments");
    info!("State: {}\n", state);
    assert_eq!(state, CircuitState::Closed);

    info!("Final Statistics:");
    if let Some(metrics) = gateway.circuit_breaker().get_metrics("payments") {
        info!("  Total calls: {}", metrics.total_calls);
        info!("  Total failures: {}", metrics.total_failures);
        info!("  Times opened: {}", metrics.times_opened);
    }
    let analytics = gateway.analytics();
    info!("  Routed ratio: {:.1}%", analytics.routed_ratio * 100.0);

    info!("\nDemo complete!");
    Ok(())
}

/// Routes one request and reports a simulated outcome when it was routed.
async fn call(gateway: &MeshGateway, request_id: &str, success: bool) -> RouteStatus {
    let decision = gateway.route_request("payments", RouteRequest::new(request_id));
    if decision.is_routed() {
        sleep(Duration::from_millis(10)).await;
        gateway.record_result("payments", request_id, success, None);
    }
    decision.status
}
