use servicemesh_core::{MeshConfig, MeshGateway};
use std::path::Path;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting service mesh core");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("MESH_CONFIG_PATH") {
        Ok(path) => MeshConfig::from_file(Path::new(&path))?,
        Err(_) => MeshConfig::from_env()?,
    };
    config.validate()?;
    info!(
        "config: proxy_id={}, enabled={}, lb={}, timeout={}ms, services={}",
        config.proxy_id,
        config.enabled,
        config.lb_algorithm,
        config.default_timeout_ms,
        config.services.len()
    );

    let sweep_every = config.sweep_interval();
    let seeds = config.services.clone();
    let gateway = MeshGateway::new(config)?;
    gateway.initialize(&seeds)?;

    let mut ticker = interval(sweep_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, initiating graceful shutdown");
                break;
            }
            _ = ticker.tick() => {
                let removed = gateway.cleanup_expired();
                if removed > 0 {
                    info!(removed, "expired instances swept");
                }
                let snapshot = gateway.snapshot();
                debug!(
                    services = snapshot.services.len(),
                    instances = snapshot.total_instances,
                    healthy = snapshot.healthy_instances,
                    open_circuits = snapshot.open_circuits,
                    "mesh snapshot"
                );
            }
        }
    }

    info!(requests = gateway.request_count(), "shutdown complete");
    Ok(())
}
