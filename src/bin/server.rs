//! telefed server binary
//!
//! Accepts agent uploads over HTTP and partitions them across the cluster.

use telefed::api::{self, ApiServerConfig};
use telefed::cluster::{ClusterCoordinator, ForwardMetrics, Gossip, Membership};
use telefed::config::{ComponentFactory, ServerConfig};
use telefed::telemetry::Telemetry;
use telefed::Error;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// telefed server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unique node name within the cluster
    #[arg(long, env = "TELEFED_NAME")]
    name: String,

    /// HTTP listen address
    #[arg(long, env = "TELEFED_LISTEN", default_value = "0.0.0.0:9003")]
    listen: SocketAddr,

    /// Gossip bind address
    #[arg(long, env = "TELEFED_CLUSTER_BIND", default_value = "0.0.0.0:7946")]
    cluster_bind: String,

    /// Gossip address advertised to peers, required with a wildcard bind
    #[arg(long, env = "TELEFED_CLUSTER_ADVERTISE")]
    cluster_advertise: Option<String>,

    /// Gossip seeds, comma separated
    #[arg(long, env = "TELEFED_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// File holding the 32-byte cluster secret
    #[arg(long, env = "TELEFED_SECRET_FILE")]
    secret_file: Option<PathBuf>,

    /// Seconds a partition is kept after its newest sample
    #[arg(long, env = "TELEFED_STORE_TTL_SECS", default_value = "600")]
    store_ttl_secs: u64,

    /// Minimum seconds between writes to one partition (0 disables)
    #[arg(long, env = "TELEFED_WRITE_INTERVAL_SECS", default_value = "0")]
    write_interval_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            node_name: self.name,
            http_addr: self.listen,
            cluster_bind: self.cluster_bind,
            cluster_advertise: self.cluster_advertise,
            seeds: self.seeds.into_iter().filter(|s| !s.trim().is_empty()).collect(),
            secret_file: self.secret_file,
            store_ttl: Duration::from_secs(self.store_ttl_secs),
            write_interval: (self.write_interval_secs > 0)
                .then(|| Duration::from_secs(self.write_interval_secs)),
            log_level: self.log_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Args::parse().into_config();
    config.validate()?;

    let telemetry = Telemetry::init("telefed-server", &config.node_name, &config.log_level)?;
    info!(node = %config.node_name, "Starting telefed server");

    let shutdown = CancellationToken::new();

    let (memory, store) = ComponentFactory::create_store(&config, &telemetry.meter("telefed.store"));
    let cleaner = memory.clone();
    let cleaner_shutdown = shutdown.clone();
    tokio::spawn(async move {
        cleaner
            .run_cleaner(Duration::from_secs(30), cleaner_shutdown)
            .await;
    });

    let coordinator = Arc::new(ClusterCoordinator::new(
        config.cluster_config(),
        store,
        ForwardMetrics::new(&telemetry.meter("telefed.cluster")),
    ));

    let gossip = match config.gossip_config()? {
        Some(gossip_config) => {
            let gossip =
                Gossip::bind(gossip_config, coordinator.clone(), shutdown.clone()).await?;
            coordinator.start(gossip.clone(), shutdown.clone())?;

            if !config.seeds.is_empty() {
                match gossip.join(&config.seeds).await {
                    Ok(joined) => info!(joined, "Joined cluster seeds"),
                    // Peers can still join through this node
                    Err(e) => warn!(error = %e, "Unable to join cluster seeds"),
                }
            }
            Some(gossip)
        }
        None => {
            info!("No cluster secret configured, running as a single node");
            None
        }
    };

    let api_config = ApiServerConfig {
        meter: telemetry.meter("telefed.api.http"),
        metrics_registry: telemetry.metrics_registry(),
        ..Default::default()
    };
    let router = api::build_http_router(coordinator.clone(), &api_config);
    let listener = TcpListener::bind(config.http_addr).await?;
    info!(http_addr = %config.http_addr, "telefed server ready");

    let http_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        http_shutdown.cancel();
    });

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))?;

    info!("telefed server shutting down");
    if let Some(gossip) = gossip {
        gossip.leave().await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
