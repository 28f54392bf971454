use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, ValueEnum};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpc_route_cloud::{CloudConfig, VpcRouteClient};
use vpc_route_core::{NodeRouteCache, RouteProtocol};

mod cluster;
mod events;
mod metrics;
mod predicate;
mod route_controller;

use cluster::KubeNodeSource;
use events::KubeEventSink;
use metrics::RouteMetrics;
use predicate::NodeEventFilter;
use route_controller::{watch_nodes, ControllerConfig, RouteReconciler, MIN_RECONCILE_PERIOD};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum InstanceIdFrom {
    /// Node annotations written by the node agent
    Annotation,
    /// spec.providerID
    ProviderId,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Programs VPC routes for node pod CIDRs", long_about = None)]
struct Args {
    /// Seconds between full route syncs (at least 60)
    #[arg(long, env = "ROUTE_RECONCILIATION_PERIOD", default_value_t = 300)]
    route_reconciliation_period: u64,

    /// Create and delete routes; when false the controller only watches
    #[arg(long, env = "CONFIGURE_ROUTES", default_value_t = true, action = ArgAction::Set)]
    configure_routes: bool,

    /// Where node instance ids come from
    #[arg(long, env = "INSTANCE_ID_FROM", value_enum, default_value_t = InstanceIdFrom::Annotation)]
    instance_id_from: InstanceIdFrom,

    /// Deadline in seconds for one node reconcile or one full sync
    #[arg(long, env = "RECONCILE_TIMEOUT", default_value_t = 120)]
    reconcile_timeout: u64,

    /// Seconds before a failed node reconcile is retried
    #[arg(long, env = "REQUEUE_DELAY", default_value_t = 15)]
    requeue_delay: u64,

    /// Address of the metrics and health endpoint
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        let mut period = Duration::from_secs(self.route_reconciliation_period);
        if period < MIN_RECONCILE_PERIOD {
            warn!(
                "Route reconciliation period {}s is below the minimum, using {}s",
                period.as_secs(),
                MIN_RECONCILE_PERIOD.as_secs()
            );
            period = MIN_RECONCILE_PERIOD;
        }
        ControllerConfig {
            configure_routes: self.configure_routes,
            reconcile_period: period,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout),
            requeue_delay: Duration::from_secs(self.requeue_delay),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting vpc-route-controller v{}", env!("CARGO_PKG_VERSION"));

    let cloud_config = CloudConfig::from_env()?;
    info!(
        vpc_id = %cloud_config.vpc_id,
        endpoint = %cloud_config.network_endpoint,
        region = %cloud_config.region,
        "Loaded cloud configuration"
    );
    let gateway = Arc::new(VpcRouteClient::new(cloud_config)?);
    let protocol = Arc::new(RouteProtocol::new(gateway));

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let metrics = Arc::new(RouteMetrics::new()?);
    let reconciler = Arc::new(RouteReconciler::new(
        protocol,
        NodeRouteCache::new(),
        Arc::new(KubeNodeSource::new(client.clone())),
        Arc::new(KubeEventSink::new(client.clone())),
        metrics.clone(),
        args.controller_config(),
    ));

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    if args.configure_routes {
        tokio::spawn(reconciler.clone().run_periodic());
    } else {
        info!("Route configuration disabled, node events will be ignored");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(reconciler.clone().run_worker(rx, tx.clone()));

    let filter = NodeEventFilter::new(args.instance_id_from == InstanceIdFrom::Annotation);
    let nodes: Api<Node> = Api::all(client);
    tokio::spawn(async move {
        if let Err(e) = watch_nodes(nodes, filter, tx).await {
            error!("Node watcher error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting...");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["vpc-route-controller"]);
        assert!(args.configure_routes);
        assert_eq!(args.instance_id_from, InstanceIdFrom::Annotation);

        let config = args.controller_config();
        assert_eq!(config.reconcile_period, Duration::from_secs(300));
        assert_eq!(config.reconcile_timeout, Duration::from_secs(120));
        assert_eq!(config.requeue_delay, Duration::from_secs(15));
    }

    #[test]
    fn test_period_floor_and_flags() {
        let args = Args::parse_from([
            "vpc-route-controller",
            "--route-reconciliation-period",
            "10",
            "--configure-routes",
            "false",
            "--instance-id-from",
            "provider-id",
        ]);
        assert!(!args.configure_routes);
        assert_eq!(args.instance_id_from, InstanceIdFrom::ProviderId);
        assert_eq!(args.controller_config().reconcile_period, MIN_RECONCILE_PERIOD);
    }
}
