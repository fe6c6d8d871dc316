//! # rawfile-csi
//!
//! Node-local CSI driver: every volume is a sparse file under the backing
//! directory, attached through a loop device and mounted on publish.
//!
//! The same binary runs the controller, the node plugin, or both (`--mode`).
//! In-cluster it talks to the Kubernetes API for volume records and for
//! node-pinned snapshot jobs; `--standalone` runs without a cluster.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use libcsi::backend::rawfile::config::{DEFAULT_BACKING_DIR, DEFAULT_DRIVER_NAME};
use libcsi::backend::rawfile::{
    GarbageCollector, HostExecutor, LocalNodeExecutor, NodeExecutor, RawfileConfig,
    RawfileController, RawfileIdentity, RawfileNode, VolumeRegistry, VolumeStore,
};
use libcsi::transport::CsiServer;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod kube;
mod metrics;

use kube::KubeClient;

const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/rk8s.rawfile.csi/csi.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Controller,
    Node,
    Both,
}

impl Mode {
    fn runs_controller(self) -> bool {
        matches!(self, Self::Controller | Self::Both)
    }

    fn runs_node(self) -> bool {
        matches!(self, Self::Node | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Raw-file CSI driver for RK8s
#[derive(Debug, Parser)]
#[command(name = "rawfile-csi")]
#[command(version, about, long_about = None)]
struct Cli {
    /// CSI endpoint (`unix://` socket)
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Driver name reported to the kubelet
    #[arg(long = "drivername", env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Node id (default: OS hostname)
    #[arg(long = "nodeid", env = "NODE_NAME")]
    node_id: Option<String>,

    /// Directory holding backing files and snapshots
    #[arg(long, env = "CSI_BACKING_DIR", default_value = DEFAULT_BACKING_DIR)]
    backing_dir: PathBuf,

    /// Which CSI services to run
    #[arg(long, env = "CSI_MODE", value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Run without the Kubernetes API (no registry, garbage collection skipped)
    #[arg(long)]
    standalone: bool,

    /// Seconds between two garbage-collection passes
    #[arg(long, env = "CSI_GC_INTERVAL_SECS", default_value_t = 300)]
    gc_interval: u64,

    /// Prometheus exporter port (0 disables)
    #[arg(long, env = "CSI_METRICS_PORT", default_value_t = 9100)]
    metrics_port: u16,

    /// Log output format
    #[arg(long, env = "CSI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log level when RUST_LOG is unset
    #[arg(long, env = "CSI_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    let node_id = match cli.node_id.clone().filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => hostname::get()
            .context("failed to read hostname")?
            .to_string_lossy()
            .into_owned(),
    };
    let config = Arc::new(
        RawfileConfig::new(&node_id, &cli.backing_dir)
            .with_driver_name(&cli.driver_name)
            .with_gc_interval(Duration::from_secs(cli.gc_interval)),
    );
    info!(
        driver = %config.driver_name,
        node = %config.node_id,
        backing_dir = %config.backing_dir.display(),
        mode = ?cli.mode,
        standalone = cli.standalone,
        "starting rawfile-csi"
    );

    let (registry, executor): (Option<Arc<dyn VolumeRegistry>>, Arc<dyn NodeExecutor>) =
        if cli.standalone {
            let local: Arc<dyn NodeExecutor> = Arc::new(LocalNodeExecutor::new(&node_id));
            (None, local)
        } else {
            let kube = Arc::new(KubeClient::in_cluster()?);
            info!(namespace = kube.namespace(), "using in-cluster Kubernetes API");
            let registry: Arc<dyn VolumeRegistry> = kube.clone();
            let executor: Arc<dyn NodeExecutor> = kube;
            (Some(registry), executor)
        };

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let identity = RawfileIdentity::new(config.clone(), cli.mode.runs_controller());
    let mut server = CsiServer::new(Arc::new(identity));

    if cli.mode.runs_controller() {
        let mut controller = RawfileController::new(config.clone()).with_executor(executor);
        if let Some(registry) = &registry {
            controller = controller.with_registry(registry.clone());
        }
        server = server.with_controller(Arc::new(controller));
    }

    if cli.mode.runs_node() {
        let node = RawfileNode::new(config.clone(), Arc::new(HostExecutor));
        server = server.with_node(Arc::new(node));

        let gc = GarbageCollector::new(config.clone(), registry.clone());
        tasks.push(tokio::spawn(gc.run(config.gc_interval, shutdown.clone())));

        if cli.metrics_port != 0 {
            metrics::install(cli.metrics_port)?;
            tasks.push(tokio::spawn(metrics::run(
                VolumeStore::new(&config.backing_dir),
                node_id.clone(),
                metrics::REFRESH_INTERVAL,
                shutdown.clone(),
            )));
        }
    }

    let signals = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => warn!(error = %e, "failed to listen for signals, shutting down"),
        }
        signals.cancel();
    });

    let served = server.serve(&cli.endpoint, shutdown.clone()).await;
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    served.with_context(|| format!("CSI server on {} failed", cli.endpoint))?;

    info!("rawfile-csi stopped");
    Ok(())
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}
