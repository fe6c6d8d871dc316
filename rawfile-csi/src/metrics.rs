//! Prometheus gauges for node capacity and per-volume usage.
//!
//! - `rawfile_remaining_capacity{node}`: free bytes in the backing directory
//! - `rawfile_volume_used{node,volume}`: bytes allocated by a backing file
//! - `rawfile_volume_total{node,volume}`: apparent size of a backing file

use std::time::Duration;

use anyhow::{Context, Result};
use libcsi::backend::rawfile::VolumeStore;
use libcsi::backend::rawfile::usage::{self, UsageReport};
use metrics::{describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Gauges not refreshed for this long are dropped, so volumes removed by the
/// garbage collector stop being exported.
const IDLE_TIMEOUT: Duration = Duration::from_secs(2 * REFRESH_INTERVAL.as_secs());

fn builder(idle: Duration) -> PrometheusBuilder {
    PrometheusBuilder::new().idle_timeout(MetricKindMask::GAUGE, Some(idle))
}

/// Install the global recorder and serve `/metrics` on `port`.
pub fn install(port: u16) -> Result<()> {
    builder(IDLE_TIMEOUT)
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("failed to install Prometheus exporter")?;

    describe_gauge!(
        "rawfile_remaining_capacity",
        "Free bytes left in the backing directory"
    );
    describe_gauge!(
        "rawfile_volume_used",
        "Bytes actually allocated by a volume's backing file"
    );
    describe_gauge!(
        "rawfile_volume_total",
        "Apparent size of a volume's backing file"
    );

    info!(port, "metrics exporter listening");
    Ok(())
}

fn record(node: &str, report: &UsageReport) {
    gauge!("rawfile_remaining_capacity", "node" => node.to_owned())
        .set(report.remaining_capacity as f64);
    for volume in &report.volumes {
        gauge!(
            "rawfile_volume_used",
            "node" => node.to_owned(),
            "volume" => volume.volume_id.clone()
        )
        .set(volume.used_bytes as f64);
        gauge!(
            "rawfile_volume_total",
            "node" => node.to_owned(),
            "volume" => volume.volume_id.clone()
        )
        .set(volume.total_bytes as f64);
    }
}

/// Refresh the gauges every `interval` until `shutdown` fires.
pub async fn run(
    store: VolumeStore,
    node_id: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("metrics collector stopped");
                return;
            }
            _ = ticker.tick() => {
                match usage::collect(&store).await {
                    Ok(report) => record(&node_id, &report),
                    Err(e) => warn!(error = %e, "failed to collect volume usage"),
                }
            }
        }
    }
}
