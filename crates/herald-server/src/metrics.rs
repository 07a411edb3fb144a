//! Prometheus export.
//!
//! The hub records through the `metrics` facade; this module describes those
//! metrics and installs an exporter with its own HTTP listener.

use anyhow::{Context, Result};
use herald_core::metrics::names;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tracing::info;

/// Write latency buckets, in seconds. Writes are usually sub-millisecond; the
/// tail reaches toward the write timeout.
const WRITE_LATENCY_BUCKETS: &[f64] = &[
    0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0,
];

/// Describe the hub metrics.
pub fn init_metrics() {
    herald_core::metrics::describe();
    info!("Metrics initialized");
}

/// Install the Prometheus exporter listening on `port`.
///
/// # Errors
///
/// Returns an error if the exporter cannot be built or its listener bound.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full(names::WRITE_LATENCY_SECONDS.to_string()),
            WRITE_LATENCY_BUCKETS,
        )
        .context("Invalid latency buckets")?
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {addr}"))?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets_sorted() {
        assert!(WRITE_LATENCY_BUCKETS.windows(2).all(|w| w[0] < w[1]));
    }
}
