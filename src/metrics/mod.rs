//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Polling progress and cadence per chain
//! - Endpoint pool health
//! - Receipt resolution, matches and tracked outcomes
//! - Dispatch results

use crate::error::{EngineError, EngineResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "vault_observer_block_height",
        "Last block height fetched per chain",
        &["chain"]
    ).unwrap();

    pub static ref POLL_INTERVAL: GaugeVec = register_gauge_vec!(
        "vault_observer_poll_interval_seconds",
        "Current adaptive polling interval per chain",
        &["chain"]
    ).unwrap();

    pub static ref HEALTHY_ENDPOINTS: GaugeVec = register_gauge_vec!(
        "vault_observer_healthy_endpoints",
        "Healthy RPC endpoints after the last pool refresh",
        &["chain"]
    ).unwrap();

    // Receipt metrics
    pub static ref RECEIPTS: CounterVec = register_counter_vec!(
        "vault_observer_receipts_total",
        "Receipt lookups by outcome",
        &["chain", "outcome"]
    ).unwrap();

    // Transaction metrics
    pub static ref MATCHED_TXS: CounterVec = register_counter_vec!(
        "vault_observer_matched_transactions_total",
        "Transactions sent to the vault",
        &["chain"]
    ).unwrap();

    pub static ref TRACK_UPDATES: CounterVec = register_counter_vec!(
        "vault_observer_track_updates_total",
        "Tracked transaction outcomes",
        &["chain", "result"]
    ).unwrap();

    pub static ref DISPATCHES: CounterVec = register_counter_vec!(
        "vault_observer_dispatches_total",
        "Dispatch requests by outcome",
        &["chain", "outcome"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Internal(format!("Cannot bind metrics server on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| EngineError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_block_height(chain: &str, height: u64) {
    CHAIN_BLOCK_HEIGHT.with_label_values(&[chain]).set(height as f64);
}

pub fn record_poll_interval(chain: &str, interval: Duration) {
    POLL_INTERVAL
        .with_label_values(&[chain])
        .set(interval.as_secs_f64());
}

pub fn record_healthy_endpoints(chain: &str, healthy: usize) {
    HEALTHY_ENDPOINTS.with_label_values(&[chain]).set(healthy as f64);
}

pub fn record_receipt_resolved(chain: &str) {
    RECEIPTS.with_label_values(&[chain, "resolved"]).inc();
}

pub fn record_receipt_dropped(chain: &str) {
    RECEIPTS.with_label_values(&[chain, "dropped"]).inc();
}

pub fn record_matched_txs(chain: &str, count: usize) {
    MATCHED_TXS.with_label_values(&[chain]).inc_by(count as f64);
}

pub fn record_track_update(chain: &str, result: &str) {
    TRACK_UPDATES.with_label_values(&[chain, result]).inc();
}

/// `outcome` is "success" or a dispatch error kind
pub fn record_dispatch(chain: &str, outcome: &str) {
    DISPATCHES.with_label_values(&[chain, outcome]).inc();
}
