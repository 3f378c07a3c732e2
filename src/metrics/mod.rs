//! Prometheus metrics for the transaction manager

use axum::{routing::get, Router};
use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_gauge, register_gauge_vec, Counter, Encoder, Gauge, GaugeVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    pub static ref GAS_PRICE: Gauge = register_gauge!(
        "txmanager_gas_price_gwei",
        "Current controller gas price in gwei"
    )
    .unwrap();

    pub static ref BLOCK_HEIGHT: Gauge = register_gauge!(
        "txmanager_block_height",
        "Latest root chain head seen by the header tracker"
    )
    .unwrap();

    pub static ref QUEUE_SIZE: GaugeVec = register_gauge_vec!(
        "txmanager_queue_size",
        "Per-account queue sizes",
        &["account", "queue"]
    )
    .unwrap();

    pub static ref TX_SENT: Counter = register_counter!(
        "txmanager_transactions_sent_total",
        "Signed transaction variants submitted to the root chain"
    )
    .unwrap();

    pub static ref TX_MINED: Counter = register_counter!(
        "txmanager_transactions_mined_total",
        "Raw transactions that reached a receipt"
    )
    .unwrap();

    pub static ref TX_CONFIRMED: Counter = register_counter!(
        "txmanager_transactions_confirmed_total",
        "Raw transactions appended to the confirmed log"
    )
    .unwrap();

    pub static ref TX_REVERTED: Counter = register_counter!(
        "txmanager_transactions_reverted_total",
        "Mined transactions whose receipt carried status 0"
    )
    .unwrap();

    pub static ref TX_REORGED: Counter = register_counter!(
        "txmanager_transactions_reorged_total",
        "Mined transactions that dropped off the canonical chain"
    )
    .unwrap();

    pub static ref KNOWN_TX_RETRIES: Counter = register_counter!(
        "txmanager_known_tx_retries_total",
        "Known-transaction responses from the root chain node"
    )
    .unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_gas_price(price: U256) {
    let gwei = (price / U256::exp10(6)).as_u64() as f64 / 1_000.0;
    GAS_PRICE.set(gwei);
}

pub fn record_block_height(number: u64) {
    BLOCK_HEIGHT.set(number as f64);
}

pub fn record_queue_sizes(addr: Address, pending: usize, unconfirmed: usize, confirmed: usize) {
    let account = format!("{:?}", addr);
    QUEUE_SIZE
        .with_label_values(&[&account, "pending"])
        .set(pending as f64);
    QUEUE_SIZE
        .with_label_values(&[&account, "unconfirmed"])
        .set(unconfirmed as f64);
    QUEUE_SIZE
        .with_label_values(&[&account, "confirmed"])
        .set(confirmed as f64);
}

pub fn record_tx_sent() {
    TX_SENT.inc();
}

pub fn record_tx_mined() {
    TX_MINED.inc();
}

pub fn record_tx_confirmed() {
    TX_CONFIRMED.inc();
}

pub fn record_tx_reverted() {
    TX_REVERTED.inc();
}

pub fn record_tx_reorged() {
    TX_REORGED.inc();
}

pub fn record_known_tx_retry() {
    KNOWN_TX_RETRIES.inc();
}
