//! Prometheus metrics for the keva operator.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Prometheus text exposition format.
const SCRAPE_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

lazy_static::lazy_static! {
    /// Total reconciliation ticks
    pub static ref RECONCILES: CounterVec = register_counter_vec!(
        "keva_operator_reconciles_total",
        "Total number of reconciliation ticks",
        &["cluster", "result"]
    ).unwrap();

    /// Reconciliation tick duration
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "keva_operator_reconcile_duration_seconds",
        "Duration of reconciliation ticks",
        &["cluster"]
    ).unwrap();

    /// Number of managed clusters
    pub static ref CLUSTER_COUNT: GaugeVec = register_gauge_vec!(
        "keva_operator_clusters",
        "Number of managed keva clusters",
        &["namespace"]
    ).unwrap();

    /// Members per cluster
    pub static ref MEMBER_COUNT: GaugeVec = register_gauge_vec!(
        "keva_operator_members",
        "Number of members per cluster",
        &["cluster"]
    ).unwrap();

    /// Mailbox events dropped because the controller stopped or the queue was full
    pub static ref EVENTS_DROPPED: CounterVec = register_counter_vec!(
        "keva_operator_events_dropped_total",
        "Number of dropped controller events",
        &["cluster", "reason"]
    ).unwrap();

    /// Disaster recoveries attempted
    pub static ref RECOVERIES: CounterVec = register_counter_vec!(
        "keva_operator_recoveries_total",
        "Number of disaster recovery attempts",
        &["cluster", "result"]
    ).unwrap();
}

/// Serve the registry on `GET /metrics`. Anything else gets a 404 so a
/// misconfigured scrape config fails loudly instead of ingesting garbage.
pub async fn run_metrics_server(port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(port, error = %err, "failed to bind metrics port");
            return;
        }
    };
    info!(port, "metrics endpoint listening");

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_scrape(stream));
            }
            Err(err) => {
                warn!(error = %err, "metrics accept failed");
            }
        }
    }
}

async fn handle_scrape(stream: TcpStream) {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await.is_err() {
        return;
    }

    let (status, body) = if request_line.starts_with("GET /metrics") {
        match TextEncoder::new().encode_to_string(&prometheus::gather()) {
            Ok(text) => ("200 OK", text),
            Err(err) => {
                warn!(error = %err, "failed to encode metrics");
                ("500 Internal Server Error", String::new())
            }
        }
    } else {
        ("404 Not Found", String::new())
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        SCRAPE_CONTENT_TYPE,
        body.len(),
        body
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Record a completed reconciliation tick
pub fn record_reconcile(cluster: &str, ok: bool, duration_secs: f64) {
    let result = if ok { "success" } else { "failure" };
    RECONCILES.with_label_values(&[cluster, result]).inc();
    RECONCILE_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

/// Update the managed cluster gauge
pub fn set_cluster_count(namespace: &str, count: f64) {
    CLUSTER_COUNT.with_label_values(&[namespace]).set(count);
}

/// Update the member gauge for a cluster
pub fn set_member_count(cluster: &str, count: f64) {
    MEMBER_COUNT.with_label_values(&[cluster]).set(count);
}

/// Record a dropped mailbox event
pub fn record_dropped_event(cluster: &str, reason: &str) {
    EVENTS_DROPPED.with_label_values(&[cluster, reason]).inc();
}

/// Record a disaster recovery attempt
pub fn record_recovery(cluster: &str, ok: bool) {
    let result = if ok { "success" } else { "failure" };
    RECOVERIES.with_label_values(&[cluster, result]).inc();
}
