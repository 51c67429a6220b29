//! keva Kubernetes Operator
//!
//! Manages keva replicated key-value clusters on Kubernetes.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use keva_operator::backup::HttpBackupStoreProvider;
use keva_operator::cluster;
use keva_operator::controller::Controller;
use keva_operator::k8s::KubeClient;
use keva_operator::metrics;
use keva_operator::replica::HttpReplicaAdmin;

#[derive(Parser, Debug)]
#[command(name = "keva-operator")]
#[command(about = "Kubernetes operator for keva replicated key-value clusters")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, default_value = "")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "8080")]
    metrics_port: u16,

    /// Health check port
    #[arg(short = 'H', long, default_value = "8081")]
    health_port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting keva operator");
    info!(namespace = %args.namespace, "Watching namespace");

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port));
    let health_handle = tokio::spawn(run_health_server(args.health_port));

    let client = kube::Client::try_default().await?;
    let config = cluster::Config {
        kube: Arc::new(KubeClient::new(client.clone())),
        replica: Arc::new(HttpReplicaAdmin::new()),
        backup_stores: Arc::new(HttpBackupStoreProvider),
    };
    let controller = Controller::new(client, args.namespace, config);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            let _ = stop_tx.send(true);
        }
    });

    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(stop_rx).await {
            error!(error = %e, "controller error");
        }
    });

    tokio::select! {
        _ = controller_handle => info!("controller stopped"),
        _ = metrics_handle => info!("metrics server stopped"),
        _ = health_handle => info!("health server stopped"),
    }

    Ok(())
}

/// Liveness probe endpoint. Accepting the connection is the health signal,
/// so the handler answers unconditionally and hangs up without reading the
/// request.
async fn run_health_server(port: u16) {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const RESPONSE: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";

    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(port, error = %err, "failed to bind health port");
            return;
        }
    };
    info!(port, "health endpoint listening");

    loop {
        if let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(RESPONSE).await;
                let _ = stream.shutdown().await;
            });
        }
    }
}
