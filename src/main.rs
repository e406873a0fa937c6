//! blobgate -- blob storage gateway.
//!
//! SIGTERM/SIGINT handlers only stop accepting connections and wait for
//! in-flight requests, bounded by `server.shutdown_timeout`.  A record whose
//! upload was cut off never got its metadata, so it stays invisible.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blobgate::config::LoggingConfig;

/// Command-line arguments for the blobgate server.
#[derive(Parser, Debug)]
#[command(name = "blobgate", version, about = "Blob storage gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "blobgate.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

/// Initialize tracing; `RUST_LOG` overrides the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = blobgate::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        blobgate::metrics::init_metrics()?;
        blobgate::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);

    let state = blobgate::AppState::initialize(config).await?;
    info!(
        "Storage provider {} ready ({:?} records)",
        state.storage.name(),
        state.storage.kind()
    );

    let app = blobgate::server::app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("blobgate listening on {}", bind_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(());
        })
        .into_future();

    // Once a signal arrives, in-flight requests get `shutdown_timeout` to finish.
    let deadline = async move {
        if shutdown_rx.await.is_ok() {
            tokio::time::sleep(shutdown_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => warn!("Shutdown timeout elapsed, dropping open connections"),
    }

    info!("blobgate shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
