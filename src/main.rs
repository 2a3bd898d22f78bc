//! s3gateway -- S3-compatible gateway server.
//!
//! SIGTERM/SIGINT only stop accepting connections; in-flight requests get
//! `server.shutdown_timeout` seconds to finish before the process exits.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3gateway::config::{load_config, LoggingConfig};

/// Command-line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(name = "s3gateway", version, about = "S3-compatible gateway server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "s3gateway.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

/// Install the global tracing subscriber.  `RUST_LOG` wins over the
/// configured level.
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

    let config = load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli.bind.unwrap_or_else(|| config.server.bind_addr());

    if config.observability.metrics {
        s3gateway::metrics::init_metrics();
        s3gateway::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    info!(
        backend = %config.storage.backend,
        max_size_bytes = config.storage.max_size_bytes,
        "object store initialized"
    );
    let state = Arc::new(s3gateway::AppState::new(config));
    let app = s3gateway::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("s3gateway listening on {}", bind_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let mut server = std::pin::pin!(server.into_future());

    // Wait for the server to drain after a signal, but no longer than the timeout.
    tokio::select! {
        result = &mut server => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!("shutdown timeout elapsed with requests still in flight");
        }
    }

    info!("s3gateway shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
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
                warn!("failed to install SIGTERM handler: {e}");
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
