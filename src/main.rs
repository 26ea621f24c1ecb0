//! bleepgate -- S3 gateway runtime.
//!
//! Loads configuration, builds the storage backend and gateway, and runs
//! multipart housekeeping until SIGTERM/SIGINT.  Serving S3 over HTTP is
//! the embedding front end's job.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use bleepgate::config::Config;
use bleepgate::storage::backend::BackendClient;
use bleepgate::{Gateway, Identity};

/// Command-line arguments for bleepgate.
#[derive(Parser, Debug)]
#[command(
    name = "bleepgate",
    version,
    about = "S3 gateway over heterogeneous storage backends"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "bleepgate.example.yaml")]
    config: String,

    /// Override the log format (text or json).
    #[arg(long)]
    log_format: Option<String>,
}

fn init_tracing(config: &Config, format_override: Option<&str>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let format = format_override.unwrap_or(&config.logging.format);
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn BackendClient>> {
    let storage = &config.storage;
    let backend: Arc<dyn BackendClient> = match storage.backend.as_str() {
        "memory" => {
            info!(
                "Memory storage backend initialized (limit {} bytes)",
                storage.memory.max_size_bytes
            );
            Arc::new(bleepgate::storage::memory::MemoryBackend::new(
                storage.memory.max_size_bytes,
            ))
        }
        "local" => {
            let root = &storage.local.root_dir;
            let backend = bleepgate::storage::local::LocalBackend::new(root)?;
            info!("Local storage backend initialized at {}", root);
            Arc::new(backend)
        }
        "manta" => {
            let manta = storage.manta.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 'manta' but storage.manta config section is missing")
            })?;
            // Request signing keys are supplied by the embedding front end.
            Arc::new(bleepgate::storage::manta::MantaBackend::new(
                &manta.endpoint,
                &manta.account,
                manta.timeout_secs,
                None,
            )?)
        }
        other => anyhow::bail!("unknown storage backend '{}'", other),
    };
    Ok(backend)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = bleepgate::config::load_config(&cli.config)?;
    init_tracing(&config, cli.log_format.as_deref());
    info!("Loaded configuration from {}", cli.config);

    if config.observability.metrics {
        bleepgate::metrics::install_exporter(config.observability.metrics_listen)?;
        info!(
            "Prometheus exporter listening on {}",
            config.observability.metrics_listen
        );
    }

    let backend = build_backend(&config)?;
    let gc_interval = config.multipart.gc_interval_secs;
    let gateway = Gateway::new(backend, config);

    // Staged parts of sessions lost in a previous run.
    let ctx = gateway.request_context(Identity::Verified {
        access_key: "bleepgate-gc".to_string(),
    });
    match gateway.purge_orphaned_staging(&ctx).await {
        Ok(n) => info!("Startup purge removed {} orphaned staged parts", n),
        Err(e) => warn!("Startup purge failed: {}", e),
    }

    let mut ticker = (gc_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(gc_interval)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                let ctx = gateway.request_context(Identity::Verified {
                    access_key: "bleepgate-gc".to_string(),
                });
                let aborted = gateway.abort_stale_uploads(&ctx).await;
                if aborted > 0 {
                    info!("Aborted {} stale multipart uploads", aborted);
                }
            }
        }
    }

    gateway.shutdown().await?;
    info!("bleepgate shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
