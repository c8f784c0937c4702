//! tusstore -- resumable-upload (tus 1.0.0) server.
//!
//! Upload sessions live in memory; completed uploads live in the object
//! store. A restart drops unfinished sessions, and clients re-create them.
//! SIGTERM/SIGINT stop accepting connections and wait for in-flight
//! requests before exiting.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use tusstore::config::{Config, LoggingConfig};
use tusstore::storage::backend::StorageBackend;
use tusstore::storage::retry::RetryingStore;

/// Command-line arguments for the tusstore server.
#[derive(Parser, Debug)]
#[command(name = "tusstore", version, about = "Resumable-upload (tus) server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "tusstore.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

/// Initialize tracing from the logging section. `RUST_LOG` wins over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "aws" => {
            let aws_config = config.storage.aws.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 'aws' but storage.aws config section is missing")
            })?;
            let backend = tusstore::storage::aws::AwsBackend::new(
                aws_config.bucket.clone(),
                aws_config.region.clone(),
                aws_config.prefix.clone(),
                (!aws_config.endpoint_url.is_empty()).then(|| aws_config.endpoint_url.clone()),
                aws_config.use_path_style,
                (!aws_config.access_key_id.is_empty()).then(|| aws_config.access_key_id.clone()),
                (!aws_config.secret_access_key.is_empty())
                    .then(|| aws_config.secret_access_key.clone()),
            )
            .await?;
            info!(
                "AWS storage backend initialized: bucket={} region={} prefix='{}'",
                aws_config.bucket, aws_config.region, aws_config.prefix
            );
            Arc::new(backend)
        }
        "memory" => {
            let max = config.storage.memory.max_size_bytes;
            info!("Memory storage backend initialized (max_size_bytes={})", max);
            Arc::new(tusstore::storage::memory::MemoryBackend::new(max))
        }
        "local" => {
            let storage_root = &config.storage.local.root_dir;
            let backend = tusstore::storage::local::LocalBackend::new(storage_root)?;
            info!("Local storage backend initialized at {}", storage_root);
            Arc::new(backend)
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected memory, local or aws)"),
    };

    let policy = config.retry.policy();
    info!(
        "Storage retry policy: {} attempts, base delay {:?}, x{}",
        policy.max_attempts, policy.base_delay, policy.backoff_multiplier
    );
    Ok(Arc::new(RetryingStore::new(storage, policy)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = tusstore::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        tusstore::metrics::init_metrics();
        tusstore::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let storage = build_storage(&config).await?;
    let state = Arc::new(tusstore::AppState::new(config.clone(), storage));

    let sweep_interval = config.uploads.sweep_interval_seconds;
    if sweep_interval > 0 {
        let uploads = state.uploads.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = uploads.sweep_expired().await;
                if swept > 0 {
                    info!("expiration sweep removed {} uploads", swept);
                }
            }
        });
    } else {
        warn!("expiration sweeper disabled; idle uploads stay in memory");
    }

    let app = tusstore::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        "tusstore listening on {} (namespace '{}')",
        bind_addr, config.uploads.namespace
    );

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    let drain = async {
        server.await?;
        Ok::<_, std::io::Error>(())
    };
    tokio::select! {
        result = drain => result?,
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => warn!("in-flight requests did not drain within {:?}", shutdown_timeout),
    }

    info!("tusstore shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
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
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
