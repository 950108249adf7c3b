//! Model Delivery - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_delivery::catalog::{FileCatalog, StaticCatalog, UpdateCatalog};
use model_delivery::models::sha256_hex;
use model_delivery::{
    CompressionType, DeliveryConfig, DeltaUpdateManager, HttpTransport, HybridOrchestrator,
    LoadRequest, NetworkHealthMonitor, StorageManager, metrics,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "model-delivery")]
#[command(about = "Hybrid model delivery and caching engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    /// Print Prometheus metrics after the command completes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a model through the cache, fetching it if needed
    Load {
        id: String,
        /// Locator of the full artifact (http(s):// or file://)
        url: String,
        version: String,
        #[arg(long, default_value = "none")]
        compression: String,
        /// SHA-256 of the decompressed artifact
        #[arg(long, default_value = "")]
        checksum: String,
        /// Ignore the cache
        #[arg(long)]
        force: bool,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Print cache statistics and cached models
    Stats,
    /// Exempt a model from eviction
    Pin { id: String },
    /// Make a model evictable again
    Unpin { id: String },
    /// Remove a model from the cache
    Delete { id: String },
    /// Remove backups older than the retention window
    GcBackups,
    /// Write a patch that turns BASE into TARGET
    Diff {
        base: PathBuf,
        target: PathBuf,
        out: PathBuf,
    },
    /// Probe the network and print health metrics with the recommended strategy
    Health {
        #[arg(long, default_value_t = 3)]
        probes: u32,
    },
    /// Apply the best published update for a model
    Update { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    // Load configuration
    let mut config = DeliveryConfig::load(cli.config)?;

    // CLI overrides
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }

    config.validate()?;

    tracing::debug!(
        cache_dir = ?config.cache_dir,
        max_cache_bytes = config.max_cache_bytes,
        max_models = config.max_models,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let orchestrator = build_orchestrator(&config).await?;
    let outcome = run(&orchestrator, cli.command).await;
    orchestrator.shutdown().await;
    outcome?;

    if cli.print_metrics {
        println!("{}", prometheus_handle.render());
    }

    Ok(())
}

async fn build_orchestrator(config: &DeliveryConfig) -> Result<HybridOrchestrator> {
    let storage = Arc::new(
        StorageManager::open(&config.cache_dir, config.cache_limits())
            .await
            .with_context(|| format!("Failed to open cache at {:?}", config.cache_dir))?,
    );

    let transport = Arc::new(HttpTransport::new(
        config.fetch_timeout(),
        config.probe_timeout(),
    )?);

    let monitor = Arc::new(NetworkHealthMonitor::new(
        config.monitor_config(),
        transport.clone(),
    ));
    monitor.set_transport_kind(config.transport_kind());

    let delta = Arc::new(
        DeltaUpdateManager::new(storage.clone(), transport.clone(), config.backup_retention())
            .with_monitor(monitor.clone()),
    );

    let catalog: Arc<dyn UpdateCatalog> = match &config.catalog_file {
        Some(path) => Arc::new(FileCatalog::new(path)),
        None => Arc::new(StaticCatalog::new()),
    };

    Ok(HybridOrchestrator::new(
        storage, monitor, delta, transport, catalog,
    ))
}

async fn run(orchestrator: &HybridOrchestrator, command: Command) -> Result<()> {
    match command {
        Command::Load {
            id,
            url,
            version,
            compression,
            checksum,
            force,
            timeout_secs,
        } => {
            let compression: CompressionType = compression.parse()?;
            let request = LoadRequest::new(&id, url, version)
                .with_compression(compression)
                .with_checksum(checksum)
                .force_download(force);

            let load = orchestrator.load_model(request);
            let result = tokio::select! {
                result = async {
                    match timeout_secs {
                        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), load)
                            .await
                            .with_context(|| format!("Timed out after {}s loading '{}'", secs, id)),
                        None => Ok(load.await),
                    }
                } => result?,
                _ = shutdown_signal() => anyhow::bail!("Interrupted while loading '{}'", id),
            };

            let summary = match result.error() {
                None => serde_json::json!({
                    "model_id": result.model_id(),
                    "source": result.source(),
                    "bytes": result.data().map(|d| d.len()),
                    "metadata": result.metadata(),
                    "elapsed_ms": result.elapsed().as_millis() as u64,
                }),
                Some(error) => serde_json::json!({
                    "model_id": result.model_id(),
                    "source": result.source(),
                    "error": error,
                    "message": error.user_message(),
                }),
            };
            print_json(&summary)?;

            if let Some(error) = result.error() {
                anyhow::bail!("Failed to load '{}': {}", id, error);
            }
        }
        Command::Stats => {
            let storage = orchestrator.storage();
            print_json(&serde_json::json!({
                "statistics": storage.statistics().await,
                "models": storage.list().await,
            }))?;
        }
        Command::Pin { id } => {
            orchestrator.storage().pin(&id).await?;
            tracing::info!(model_id = %id, "Model pinned");
        }
        Command::Unpin { id } => {
            orchestrator.storage().unpin(&id).await?;
            tracing::info!(model_id = %id, "Model unpinned");
        }
        Command::Delete { id } => {
            if !orchestrator.storage().delete(&id).await? {
                anyhow::bail!("Model '{}' is not cached", id);
            }
        }
        Command::GcBackups => {
            let removed = orchestrator.delta().gc_backups().await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::Health { probes } => {
            let monitor = orchestrator.monitor();
            if monitor.config().probe_url.is_none() {
                anyhow::bail!("No probe_url configured");
            }
            for _ in 0..probes {
                monitor.probe_once().await;
            }
            print_json(&serde_json::json!({
                "metrics": monitor.metrics(),
                "strategy": monitor.recommend_strategy(),
                "suitable_for_download": monitor.is_suitable_for_download(),
            }))?;
        }
        Command::Update { id } => {
            let outcome = orchestrator.apply_available_update(&id).await?;
            print_json(&serde_json::json!({
                "model_id": id,
                "outcome": format!("{:?}", outcome),
            }))?;
        }
        Command::Diff { base, target, out } => {
            write_patch(&base, &target, &out).await?;
        }
    }

    Ok(())
}

async fn write_patch(base: &Path, target: &Path, out: &Path) -> Result<()> {
    let base_bytes = tokio::fs::read(base)
        .await
        .with_context(|| format!("Failed to read base {:?}", base))?;
    let target_bytes = tokio::fs::read(target)
        .await
        .with_context(|| format!("Failed to read target {:?}", target))?;

    let patch = DeltaUpdateManager::create_patch(&base_bytes, &target_bytes);
    tokio::fs::write(out, &patch)
        .await
        .with_context(|| format!("Failed to write patch {:?}", out))?;

    print_json(&serde_json::json!({
        "patch_size": patch.len(),
        "original_size": target_bytes.len(),
        "patch_checksum": sha256_hex(&patch),
        "result_checksum": sha256_hex(&target_bytes),
    }))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
