use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewall::cache::{CacheClient, MemoryCache, TimeoutCache};
use ratewall::config::{CacheBackend, CacheConfig, RatewallConfig};
use ratewall::protection::{global, Protection};

/// Rate limiting and API protection service.
#[derive(Parser, Debug)]
#[command(name = "ratewall")]
#[command(version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short = 'l', long = "listen")]
    listen: Option<SocketAddr>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long = "json-logs")]
    json_logs: bool,

    /// Keep quota state in process memory instead of the configured backend
    #[arg(long = "memory-cache")]
    memory_cache: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs);

    info!("Starting Ratewall");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = RatewallConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if args.memory_cache {
        config.cache.backend = CacheBackend::Memory;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.cache.backend,
        "Configuration loaded"
    );

    let cache = build_cache(&config.cache).await?;
    let protection = Arc::new(Protection::from_config(cache, &config)?);
    global::install_global(protection.clone());
    let sweeper = protection.clone().spawn_sweeper(config.cache.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    ratewall::http::serve(listener, ratewall::http::router(protection), shutdown_signal()).await?;
    sweeper.abort();

    info!("Ratewall stopped");
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Connect the configured store, bounding every call by the operation timeout.
async fn build_cache(config: &CacheConfig) -> anyhow::Result<Arc<dyn CacheClient>> {
    match config.backend {
        CacheBackend::Memory => {
            info!("Using in-process cache");
            Ok(Arc::new(TimeoutCache::new(MemoryCache::new(), config.operation_timeout)))
        }
        #[cfg(feature = "redis")]
        CacheBackend::Redis => {
            let redis = ratewall::cache::RedisCache::connect(&config.redis_url).await?;
            if let Err(e) = redis.health_check().await {
                tracing::warn!(error = %e, "Redis health check failed, continuing with fail-open policy");
            }
            Ok(Arc::new(TimeoutCache::new(redis, config.operation_timeout)))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis => {
            anyhow::bail!("built without the `redis` feature; use --memory-cache")
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
