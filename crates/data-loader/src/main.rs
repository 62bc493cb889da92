use anyhow::Context;
use clap::Parser;
use data_loader::ProcessQueue;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// The data-loading daemon: waits for messages on the portal channel and
/// materializes zarr views into the shared cache.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// `host[:port]` of the redis-compatible cache.
    #[arg(short = 'r', long, default_value = "localhost:6379", env = "API_REDIS_HOST")]
    redis_host: String,
    #[arg(long, env = "API_REDIS_USER")]
    redis_username: Option<String>,
    #[arg(long, env = "API_REDIS_PASSWORD")]
    redis_password: Option<String>,
    #[arg(long, env = "API_REDIS_SSL_CERTFILE")]
    redis_ssl_certfile: Option<PathBuf>,
    #[arg(long, env = "API_REDIS_SSL_KEYFILE")]
    redis_ssl_keyfile: Option<PathBuf>,

    /// Expiry time of cache entries, in seconds.
    #[arg(short = 'e', long, default_value = "3600", env = "API_CACHE_EXP")]
    exp: u64,

    /// API route prefix, used for the advertised zarr paths.
    #[arg(long, default_value = "/api/floe", env = "API_PREFIX")]
    prefix: String,

    /// Development mode: honor shutdown messages.
    #[arg(long)]
    dev: bool,

    /// Display debug messages.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn install_tracing(verbose: bool) {
    let default = if verbose {
        tracing::level_filters::LevelFilter::DEBUG
    } else {
        tracing::level_filters::LevelFilter::INFO
    };
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        );
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    tracing::info!("starting data-loading daemon");

    let cache_config = portal_cache::CacheConfig {
        host: cli.redis_host.clone(),
        user: cli.redis_username.clone(),
        password: cli.redis_password.clone(),
        ssl_certfile: cli.redis_ssl_certfile.clone(),
        ssl_keyfile: cli.redis_ssl_keyfile.clone(),
    };
    let cache = portal_cache::Cache::connect(&cache_config)
        .await
        .context("could not connect to the cache")?;
    cache.ping().await.context("cache did not answer")?;

    let zarr_base = format!("{}/data-portal/zarr", cli.prefix.trim_end_matches('/'));
    let queue = Arc::new(ProcessQueue::new(cache, cli.exp, zarr_base, cli.dev));

    tokio::select! {
        result = queue.run_for_ever() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}
