use anyhow::Context;
use clap::Parser;
use floe_rest::{build_router, App, Cli, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

fn install_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        );
    tracing_subscriber::registry().with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_tracing();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli).context("invalid configuration")?;

    tracing::info!(
        port = config.port,
        services = ?config.services,
        "starting floe-rest"
    );

    let app = Arc::new(App::new(config.clone()).await?);
    let router = build_router(app);

    // Prometheus metrics on a sidecar port.
    let metrics_port = config.port + 1;
    let metrics_router = floe_rest::metrics_server::build_router();
    tokio::spawn(async move {
        let Ok(listener) =
            tokio::net::TcpListener::bind(format!("[::]:{metrics_port}")).await
        else {
            tracing::warn!(metrics_port, "could not bind the metrics listener");
            return;
        };
        if let Err(error) = axum::serve(listener, metrics_router).await {
            tracing::warn!(%error, "metrics server exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", config.port))
        .await
        .context("failed to bind server port")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for CTRL-C");
            tracing::info!("received ctrl-c, shutting down");
        })
        .await
        .context("server failed")?;

    Ok(())
}
