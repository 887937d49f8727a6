//! Crowdsec Scoring Proxy — process entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crowdsec_scoring_proxy::config::Config;
use crowdsec_scoring_proxy::handler::{create_router, spawn_auditor, AppState};
use crowdsec_scoring_proxy::upstream::UpstreamClient;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

/// Headroom added on top of `upstream_timeout` for the write-side deadline,
/// so a cold `startup=true` fetch never races the response deadline.
const WRITE_TIMEOUT_HEADROOM: Duration = Duration::from_secs(60);

/// Drain budget for in-flight requests during shutdown.
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "crowdsec-scoring-proxy", disable_version_flag = true)]
struct Cli {
    /// Path to the YAML configuration document.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Print version and build time, then exit.
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!(
            "{} {} (built {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("BUILD_TIME_UNIX")
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crowdsec_scoring_proxy=info,tower_http=info".into()),
        )
        .json()
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        upstream = %config.upstream_lapi_url,
        max_decisions = config.max_decisions,
        cache_ttl = ?config.cache_ttl,
        "starting crowdsec scoring proxy"
    );

    let upstream = UpstreamClient::new(
        &config.upstream_lapi_url,
        config.upstream_lapi_key.clone(),
        config.upstream_timeout,
    );
    let listen_addr = config.listen_addr.clone();
    let write_timeout = config.upstream_timeout + WRITE_TIMEOUT_HEADROOM;

    let state = AppState::new(Arc::new(config), upstream);
    let (auditor_handle, auditor_cancel) = spawn_auditor(state.clone());

    let app = create_router(state).layer(TimeoutLayer::with_status_code(
        axum::http::StatusCode::GATEWAY_TIMEOUT,
        write_timeout,
    ));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(address = %listen_addr, "listening");

    let serve = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    match tokio::time::timeout(SHUTDOWN_DRAIN_BUDGET, serve).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "server error"),
        Err(_) => tracing::warn!("shutdown drain budget exceeded, forcing exit"),
    }

    auditor_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), auditor_handle).await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
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
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("received shutdown signal");
}
