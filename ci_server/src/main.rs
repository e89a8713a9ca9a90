//! Centrix CI coordinator: hosts the build master behind an HTTP API.
//!
//! Changes arrive from GitHub webhooks or the change API, schedulers
//! coalesce them into build sets, and local shell agents run the builds.
//! Results go out to the log, an optional webhook and GitHub commit statuses.

mod config;
mod metrics;
mod reload;
mod routes;
mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use ci_engine::BuildMaster;
use clap::Parser;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use services::git_source::GitSource;
use services::notifier::{GitHubStatusNotifier, LogNotifier, WebhookNotifier};

#[derive(Parser)]
#[command(name = "ci-coordinator", about = "Centrix CI build coordinator")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "CI_PORT", default_value = "9090")]
    port: u16,

    /// Engine configuration (agents, builders, schedulers) as JSON
    #[arg(short, long, env = "CI_ENGINE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    tracing::info!("Starting Centrix CI coordinator...");

    let ci_config = config::CiConfig::from_env();

    let setup = reload::load_setup(cli.config.as_deref(), &ci_config)?;

    // Initialize metrics
    metrics::init_metrics();

    let source = Arc::new(GitSource::new(ci_config.repository_url.clone()));
    let master = Arc::new(BuildMaster::start(setup, source).context("starting build master")?);

    // One local agent per declared agent name
    reload::attach_local_agents(&master, &ci_config)?;
    reload::spawn_reload_on_hangup(Arc::clone(&master), cli.config.clone(), ci_config.clone());

    // Notifiers
    let client = reqwest::Client::new();
    master.add_notifier(Arc::new(LogNotifier));
    if let Some(url) = &ci_config.notify_url {
        tracing::info!("Posting build set notices to {}", url);
        master.add_notifier(Arc::new(WebhookNotifier::new(client.clone(), url.clone())));
    }
    if !ci_config.github_token.is_empty() {
        master.add_notifier(Arc::new(GitHubStatusNotifier::new(
            client,
            ci_config.github_token.clone(),
            ci_config.dashboard_url.clone(),
            ci_config.repository_url.clone(),
        )));
    }

    let ci_state = routes::CiRouterState {
        master: Arc::clone(&master),
        config: ci_config,
    };
    let app = Router::new()
        .nest("/ci", routes::ci_router(ci_state))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Centrix CI coordinator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Waiting for running builds...");
    master.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
