mod auth;
mod commit;
mod config;
mod github;
mod review;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::review::backend::HttpReviewBackend;
use crate::review::ReviewBackend;
use crate::webhook::{AppState, DeliveryLog};

/// How many recent webhook delivery ids to remember for deduplication.
const DELIVERY_LOG_CAPACITY: usize = 1024;

/// Patchwork — GitHub App service that reviews pull requests with an AI
/// reviewer and pushes autofix commits on request.
#[derive(Parser, Debug)]
#[command(name = "patchwork-bot", version, about)]
struct Cli {
    /// Path to the configuration file (defaults to .patchwork.toml in the
    /// working directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket address to listen on (overrides [server].bind_addr)
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = config::Config::load_from(path)?;
            config.apply_env();
            config
        }
        None => config::Config::load()?,
    };

    if config.github.webhook_secret.is_none() {
        warn!("webhook secret not configured; every delivery will be rejected");
    }

    let tokens = Arc::new(auth::TokenManager::from_config(&config.github)?);
    let github = Arc::new(github::GithubClient::new(config.github.api_base_url.clone())?);
    let backend: Arc<dyn ReviewBackend> =
        Arc::new(HttpReviewBackend::from_config(&config.reviewer)?);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| config.server.bind_addr.clone());
    let state = Arc::new(AppState {
        config,
        github,
        tokens,
        backend,
        deliveries: DeliveryLog::new(DELIVERY_LOG_CAPACITY),
    });

    let app = webhook::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "patchwork-bot listening");
    axum::serve(listener, app).await?;

    Ok(())
}
