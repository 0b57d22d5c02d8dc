use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use common::config::Config;
use tracing::info;

mod auth;
mod db;
mod federation;
mod localdb;
mod params;
mod router;
mod server;

use server::Server;

#[derive(Debug, Parser)]
#[command(name = "arvados-controller")]
#[command(about = "Federated API router for a data-platform cluster")]
struct Cli {
    #[arg(long, default_value = "/etc/arvados/config.yml")]
    config: PathBuf,
    /// Listen address; defaults to the first Services.Controller internal URL.
    #[arg(long, env = "CONTROLLER_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cluster = Config::load(&cli.config)
        .and_then(Config::single_cluster)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    let bind = match cli.bind {
        Some(bind) => bind,
        None => server::listen_address(&cluster)?,
    };

    let server = Server::start(cluster, &bind).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    server.close().await
}
