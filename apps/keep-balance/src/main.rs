use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use client_sdk::{EnvSettings, RpcConn, StaticToken};
use common::config::{Cluster, Config};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod balancer;
mod collections;
mod error;
mod keep_service;
mod runner;

use balancer::{Balancer, RunOptions};
use keep_service::KeepClient;
use runner::Runner;

#[derive(Debug, Parser)]
#[command(name = "keep-balance")]
#[command(about = "Moves and trashes stored blocks so each has its desired number of replicas")]
struct Cli {
    #[arg(long, default_value = "/etc/arvados/config.yml")]
    config: PathBuf,
    /// Balance once and exit instead of running every RunPeriod.
    #[arg(long)]
    once: bool,
    /// Send pull requests (make more replicas of underreplicated blocks).
    #[arg(long)]
    commit_pulls: bool,
    /// Send trash requests (delete unreferenced old blocks and excess
    /// replicas).
    #[arg(long)]
    commit_trash: bool,
    /// Print one line per block to stdout.
    #[arg(long)]
    dump: bool,
    /// Only balance blocks whose hash starts with this prefix.
    #[arg(long, default_value = "")]
    chunk_prefix: String,
}

fn connect(cluster: &Cluster) -> Result<RpcConn> {
    let controller = &cluster.services.controller;
    let url = if controller.external_url.is_empty() {
        controller.first_internal_url()
    } else {
        Some(controller.external_url.as_str())
    };
    let conn = match url {
        Some(url) if !cluster.system_root_token.is_empty() => RpcConn::new(
            &cluster.cluster_id,
            url,
            cluster.tls.insecure,
            Arc::new(StaticToken(cluster.system_root_token.clone())),
        )?,
        _ => EnvSettings::from_env()?.connect(&cluster.cluster_id)?,
    };
    Ok(conn)
}

fn watch_signals(kick: mpsc::Sender<()>, cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut usr1 = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
        let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = usr1.recv() => {
                        let _ = kick.try_send(());
                    }
                    _ = term.recv() => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            info!("shutdown requested");
            cancel.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        drop(kick);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            cancel.cancel();
        });
    }
    Ok(())
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
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cluster = Config::load(&cli.config)
        .and_then(Config::single_cluster)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if cluster.system_root_token.is_empty() {
        bail!("SystemRootToken is not set in {}", cli.config.display());
    }

    let conn = connect(&cluster).context("failed to connect to the API")?;
    info!(cluster = %cluster.cluster_id, api = %conn.base_url(), "starting keep-balance");
    let keep = KeepClient::new(&cluster.system_root_token, cluster.tls.insecure)?;
    let period = cluster.keep_balance.run_period.as_std();
    let balancer = Balancer::new(
        Arc::new(conn),
        keep,
        cluster.keep_balance.clone(),
        cluster.system_root_token.clone(),
    );
    let options = RunOptions {
        commit_pulls: cli.commit_pulls,
        commit_trash: cli.commit_trash,
        dump: cli.dump,
        chunk_prefix: cli.chunk_prefix,
        ..Default::default()
    };
    let mut runner = Runner::new(balancer, options, period);

    if cli.once {
        runner.run_once().await?;
        return Ok(());
    }

    let (kick_tx, kick_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    watch_signals(kick_tx, cancel.clone())?;
    info!(period_secs = period.as_secs(), "running until stopped");
    runner.run_forever(kick_rx, cancel).await;
    Ok(())
}
