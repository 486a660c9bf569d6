//! Switchboard CLI entry point.
//!
//! `serve` runs the relay server and background sweeps until Ctrl-C;
//! `check-config` validates a config file and prints the effective settings.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use switchboard::audit::AuditLog;
use switchboard::broker::AccessBroker;
use switchboard::config::{config_dir, load_config, Config};
use switchboard::logging;
use switchboard::ratelimit::RateLimiter;
use switchboard::relay::CommandRelay;
use switchboard::server::RelayServer;
use switchboard::sweeper::{run_sweeper, SweepIntervals};

/// Switchboard: scoped, time-limited access between AI agents and editors.
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Config file (default: ~/.switchboard/config.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate the configuration and print the effective values.
    CheckConfig {
        /// Config file (default: ~/.switchboard/config.toml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => handle_serve(config).await,
        Command::CheckConfig { config } => handle_check_config(config),
    }
}

fn config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(config_dir()?.join("config.toml")),
    }
}

fn handle_check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    logging::init_cli();
    let path = config_path(path)?;
    let config = load_config(&path)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("# effective configuration ({})", path.display());
    print!("{rendered}");
    Ok(())
}

async fn handle_serve(path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path(path)?;
    let config = load_config(&path)?;
    let _guard = logging::init_server(&config.paths.logs_dir)?;
    info!(config = %path.display(), version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    let (broker, relay, limiter) = build_components(&config, &config.paths.audit_log)?;
    let server = RelayServer::new(relay.clone(), config.server.clone());
    let listener = server.bind().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(
        broker,
        relay,
        limiter,
        SweepIntervals::from_config(&config),
        shutdown_rx.clone(),
    ));
    let server_task = tokio::spawn(server.serve(listener, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "relay server failed"),
        Err(e) => error!(error = %e, "relay server task panicked"),
    }
    if let Err(e) = sweeper.await {
        error!(error = %e, "sweeper task panicked");
    }
    info!("switchboard stopped");
    Ok(())
}

fn build_components(
    config: &Config,
    audit_path: &Path,
) -> anyhow::Result<(Arc<AccessBroker>, CommandRelay, Arc<RateLimiter>)> {
    let audit = Arc::new(
        AuditLog::open(audit_path)
            .with_context(|| format!("failed to open audit log {}", audit_path.display()))?,
    );
    let broker = Arc::new(AccessBroker::new(config.broker.clone(), Arc::clone(&audit)));
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let relay = CommandRelay::new(
        Arc::clone(&broker),
        Arc::clone(&limiter),
        audit,
        config.relay.clone(),
    );
    Ok((broker, relay, limiter))
}
