//! # RoleWarden — Timed Role Entitlement Service
//!
//! Grants, revokes, and re-grants guild roles on a time basis. This binary
//! wires the storage session, repositories, and the lifecycle scheduler
//! together and runs the poll loop until interrupted.
//!
//! Usage:
//!   rolewarden                         # Default config (~/.rolewarden/config.toml)
//!   rolewarden --config warden.toml    # Custom config file
//!   rolewarden --poll-interval 10      # Override the poll tick

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rolewarden::config::WardenConfig;
use rolewarden::connection::ConnectionManager;
use rolewarden::executor::DiscordRoleExecutor;
use rolewarden::one_shots::ScheduledActionRepository;
use rolewarden::recurring::RecurringActionRepository;
use rolewarden::scheduler::{LifecycleScheduler, spawn_scheduler};
use rolewarden::temp_roles::TempRoleRepository;

#[derive(Parser)]
#[command(name = "rolewarden", version, about = "⏳ RoleWarden — timed role entitlements")]
struct Cli {
    /// Config file path (default: ~/.rolewarden/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the scheduler poll interval in seconds
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("rolewarden={default_level}"))),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => WardenConfig::load_from(std::path::Path::new(path))?,
        None => WardenConfig::load()?,
    };
    if let Some(poll) = cli.poll_interval {
        config.scheduler.poll_interval_secs = poll;
    }

    tracing::info!("⏳ RoleWarden starting");
    let conn = Arc::new(ConnectionManager::new(config.storage.clone()));
    // Fatal only here: a store that never comes up means nothing to schedule
    conn.connect().await?;

    let temp_roles = Arc::new(TempRoleRepository::new(conn.clone()));
    let one_shots = Arc::new(ScheduledActionRepository::new(conn.clone()));
    let recurring = Arc::new(RecurringActionRepository::new(conn.clone()));
    let executor = Arc::new(DiscordRoleExecutor::new(config.discord.clone()));

    let scheduler = Arc::new(LifecycleScheduler::new(
        conn.clone(),
        temp_roles,
        one_shots,
        recurring,
        executor,
        config.scheduler.max_removal_attempts,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(spawn_scheduler(
        scheduler,
        config.scheduler.poll_interval_secs,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("⏳ Shutdown requested");
    shutdown_tx.send(true)?;
    loop_handle.await?;
    conn.shutdown();
    tracing::info!("⏳ RoleWarden stopped");
    Ok(())
}
