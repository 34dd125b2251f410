//! `ignite`: bare-metal provisioning controller binary. Parses config,
//! opens the store, reconciles persisted server state, and serves DHCP
//! until asked to stop -- structured the way the teacher's `bin/src/main.rs`
//! drives its v4/v6 servers off a single `CancellationToken`.
mod config;
mod trace;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use ignite_core::{Db, KvLeaseRepo, KvServerRepo, LeaseRepository, ServerRepository};
use ignite_dhcp::HandlerConfig;
use ignite_manager::ServerManager;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

fn main() -> Result<()> {
    let cfg = Config::parse();
    trace::init(&cfg.ignite_log, &cfg.log_format)?;
    debug!(?cfg, "parsed configuration");

    match dotenvy::dotenv() {
        Ok(path) => debug!(?path, "loaded .env file"),
        Err(err) => debug!(?err, ".env file not loaded"),
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ignite-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let db_path = cfg.db_file_path();
    info!(path = %db_path.display(), "opening database");
    let db = Db::open(&db_path).context("failed to open database")?;

    let server_repo: Arc<dyn ServerRepository> = Arc::new(KvServerRepo::new(db.clone()));
    let lease_repo: Arc<dyn LeaseRepository> = Arc::new(KvLeaseRepo::new(db));

    let handler_cfg = HandlerConfig {
        bios_filename: cfg.dhcp_bios_file.clone(),
        efi_filename: cfg.dhcp_efi_file.clone(),
        stop_timeout: Duration::from_secs(5),
    };
    let manager = Arc::new(ServerManager::new(
        server_repo.clone(),
        lease_repo.clone(),
        handler_cfg,
    ));

    info!("reconciling persisted servers");
    manager
        .reconcile_on_startup()
        .await
        .context("startup reconciliation failed")?;

    let token = CancellationToken::new();
    let sweeper = ignite_manager::spawn_offline_sweeper(
        lease_repo,
        server_repo,
        chrono::Duration::seconds(cfg.offline_threshold_secs),
        Duration::from_secs(cfg.sweep_period_secs),
        token.clone(),
    );

    info!("ignite running, waiting for shutdown signal");
    if let Err(err) = signal::ctrl_c().await {
        error!(?err, "failed to listen for ctrl-c");
    }
    token.cancel();

    info!("shutting down");
    manager.stop_all().await;
    if let Err(err) = sweeper.await {
        error!(?err, "offline sweeper task panicked");
    }

    Ok(())
}
