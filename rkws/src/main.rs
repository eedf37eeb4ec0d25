mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use log::{info, warn};
use rkws::api::serve;
use rkws::config::load_config;
use rkws::daemon::QuicDaemonConnector;
use rkws::manager::Manager;
use rkws::store::XlineStore;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => {
            let cfg = load_config(&config)?;
            let store = XlineStore::new(&cfg.xline_config)
                .await
                .context("failed to connect to xline")?;
            let daemons =
                QuicDaemonConnector::new(&cfg.daemon).context("failed to set up daemon client")?;
            let manager = Arc::new(Manager::new(
                cfg.manager,
                Arc::new(store),
                Arc::new(daemons),
            ));

            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("[rkws] cannot listen for shutdown signal: {e}");
                    return;
                }
                info!("[rkws] shutting down");
                shutdown.cancel();
            });

            serve(cfg.addr, manager, cancel).await?;
        }
    }

    Ok(())
}
