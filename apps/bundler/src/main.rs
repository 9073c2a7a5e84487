use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bundler::bundle::BundleManager;
use bundler::config::{self, BundlerConfig};
use bundler::rpc::RpcClient;
use bundler::validation::ValidationManager;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = config::load_config()?;
    tracing::info!(
        node = %cfg.ethereum_node_url,
        entrypoint = %cfg.entrypoint,
        chain_id = cfg.chain_id,
        legacy = cfg.is_legacy_mode,
        unsafe_mode = cfg.is_unsafe,
        "bundler starting"
    );

    let shutdown = CancellationToken::new();

    let mut join_set = tokio::task::JoinSet::new();
    {
        let shutdown = shutdown.clone();
        join_set.spawn(async move { run_bundler(cfg, shutdown).await });
    }

    tracing::info!("bundler started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("bundler task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("bundler task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("bundler task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("bundler task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("bundler task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
}

/// The bundle loop: one logical task owns the mempool and reputation store
/// and ticks `send_next_bundle` at the configured cadence. The validation
/// manager is constructed up front so a tracer/parser schema mismatch
/// refuses to start instead of misreading traces later.
async fn run_bundler(cfg: BundlerConfig, shutdown: CancellationToken) -> Result<()> {
    let rpc = Arc::new(RpcClient::new(&cfg.ethereum_node_url, cfg.rpc_timeout)?);

    let validation = ValidationManager::new(Arc::clone(&rpc), cfg.clone())
        .context("init validation manager")?;
    tracing::info!(
        unsafe_mode = validation.is_unsafe(),
        "validation manager ready"
    );

    let mut bundler = BundleManager::new(Arc::clone(&rpc), cfg.clone())?;

    let mut ticker = tokio::time::interval(cfg.bundle_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                match bundler.send_next_bundle().await {
                    Ok(Some(tx_hash)) => {
                        tracing::info!(tx_hash = %tx_hash, "bundle sent");
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!(err = %format!("{err:#}"), "bundle attempt failed");
                    }
                }
            }
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
