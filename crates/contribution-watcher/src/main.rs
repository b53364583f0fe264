//! Contribution Watcher
//!
//! Main entry point for the chain watcher and its HTTP/websocket API.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zcash_protocol::consensus::NetworkType;

use contribution_watcher::checkpoint::Checkpoint;
use contribution_watcher::service::build_notifiers;
use contribution_watcher::{api, Config, LedgerClient, MockNode, RpcLedger, Watcher};

/// Mock chain advances every this many seconds
const MOCK_BLOCK_INTERVAL_SECS: u64 = 10;
const MOCK_START_HEIGHT: u64 = 100_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,contribution_watcher=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Contribution Watcher");

    if let Err(e) = run().await {
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  API address: {}", config.api_address());
    info!("  Mock mode: {}", config.mock_mode);
    info!("  Network: {:?}", config.network);
    info!("  Address strategy: {:?}", config.address_strategy);
    info!("  Minimum confirmations: {}", config.min_confirmations);
    info!(
        "  Shielded payments: {}",
        if config.shielded_address.is_some() { "enabled" } else { "disabled" }
    );

    let mock_node = config.mock_mode.then(|| MockNode::new(MOCK_START_HEIGHT));
    let ledger: Arc<dyn LedgerClient> = match &mock_node {
        Some(node) => {
            warn!("Running against the mock ledger");
            Arc::new(node.clone())
        }
        None => {
            let url = config
                .zcash_node_url
                .clone()
                .context("ZCASH_NODE_URL is required when MOCK_MODE=false")?;
            Arc::new(RpcLedger::new(
                url,
                config.zcash_node_user.clone(),
                config.zcash_node_password.clone(),
                config.rpc_timeout(),
            )?)
        }
    };

    let chain = ledger
        .chain_info()
        .await
        .context("Zcash node is unreachable")?;
    info!("Connected to {} chain at height {}", chain.chain, chain.blocks);

    if !config.mock_mode {
        check_network(config.network, &chain.chain)?;
    }

    let checkpoint = match &config.redis_url {
        Some(url) => Some(Checkpoint::new(url).await?),
        None => None,
    };

    let (notifier, webhook_worker) = build_notifiers(&config);
    if let Some(worker) = webhook_worker {
        tokio::spawn(worker.run());
    }
    info!("Registered {} notifier(s)", notifier.len());

    let api_addr = config.api_address();
    let (watcher, mut fatal) = Watcher::new(config, Arc::clone(&ledger), notifier, checkpoint)?;
    let watcher = Arc::new(watcher);

    if let Some(node) = mock_node {
        tokio::spawn(advance_mock_chain(node));
    }

    // Create API router
    let app = api::create_router(Arc::clone(&watcher));

    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("Failed to bind {}", api_addr))?;
    info!("API server listening on {}", api_addr);

    let shutdown = watcher.shutdown_signal();
    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("API server error: {:#}", e);
        }
    });

    info!("Contribution Watcher is running, waiting for bootstrap");

    tokio::select! {
        Some(e) = fatal.recv() => {
            error!("Fatal error: {}", e);
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    watcher.shutdown();
    if let Err(e) = api_task.await {
        error!("API task failed: {}", e);
    }

    info!("Contribution Watcher stopped");
    Ok(())
}

fn check_network(expected: NetworkType, chain: &str) -> Result<()> {
    let reported = match chain {
        "main" => NetworkType::Main,
        "test" => NetworkType::Test,
        "regtest" => NetworkType::Regtest,
        other => anyhow::bail!("Zcash node reports unknown chain '{}'", other),
    };

    if reported != expected {
        anyhow::bail!(
            "Zcash node is on {:?} but ZCASH_NETWORK is {:?}",
            reported,
            expected
        );
    }
    Ok(())
}

async fn advance_mock_chain(node: MockNode) {
    let mut interval = tokio::time::interval(Duration::from_secs(MOCK_BLOCK_INTERVAL_SECS));
    interval.tick().await;
    loop {
        interval.tick().await;
        node.advance_chain().await;
    }
}
