use crate::{command::Wiring, config::Settings};
use anyhow::Context;
use court::{
    chain::{BitcoindConnector, BlockWatcher},
    Court,
};
use std::{sync::Arc, time::Duration};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Blocks remembered for reorg detection, also rescanned for outpoints
/// registered late.
const RECENT_BLOCKS: usize = 144;

pub async fn run(settings: &Settings, wiring: &Wiring) -> anyhow::Result<()> {
    let node_url = settings.bitcoin.bitcoind.node_url.clone();
    let connector = Arc::new(BitcoindConnector::new(node_url.clone())?);

    let chain_info = connector
        .chain_info()
        .await
        .with_context(|| format!("failed to reach bitcoind at {}", node_url))?;
    tracing::info!(
        "connected to bitcoind, best block {} at height {}",
        chain_info.bestblockhash,
        chain_info.blocks
    );

    let (watcher, chain) = BlockWatcher::new(connector, POLL_INTERVAL, RECENT_BLOCKS);
    tokio::spawn(watcher.run());

    let court = Court::new(
        settings.court.config,
        wiring.services.clone(),
        Arc::new(chain),
        wiring.sweep_script.clone(),
    );
    court
        .start()
        .await
        .context("failed to resume arbitrations")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("received ctrl-c, shutting down");
    court.shutdown().await;

    Ok(())
}
