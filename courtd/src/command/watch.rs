use crate::{command::Wiring, config::Settings};
use anyhow::Context;
use court::{
    ArbitrationReport, ArbitratorState, ChannelArbitrator, ChannelSnapshot, Input,
    ResolutionStore,
};
use std::{fs, path::Path};

/// Starts arbitrating the channel of the snapshot at `path`. A channel under
/// arbitration already gets its snapshot replaced.
pub async fn watch(
    settings: &Settings,
    wiring: &Wiring,
    path: &Path,
) -> anyhow::Result<ArbitrationReport> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot = serde_json::from_str::<ChannelSnapshot>(&contents)
        .with_context(|| format!("{} is not a channel snapshot", path.display()))?;
    let channel_id = snapshot.channel_id;

    match wiring.database.load(&channel_id).await? {
        Some(state) => {
            let mut arbitrator =
                ChannelArbitrator::new(state, settings.court.config, wiring.services.clone());
            arbitrator
                .handle(vec![Input::UpdateSnapshot(snapshot)])
                .await?;

            tracing::info!("updated snapshot of channel {}", channel_id);
            Ok(arbitrator.report())
        }
        None => {
            let state = ArbitratorState::new(snapshot, wiring.sweep_script.clone(), 0);
            wiring.database.checkpoint(&state).await?;

            tracing::info!("channel {} is now under arbitration", channel_id);
            Ok(ArbitrationReport::from(&state))
        }
    }
}
