use crate::{arbitrator::ArbitratorState, channel::ChannelId};
use async_trait::async_trait;

/// Durable record of every arbitration in progress.
///
/// A transition of an arbitrator only counts as committed once `checkpoint`
/// returned, and `load` has to give back exactly what was checkpointed.
#[async_trait]
pub trait ResolutionStore: Send + Sync + 'static {
    async fn checkpoint(&self, state: &ArbitratorState) -> anyhow::Result<()>;

    async fn load(&self, channel_id: &ChannelId) -> anyhow::Result<Option<ArbitratorState>>;

    /// Removes a finished arbitration from active tracking.
    async fn delete(&self, channel_id: &ChannelId) -> anyhow::Result<()>;

    async fn active_channels(&self) -> anyhow::Result<Vec<ChannelId>>;
}
