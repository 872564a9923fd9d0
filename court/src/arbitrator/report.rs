use crate::{
    arbitrator::{ArbitratorState, Phase},
    channel::{ChannelId, ShortChannelId},
    close::CloseType,
    resolver::{ContestedOutput, Resolver},
};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

/// What an operator gets to see of an arbitration, also while it is halted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationReport {
    pub channel_id: ChannelId,
    pub short_channel_id: ShortChannelId,
    pub phase: Phase,
    pub close_type: Option<CloseType>,
    pub closing_txid: Option<Txid>,
    pub close_height: Option<u32>,
    pub best_height: u32,
    pub contested_outputs: Vec<ContestedOutput>,
    pub pending_notifications: usize,
    pub fatal: Option<String>,
    pub checkpoint_seq: u64,
}

impl From<&ArbitratorState> for ArbitrationReport {
    fn from(state: &ArbitratorState) -> Self {
        ArbitrationReport {
            channel_id: state.channel_id,
            short_channel_id: state.snapshot.short_channel_id,
            phase: state.phase,
            close_type: state.close_type(),
            closing_txid: state
                .close
                .map(|close| close.classification.txid)
                .or_else(|| {
                    state
                        .candidates
                        .first()
                        .map(|candidate| candidate.classification.txid)
                }),
            close_height: state.close.map(|close| close.confirmed_height),
            best_height: state.best_height,
            contested_outputs: state
                .resolvers
                .iter()
                .flat_map(Resolver::contested_outputs)
                .collect(),
            pending_notifications: state.pending_notifications.len(),
            fatal: state.fatal.clone(),
            checkpoint_seq: state.checkpoint_seq,
        }
    }
}
