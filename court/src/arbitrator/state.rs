use crate::{
    channel::{ChannelId, ChannelSnapshot, CircuitKey, PaymentHash},
    close::{self, Classification, CloseType},
    config::Config,
    oracle::CircuitResolution,
    resolver::{self, Context, Effect, Event, Resolver},
    Error,
};
use bitcoin::{Script, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, collections::BTreeSet};
use strum_macros::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// The channel is open as far as we know.
    Default,
    /// A closing transaction was seen but is not yet acted upon.
    ClosePending,
    /// Resolvers are working on the contested outputs.
    ContractDeployed,
    FullyResolved,
}

/// Something that happened to a channel under arbitration.
#[derive(Clone, Debug, PartialEq)]
pub enum Input {
    /// A closing transaction was handed to us by the channel-state layer.
    CloseObserved {
        transaction: Transaction,
        commitment_height: Option<u64>,
    },
    Resolver(Event),
    UpdateSnapshot(ChannelSnapshot),
    /// The forwarding layer took note of the resolution of `circuit`.
    NotificationAcknowledged { circuit: CircuitKey },
}

impl Input {
    /// Inputs of a batch are applied in this order: preimages have to be
    /// known before a block makes an HTLC expire.
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Input::Resolver(Event::Preimage { .. }) | Input::Resolver(Event::HtlcFailed { .. }) => 0,
            Input::Resolver(Event::BlockConnected { .. }) => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseCandidate {
    pub classification: Classification,
    pub transaction: Transaction,
    pub confirmed_height: Option<u32>,
}

/// The close that was acted upon. Never changes unless it is reorged out.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseSummary {
    pub classification: Classification,
    pub confirmed_height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub circuit: CircuitKey,
    pub resolution: CircuitResolution,
}

/// Everything the arbitrator of a channel knows. Checkpointed after every
/// transition and sufficient to resume after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArbitratorState {
    pub channel_id: ChannelId,
    pub phase: Phase,
    pub snapshot: ChannelSnapshot,
    /// Where every claim of this channel pays to.
    pub sweep_script: Script,
    pub best_height: u32,
    pub candidates: Vec<CloseCandidate>,
    pub close: Option<CloseSummary>,
    pub resolvers: Vec<Resolver>,
    pub pending_notifications: Vec<PendingNotification>,
    pub notified_circuits: BTreeSet<CircuitKey>,
    pub fatal: Option<String>,
    pub checkpoint_seq: u64,
}

impl ArbitratorState {
    pub fn new(snapshot: ChannelSnapshot, sweep_script: Script, best_height: u32) -> Self {
        Self {
            channel_id: snapshot.channel_id,
            phase: Phase::Default,
            snapshot,
            sweep_script,
            best_height,
            candidates: Vec::new(),
            close: None,
            resolvers: Vec::new(),
            pending_notifications: Vec::new(),
            notified_circuits: BTreeSet::new(),
            fatal: None,
            checkpoint_seq: 0,
        }
    }

    pub fn close_type(&self) -> Option<CloseType> {
        self.close
            .map(|close| close.classification.close_type)
            .or_else(|| self.best_candidate().map(|c| c.classification.close_type))
    }

    fn best_candidate(&self) -> Option<&CloseCandidate> {
        self.candidates
            .iter()
            .max_by_key(|candidate| candidate.classification.close_type.precedence())
    }

    /// Applies `input` and returns the effects to execute once the new state
    /// has been checkpointed. Circuit notifications are queued in the state
    /// instead of being returned.
    pub fn apply(&mut self, input: Input, config: &Config) -> Vec<Effect> {
        if let Input::NotificationAcknowledged { circuit } = input {
            self.acknowledge(circuit);
            return Vec::new();
        }

        if let Some(fatal) = &self.fatal {
            tracing::debug!("arbitration is halted ({}), ignoring input", fatal);
            return Vec::new();
        }

        match self.step(input, config) {
            Ok(effects) => effects
                .into_iter()
                .filter_map(|effect| match effect {
                    Effect::NotifyCircuit {
                        circuit,
                        resolution,
                    } => {
                        self.queue_notification(circuit, resolution);
                        None
                    }
                    effect => Some(effect),
                })
                .collect(),
            Err(e) => {
                self.halt_on(e);
                Vec::new()
            }
        }
    }

    /// Records `error` if it is fatal for this channel, logs it otherwise.
    pub fn halt_on(&mut self, error: Error) {
        if error.is_fatal() {
            tracing::error!(
                "arbitration of channel {} halted, funds are at risk and need manual intervention: {}",
                self.channel_id,
                error
            );
            self.fatal = Some(error.to_string());
        } else {
            tracing::warn!("{}", error);
        }
    }

    fn step(&mut self, input: Input, config: &Config) -> Result<Vec<Effect>, Error> {
        match input {
            Input::UpdateSnapshot(snapshot) => {
                if self.phase != Phase::Default {
                    tracing::warn!("ignoring channel update received in phase {}", self.phase);
                } else if snapshot.channel_id != self.channel_id {
                    tracing::warn!("ignoring update for channel {}", snapshot.channel_id);
                } else {
                    self.snapshot = snapshot;
                }

                Ok(Vec::new())
            }
            Input::CloseObserved {
                transaction,
                commitment_height,
            } => self.on_close_observed(transaction, commitment_height, None, config),
            Input::Resolver(Event::Spent {
                outpoint,
                spender,
                height,
            }) if outpoint == self.snapshot.funding_outpoint => {
                self.on_close_observed(spender, None, Some(height), config)
            }
            Input::Resolver(Event::SpendReorged { outpoint, txid })
                if outpoint == self.snapshot.funding_outpoint =>
            {
                self.on_close_reorged(txid);
                Ok(Vec::new())
            }
            Input::Resolver(Event::BlockConnected { height }) => {
                if height <= self.best_height {
                    return Ok(Vec::new());
                }
                self.best_height = height;

                match self.phase {
                    Phase::ClosePending => self.try_deploy(config),
                    Phase::ContractDeployed => {
                        Ok(self.dispatch(&Event::BlockConnected { height }, config))
                    }
                    Phase::Default | Phase::FullyResolved => Ok(Vec::new()),
                }
            }
            Input::Resolver(event) => {
                if self.phase != Phase::ContractDeployed {
                    tracing::debug!("ignoring {} in phase {}", event, self.phase);
                    return Ok(Vec::new());
                }

                Ok(self.dispatch(&event, config))
            }
            Input::NotificationAcknowledged { circuit } => {
                self.acknowledge(circuit);
                Ok(Vec::new())
            }
        }
    }

    fn on_close_observed(
        &mut self,
        transaction: Transaction,
        commitment_height: Option<u64>,
        confirmed_height: Option<u32>,
        config: &Config,
    ) -> Result<Vec<Effect>, Error> {
        let classification = close::classify(&self.snapshot, &transaction, commitment_height)?;

        match self.phase {
            Phase::Default | Phase::ClosePending => {
                match self
                    .candidates
                    .iter_mut()
                    .find(|candidate| candidate.classification.txid == classification.txid)
                {
                    Some(candidate) => {
                        if confirmed_height.is_some() {
                            candidate.confirmed_height = confirmed_height;
                        }
                    }
                    None => {
                        tracing::info!(
                            "observed {} {} of channel {}",
                            classification.close_type,
                            classification.txid,
                            self.channel_id
                        );
                        self.candidates.push(CloseCandidate {
                            classification,
                            transaction,
                            confirmed_height,
                        });
                    }
                }
                self.phase = Phase::ClosePending;

                self.try_deploy(config)
            }
            Phase::ContractDeployed | Phase::FullyResolved => {
                let acted_upon = self.close.map(|close| close.classification.txid);
                if acted_upon != Some(classification.txid) {
                    tracing::warn!(
                        "ignoring competing close {} of channel already closed by {:?}",
                        classification.txid,
                        acted_upon
                    );
                }

                Ok(Vec::new())
            }
        }
    }

    /// Acts upon the best confirmed close candidate once it is deep enough.
    fn try_deploy(&mut self, config: &Config) -> Result<Vec<Effect>, Error> {
        let best_height = self.best_height;
        let depth = config.close_confirmation_depth;

        let (classification, confirmed_height) = match self
            .candidates
            .iter()
            .filter_map(|candidate| {
                let height = candidate.confirmed_height?;

                if confirmations(best_height, height) >= depth {
                    Some((candidate.classification, height))
                } else {
                    None
                }
            })
            .max_by_key(|(classification, height)| {
                (classification.close_type.precedence(), Reverse(*height))
            }) {
            Some(ready) => ready,
            None => return Ok(Vec::new()),
        };

        let resolvers = resolver::spawn(&self.snapshot, &classification, confirmed_height)?;

        // nothing watches a close without resolvers once it is acted upon
        if resolvers.is_empty() && confirmations(best_height, confirmed_height) < config.safety_depth
        {
            return Ok(Vec::new());
        }

        tracing::info!(
            "acting upon {} {} confirmed at height {}",
            classification.close_type,
            classification.txid,
            confirmed_height
        );
        self.close = Some(CloseSummary {
            classification,
            confirmed_height,
        });
        self.candidates.clear();

        if resolvers.is_empty() {
            tracing::info!("nothing to resolve, channel {} is closed", self.channel_id);
            self.phase = Phase::FullyResolved;
            return Ok(Vec::new());
        }

        tracing::info!("spawned {} resolvers", resolvers.len());
        self.resolvers = resolvers;
        self.phase = Phase::ContractDeployed;

        Ok(self.dispatch(&Event::BlockConnected { height: best_height }, config))
    }

    fn on_close_reorged(&mut self, txid: Txid) {
        match self.phase {
            Phase::ClosePending => {
                self.candidates
                    .retain(|candidate| candidate.classification.txid != txid);
                if self.candidates.is_empty() {
                    tracing::warn!("close {} was reorged out", txid);
                    self.phase = Phase::Default;
                }
            }
            Phase::ContractDeployed
                if self.close.map(|close| close.classification.txid) == Some(txid) =>
            {
                tracing::warn!(
                    "close {} was reorged out, discarding {} resolvers",
                    txid,
                    self.resolvers.len()
                );
                self.phase = Phase::Default;
                self.close = None;
                self.candidates.clear();
                self.resolvers.clear();
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, event: &Event, config: &Config) -> Vec<Effect> {
        let ctx = Context {
            height: self.best_height,
            sweep_script: &self.sweep_script,
            config,
        };
        let broadcast_to_all = matches!(
            event,
            Event::BlockConnected { .. } | Event::Preimage { .. } | Event::HtlcFailed { .. }
        );

        let mut effects = Vec::new();
        let mut updates = Vec::new();

        for resolver in self.resolvers.iter_mut() {
            if !resolver.concerns(event) || (broadcast_to_all && resolver.is_terminal()) {
                continue;
            }

            let before = resolver.outcome();
            effects.extend(resolver.advance(event, &ctx));

            if resolver.outcome() != before {
                updates.push((resolver.kind(), resolver.id(), resolver.outcome()));
            }
        }

        for (kind, id, outcome) in updates {
            tracing::info!("{} resolver {} is {}", kind, id, outcome);
        }
        self.try_finish(config);

        effects
    }

    /// Outputs can be lost to a foreign spend early on, the arbitration is
    /// only over once the close itself can no longer be reorged.
    fn try_finish(&mut self, config: &Config) {
        if self.phase != Phase::ContractDeployed
            || !self.resolvers.iter().all(Resolver::is_terminal)
        {
            return;
        }

        let close_height = match self.close {
            Some(close) => close.confirmed_height,
            None => return,
        };
        if confirmations(self.best_height, close_height) < config.safety_depth {
            return;
        }

        tracing::info!("every contested output of channel {} is resolved", self.channel_id);
        self.phase = Phase::FullyResolved;
    }

    pub(crate) fn queue_notification(&mut self, circuit: CircuitKey, resolution: CircuitResolution) {
        if self.notified_circuits.contains(&circuit)
            || self
                .pending_notifications
                .iter()
                .any(|pending| pending.circuit == circuit)
        {
            tracing::debug!("circuit {} has already been resolved", circuit);
            return;
        }

        self.pending_notifications.push(PendingNotification {
            circuit,
            resolution,
        });
    }

    fn acknowledge(&mut self, circuit: CircuitKey) {
        self.pending_notifications
            .retain(|pending| pending.circuit != circuit);
        self.notified_circuits.insert(circuit);
    }

    /// HTLCs whose claim is waiting for a preimage.
    pub fn awaiting_preimages(&self) -> Vec<(Option<CircuitKey>, PaymentHash)> {
        if self.phase != Phase::ContractDeployed {
            return Vec::new();
        }

        self.resolvers
            .iter()
            .filter_map(|resolver| match resolver {
                Resolver::HtlcSuccess(resolver) => resolver.awaiting_preimage(),
                _ => None,
            })
            .collect()
    }

    /// Effects that may have been lost in a crash.
    pub fn resume(&self) -> Vec<Effect> {
        if self.fatal.is_some() || self.phase != Phase::ContractDeployed {
            return Vec::new();
        }

        self.resolvers.iter().flat_map(Resolver::resume).collect()
    }
}

fn confirmations(best_height: u32, confirmed_height: u32) -> u32 {
    (best_height + 1).saturating_sub(confirmed_height)
}
