//! The arbitrator of a single channel.
//!
//! [`ArbitratorState`] decides, [`ChannelArbitrator`] executes. Every input
//! is applied to the state, the new state is checkpointed and only then are
//! the resulting effects carried out. A crash between the checkpoint and the
//! effects is recovered from by [`ChannelArbitrator::resume`].

mod report;
mod state;

pub use self::{
    report::ArbitrationReport,
    state::{
        ArbitratorState, CloseCandidate, CloseSummary, Input, PendingNotification, Phase,
    },
};

use crate::{
    chain::{BroadcastError, Broadcaster},
    channel::{CircuitKey, PaymentHash},
    claim::{self, ClaimRequest},
    config::Config,
    keys::Signer,
    oracle::{CircuitNotifier, HtlcResolution, PreimageOracle},
    resolver::{Effect, Event},
    store::ResolutionStore,
};
use anyhow::Context;
use std::{collections::VecDeque, fmt, sync::Arc};

/// The outside world as seen by an arbitrator.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn ResolutionStore>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub oracle: Arc<dyn PreimageOracle>,
    pub notifier: Arc<dyn CircuitNotifier>,
    pub signer: Arc<dyn Signer>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services").finish()
    }
}

#[derive(Debug)]
pub struct ChannelArbitrator {
    state: ArbitratorState,
    config: Config,
    services: Services,
}

impl ChannelArbitrator {
    pub fn new(state: ArbitratorState, config: Config, services: Services) -> Self {
        Self {
            state,
            config,
            services,
        }
    }

    pub fn state(&self) -> &ArbitratorState {
        &self.state
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn report(&self) -> ArbitrationReport {
        ArbitrationReport::from(&self.state)
    }

    /// Processes a batch of inputs that arrived together.
    ///
    /// Returns an error only if the state could not be checkpointed, in which
    /// case nothing that was decided on since the last checkpoint has been
    /// executed.
    pub async fn handle(&mut self, mut inputs: Vec<Input>) -> anyhow::Result<()> {
        inputs.sort_by_key(Input::priority);

        // A block may make an HTLC expire, ask for preimages that became
        // available since the last block first.
        let connects_block = inputs
            .iter()
            .any(|input| matches!(input, Input::Resolver(Event::BlockConnected { .. })));
        if connects_block {
            let learned = self.query_preimages(self.state.awaiting_preimages()).await;
            inputs.splice(0..0, learned);
        }

        let mut queue = VecDeque::from(inputs);
        while let Some(input) = queue.pop_front() {
            let before = self.state.clone();
            let effects = self.state.apply(input, &self.config);

            if self.state == before && effects.is_empty() {
                continue;
            }
            self.checkpoint().await?;

            for effect in effects {
                queue.extend(self.execute(effect).await?);
            }
        }

        self.flush_notifications().await
    }

    /// Issues again whatever may have been lost in a crash: the claims that
    /// were in flight, preimage queries and circuit notifications.
    pub async fn resume(&mut self) -> anyhow::Result<()> {
        if let Some(fatal) = &self.state.fatal {
            tracing::error!("arbitration is halted: {}", fatal);
        }

        let mut inputs = Vec::new();
        for effect in self.state.resume() {
            inputs.extend(self.execute(effect).await?);
        }

        self.handle(inputs).await
    }

    async fn checkpoint(&mut self) -> anyhow::Result<()> {
        self.state.checkpoint_seq += 1;

        self.services
            .store
            .checkpoint(&self.state)
            .await
            .with_context(|| format!("failed to checkpoint channel {}", self.state.channel_id))
    }

    /// Carries out `effect` and returns the inputs it produced.
    async fn execute(&mut self, effect: Effect) -> anyhow::Result<Vec<Input>> {
        match effect {
            Effect::Broadcast(request) => self.broadcast(request).await,
            Effect::QueryPreimage {
                circuit,
                payment_hash,
            } => Ok(self.query_preimages(vec![(circuit, payment_hash)]).await),
            Effect::NotifyCircuit {
                circuit,
                resolution,
            } => {
                self.state.queue_notification(circuit, resolution);
                self.checkpoint().await?;

                Ok(Vec::new())
            }
        }
    }

    async fn broadcast(&mut self, request: ClaimRequest) -> anyhow::Result<Vec<Input>> {
        let resolver = request.resolver;

        let mut claim = match claim::build(&request, &self.state.sweep_script, &self.config.fees) {
            Ok(claim) => claim,
            Err(e) => {
                tracing::warn!("not broadcasting claim of {}: {}", resolver, e);
                return Ok(Vec::new());
            }
        };

        if let Err(e) = self.services.signer.sign(&mut claim) {
            self.state.halt_on(e);
            self.checkpoint().await?;

            return Ok(Vec::new());
        }

        match self.services.broadcaster.broadcast(&claim.transaction).await {
            Ok(txid) => {
                tracing::info!(
                    "broadcast claim {} of {} at fee step {}",
                    txid,
                    resolver,
                    request.fee_step
                );
                Ok(Vec::new())
            }
            Err(BroadcastError::InsufficientFee) => {
                tracing::info!("claim of {} pays too little fee", resolver);
                Ok(vec![Input::Resolver(Event::BroadcastRejected { resolver })])
            }
            Err(BroadcastError::Other(e)) => {
                // the claim goes out again with the next bump
                tracing::warn!("failed to broadcast claim of {}: {:#}", resolver, e);
                Ok(Vec::new())
            }
        }
    }

    async fn query_preimages(&self, queries: Vec<(Option<CircuitKey>, PaymentHash)>) -> Vec<Input> {
        let mut inputs = Vec::new();

        for (circuit, payment_hash) in queries {
            match self.services.oracle.resolve_htlc(circuit, payment_hash).await {
                Ok(HtlcResolution::Settled(preimage)) => {
                    inputs.push(Input::Resolver(Event::Preimage {
                        payment_hash,
                        preimage,
                    }))
                }
                Ok(HtlcResolution::Failed(reason)) => {
                    inputs.push(Input::Resolver(Event::HtlcFailed {
                        payment_hash,
                        reason,
                    }))
                }
                Ok(HtlcResolution::Pending) => {}
                Err(e) => tracing::warn!("failed to look up preimage of {}: {:#}", payment_hash, e),
            }
        }

        inputs
    }

    /// Delivers queued circuit notifications. Undelivered ones stay queued
    /// and are retried with the next batch.
    async fn flush_notifications(&mut self) -> anyhow::Result<()> {
        for pending in self.state.pending_notifications.clone() {
            let circuit = pending.circuit;

            match self
                .services
                .notifier
                .notify_resolution(circuit, pending.resolution)
                .await
            {
                Ok(true) => tracing::info!("notified circuit {}: {}", circuit, pending.resolution),
                Ok(false) => tracing::debug!("circuit {} was already resolved upstream", circuit),
                Err(e) => {
                    tracing::warn!("failed to notify circuit {}: {:#}", circuit, e);
                    continue;
                }
            }

            self.state
                .apply(Input::NotificationAcknowledged { circuit }, &self.config);
            self.checkpoint().await?;
        }

        Ok(())
    }
}
