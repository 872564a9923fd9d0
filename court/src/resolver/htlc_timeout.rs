use crate::{
    channel::{Htlc, Preimage},
    claim::ClaimInput,
    oracle::CircuitResolution,
    resolver::{
        sweep::{Progress, Sweep},
        Context, Contested, Effect, Event, Outcome,
    },
    witness::WitnessTemplate,
};
use bitcoin::{OutPoint, Transaction};
use serde::{Deserialize, Serialize};

/// Takes back an HTLC we offered once it expired.
///
/// Until our timeout claim is buried the counterparty may still claim the
/// HTLC with its preimage, which we then pass upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HtlcTimeoutResolver {
    output: Contested,
    htlc: Htlc,
    preimage: Option<Preimage>,
    notified: bool,
    sweep: Sweep,
    outcome: Outcome,
}

impl HtlcTimeoutResolver {
    pub fn new(output: Contested, htlc: Htlc) -> Self {
        Self {
            output,
            htlc,
            preimage: None,
            notified: false,
            sweep: Sweep::default(),
            outcome: Outcome::Unresolved,
        }
    }

    pub fn id(&self) -> OutPoint {
        self.output.outpoint
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn value(&self) -> u64 {
        self.output.value
    }

    fn input(&self) -> ClaimInput {
        self.output.claim_input(WitnessTemplate::HtlcTimeout {
            cltv_expiry: self.htlc.cltv_expiry,
        })
    }

    pub fn advance(&mut self, event: &Event, ctx: &Context<'_>) -> Vec<Effect> {
        match event {
            Event::BlockConnected { .. } => self.poll(ctx),
            Event::Preimage {
                payment_hash,
                preimage,
            } => {
                if *payment_hash != self.htlc.payment_hash
                    || !preimage.matches(payment_hash)
                    || self.preimage.is_some()
                {
                    return Vec::new();
                }

                self.preimage = Some(*preimage);
                self.notify(CircuitResolution::Settled {
                    preimage: *preimage,
                })
            }
            Event::Spent {
                spender, height, ..
            } => {
                if self.sweep.on_spent(spender, *height, ctx) {
                    return self.poll(ctx);
                }

                self.outcome = Outcome::Lost;

                match self.extract_preimage(spender) {
                    Some(preimage) => {
                        tracing::info!(
                            "htlc {} was claimed with its preimage by {}",
                            self.htlc.htlc_id,
                            spender.txid()
                        );
                        self.preimage = Some(preimage);
                        self.notify(CircuitResolution::Settled { preimage })
                    }
                    None => {
                        tracing::warn!(
                            "htlc {} was claimed by {} without revealing its preimage",
                            self.htlc.htlc_id,
                            spender.txid()
                        );
                        self.notify(CircuitResolution::Failed)
                    }
                }
            }
            Event::SpendReorged { txid, .. } => {
                self.sweep.on_reorged(*txid);

                Vec::new()
            }
            Event::BroadcastRejected { .. } => self
                .sweep
                .on_rejected(self.id(), vec![self.input()], ctx)
                .map(Effect::Broadcast)
                .into_iter()
                .collect(),
            Event::HtlcFailed { .. } => Vec::new(),
        }
    }

    fn poll(&mut self, ctx: &Context<'_>) -> Vec<Effect> {
        // A claim with a locktime of the expiry can be mined in the block
        // after it.
        if ctx.height < self.htlc.cltv_expiry {
            return Vec::new();
        }

        match self.sweep.poll(self.id(), vec![self.input()], ctx) {
            Progress::Pending(request) => request.map(Effect::Broadcast).into_iter().collect(),
            Progress::Buried if self.preimage.is_some() => {
                self.outcome = Outcome::Claimed;
                Vec::new()
            }
            Progress::Buried => {
                self.outcome = Outcome::TimedOut;
                self.notify(CircuitResolution::Failed)
            }
            Progress::Uneconomical => {
                self.outcome = Outcome::Lost;
                if self.preimage.is_some() {
                    return Vec::new();
                }
                self.notify(CircuitResolution::Failed)
            }
        }
    }

    fn extract_preimage(&self, spender: &Transaction) -> Option<Preimage> {
        spender
            .input
            .iter()
            .filter(|input| input.previous_output == self.id())
            .flat_map(|input| input.witness.iter())
            .filter_map(|element| Preimage::from_witness_element(element))
            .find(|preimage| preimage.matches(&self.htlc.payment_hash))
    }

    fn notify(&mut self, resolution: CircuitResolution) -> Vec<Effect> {
        match self.htlc.circuit_key {
            Some(circuit) if !self.notified => {
                self.notified = true;
                vec![Effect::NotifyCircuit {
                    circuit,
                    resolution,
                }]
            }
            _ => Vec::new(),
        }
    }

    pub fn resume(&self) -> Vec<Effect> {
        self.sweep
            .resume(self.id(), vec![self.input()])
            .map(Effect::Broadcast)
            .into_iter()
            .collect()
    }
}
