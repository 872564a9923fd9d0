use crate::{
    claim::{self, pays_to, ClaimInput, ClaimRequest},
    resolver::Context,
};
use bitcoin::{OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// Tracks the claim of one or more contested outputs from its first
/// broadcast until it is buried.
///
/// Nothing about the claim transaction itself is stored: it is rebuilt from
/// the inputs and the fee step whenever it has to be broadcast.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    fee_step: u32,
    broadcast_height: Option<u32>,
    confirmed: Option<Confirmation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
struct Confirmation {
    txid: Txid,
    height: u32,
}

#[derive(Debug)]
pub enum Progress {
    Pending(Option<ClaimRequest>),
    Buried,
    Uneconomical,
}

impl Sweep {
    pub fn fee_step(&self) -> u32 {
        self.fee_step
    }

    pub fn poll(&mut self, resolver: OutPoint, inputs: Vec<ClaimInput>, ctx: &Context<'_>) -> Progress {
        if let Some(confirmation) = self.confirmed {
            if ctx.depth(confirmation.height) >= ctx.config.safety_depth {
                return Progress::Buried;
            }
            return Progress::Pending(None);
        }

        let broadcast_height = match self.broadcast_height {
            Some(broadcast_height) => broadcast_height,
            None => {
                let request = ClaimRequest {
                    resolver,
                    inputs,
                    fee_step: self.fee_step,
                };
                if let Err(e) = claim::build(&request, ctx.sweep_script, &ctx.config.fees) {
                    tracing::warn!("giving up on {}: {}", resolver, e);
                    return Progress::Uneconomical;
                }
                self.broadcast_height = Some(ctx.height);

                return Progress::Pending(Some(request));
            }
        };

        if ctx.height < broadcast_height.saturating_add(ctx.config.fees.bump_interval) {
            return Progress::Pending(None);
        }

        // Unconfirmed for too long: bump if we can, otherwise rebroadcast as
        // is in case the claim got evicted from the mempool.
        let request = self
            .bumped(resolver, inputs.clone(), ctx)
            .unwrap_or(ClaimRequest {
                resolver,
                inputs,
                fee_step: self.fee_step,
            });
        self.fee_step = request.fee_step;
        self.broadcast_height = Some(ctx.height);

        Progress::Pending(Some(request))
    }

    /// The claim was rejected for paying too little fee.
    pub fn on_rejected(
        &mut self,
        resolver: OutPoint,
        inputs: Vec<ClaimInput>,
        ctx: &Context<'_>,
    ) -> Option<ClaimRequest> {
        if self.confirmed.is_some() {
            return None;
        }

        match self.bumped(resolver, inputs, ctx) {
            Some(request) => {
                self.fee_step = request.fee_step;
                self.broadcast_height = Some(ctx.height);

                Some(request)
            }
            None => {
                tracing::warn!(
                    "claim of {} was rejected but its fee cannot be raised any further",
                    resolver
                );
                None
            }
        }
    }

    fn bumped(
        &self,
        resolver: OutPoint,
        inputs: Vec<ClaimInput>,
        ctx: &Context<'_>,
    ) -> Option<ClaimRequest> {
        let fees = &ctx.config.fees;
        let next = self.fee_step + 1;

        if fees.rate(next) <= fees.rate(self.fee_step) {
            return None;
        }

        let request = ClaimRequest {
            resolver,
            inputs,
            fee_step: next,
        };
        claim::build(&request, ctx.sweep_script, fees).ok()?;

        Some(request)
    }

    /// Records `spender` if it is one of our claims. Returns whether it was.
    pub fn on_spent(&mut self, spender: &Transaction, height: u32, ctx: &Context<'_>) -> bool {
        if !pays_to(spender, ctx.sweep_script) {
            return false;
        }

        let txid = spender.txid();
        match self.confirmed {
            Some(confirmation) if confirmation.txid == txid && confirmation.height == height => {}
            _ => {
                tracing::info!("claim {} confirmed at height {}", txid, height);
                self.confirmed = Some(Confirmation { txid, height });
            }
        }

        true
    }

    /// Forgets the confirmation of `txid`, after which the claim is
    /// broadcast again on the next block.
    pub fn on_reorged(&mut self, txid: Txid) -> bool {
        match self.confirmed {
            Some(confirmation) if confirmation.txid == txid => {
                tracing::warn!("claim {} was reorged out", txid);
                self.confirmed = None;
                self.broadcast_height = None;

                true
            }
            _ => false,
        }
    }

    /// The set of inputs changed, the claim has to be rebuilt and broadcast
    /// again.
    pub fn invalidate(&mut self) {
        self.broadcast_height = None;
        self.confirmed = None;
    }

    /// The claim to broadcast again after a restart, if one was in flight.
    pub fn resume(&self, resolver: OutPoint, inputs: Vec<ClaimInput>) -> Option<ClaimRequest> {
        if self.broadcast_height.is_none() || self.confirmed.is_some() {
            return None;
        }

        Some(ClaimRequest {
            resolver,
            inputs,
            fee_step: self.fee_step,
        })
    }
}
