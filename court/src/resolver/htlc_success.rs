use crate::{
    channel::{CircuitKey, Htlc, PaymentHash, Preimage},
    claim::ClaimInput,
    oracle::CircuitResolution,
    resolver::{
        sweep::{Progress, Sweep},
        Context, Contested, Effect, Event, Outcome,
    },
    witness::WitnessTemplate,
};
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

/// Claims an HTLC paying to us with its preimage.
///
/// Without a preimage the resolver keeps asking the oracle until the HTLC
/// expires, after which the counterparty can take it back and the upstream
/// leg has to be failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HtlcSuccessResolver {
    output: Contested,
    htlc: Htlc,
    preimage: Option<Preimage>,
    notified: bool,
    sweep: Sweep,
    outcome: Outcome,
}

impl HtlcSuccessResolver {
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

    pub fn awaiting_preimage(&self) -> Option<(Option<CircuitKey>, PaymentHash)> {
        if self.preimage.is_some() || self.outcome.is_terminal() {
            return None;
        }

        Some((self.htlc.circuit_key, self.htlc.payment_hash))
    }

    fn input(&self, preimage: Preimage) -> ClaimInput {
        self.output
            .claim_input(WitnessTemplate::HtlcSuccess { preimage })
    }

    pub fn advance(&mut self, event: &Event, ctx: &Context<'_>) -> Vec<Effect> {
        match event {
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

                tracing::info!("learned preimage of htlc {}", self.htlc.htlc_id);
                self.preimage = Some(*preimage);

                let mut effects = self.notify(CircuitResolution::Settled {
                    preimage: *preimage,
                });
                effects.extend(self.poll(ctx));
                effects
            }
            Event::HtlcFailed {
                payment_hash,
                reason,
            } => {
                if *payment_hash != self.htlc.payment_hash || self.preimage.is_some() {
                    return Vec::new();
                }

                tracing::info!("htlc {} failed upstream: {}", self.htlc.htlc_id, reason);
                self.lose()
            }
            Event::BlockConnected { .. } => self.poll(ctx),
            Event::Spent {
                spender, height, ..
            } => {
                if self.sweep.on_spent(spender, *height, ctx) {
                    return self.poll(ctx);
                }

                tracing::warn!(
                    "htlc {} was claimed by foreign transaction {}",
                    self.htlc.htlc_id,
                    spender.txid()
                );
                self.lose()
            }
            Event::SpendReorged { txid, .. } => {
                self.sweep.on_reorged(*txid);

                Vec::new()
            }
            Event::BroadcastRejected { .. } => match self.preimage {
                Some(preimage) => self
                    .sweep
                    .on_rejected(self.id(), vec![self.input(preimage)], ctx)
                    .map(Effect::Broadcast)
                    .into_iter()
                    .collect(),
                None => Vec::new(),
            },
        }
    }

    fn poll(&mut self, ctx: &Context<'_>) -> Vec<Effect> {
        let preimage = match self.preimage {
            Some(preimage) => preimage,
            None if ctx.height >= self.htlc.cltv_expiry => {
                tracing::warn!(
                    "htlc {} expired at {} before its preimage became known",
                    self.htlc.htlc_id,
                    self.htlc.cltv_expiry
                );
                return self.lose();
            }
            None => return vec![self.query()],
        };

        match self.sweep.poll(self.id(), vec![self.input(preimage)], ctx) {
            Progress::Pending(request) => request.map(Effect::Broadcast).into_iter().collect(),
            Progress::Buried => {
                self.outcome = Outcome::Claimed;
                Vec::new()
            }
            Progress::Uneconomical => {
                self.outcome = Outcome::Lost;
                Vec::new()
            }
        }
    }

    /// The output is gone. Fails the upstream leg unless it has already been
    /// settled.
    fn lose(&mut self) -> Vec<Effect> {
        self.outcome = Outcome::Lost;

        if self.preimage.is_some() {
            return Vec::new();
        }

        self.notify(CircuitResolution::Failed)
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

    fn query(&self) -> Effect {
        Effect::QueryPreimage {
            circuit: self.htlc.circuit_key,
            payment_hash: self.htlc.payment_hash,
        }
    }

    pub fn resume(&self) -> Vec<Effect> {
        match self.preimage {
            Some(preimage) => self
                .sweep
                .resume(self.id(), vec![self.input(preimage)])
                .map(Effect::Broadcast)
                .into_iter()
                .collect(),
            None => vec![self.query()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        resolver::tests::{contested, ctx, htlc, spender, sweep_script},
    };
    use bitcoin::Script;

    fn preimage() -> Preimage {
        Preimage::from([21; 32])
    }

    fn resolver() -> HtlcSuccessResolver {
        HtlcSuccessResolver::new(contested(2, 60_000), htlc(7, preimage(), 500))
    }

    fn preimage_event() -> Event {
        Event::Preimage {
            payment_hash: preimage().hash(),
            preimage: preimage(),
        }
    }

    #[test]
    fn asks_for_the_preimage_while_unknown() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();

        let effects = resolver.advance(
            &Event::BlockConnected { height: 400 },
            &ctx(400, &script, &config),
        );

        assert!(matches!(
            effects.as_slice(),
            [Effect::QueryPreimage { payment_hash, .. }] if *payment_hash == preimage().hash()
        ));
    }

    #[test]
    fn preimage_settles_upstream_once_and_claims() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();

        let effects = resolver.advance(&preimage_event(), &ctx(400, &script, &config));
        let again = resolver.advance(&preimage_event(), &ctx(400, &script, &config));

        assert_eq!(effects.len(), 2);
        assert!(matches!(
            effects[0],
            Effect::NotifyCircuit {
                resolution: CircuitResolution::Settled { .. },
                ..
            }
        ));
        assert!(matches!(effects[1], Effect::Broadcast(_)));
        assert!(again.is_empty());
    }

    #[test]
    fn preimage_wins_over_expiry_in_the_same_block() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();

        resolver.advance(&preimage_event(), &ctx(500, &script, &config));
        resolver.advance(
            &Event::BlockConnected { height: 500 },
            &ctx(500, &script, &config),
        );
        resolver.advance(
            &Event::Spent {
                outpoint: resolver.id(),
                spender: spender(resolver.id(), script.clone(), vec![]),
                height: 501,
            },
            &ctx(501, &script, &config),
        );
        resolver.advance(
            &Event::BlockConnected { height: 506 },
            &ctx(506, &script, &config),
        );

        assert_eq!(resolver.outcome(), Outcome::Claimed);
    }

    #[test]
    fn expiry_without_preimage_fails_upstream() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();

        let effects = resolver.advance(
            &Event::BlockConnected { height: 500 },
            &ctx(500, &script, &config),
        );

        assert_eq!(resolver.outcome(), Outcome::Lost);
        assert!(matches!(
            effects.as_slice(),
            [Effect::NotifyCircuit {
                resolution: CircuitResolution::Failed,
                ..
            }]
        ));
    }

    #[test]
    fn oracle_failure_fails_upstream() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();

        let effects = resolver.advance(
            &Event::HtlcFailed {
                payment_hash: preimage().hash(),
                reason: "invoice canceled".to_owned(),
            },
            &ctx(400, &script, &config),
        );

        assert_eq!(resolver.outcome(), Outcome::Lost);
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn foreign_claim_after_settlement_does_not_notify_again() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();
        resolver.advance(&preimage_event(), &ctx(400, &script, &config));

        let effects = resolver.advance(
            &Event::Spent {
                outpoint: resolver.id(),
                spender: spender(resolver.id(), Script::new(), vec![]),
                height: 510,
            },
            &ctx(510, &script, &config),
        );

        assert_eq!(resolver.outcome(), Outcome::Lost);
        assert!(effects.is_empty());
    }
}
