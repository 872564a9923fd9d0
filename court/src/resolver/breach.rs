use crate::{
    claim::ClaimInput,
    resolver::{
        sweep::{Progress, Sweep},
        Context, ContestedOutput, Effect, Event, Outcome, ResolverKind,
    },
};
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

/// Sweeps every output of a revoked commitment in a single justice
/// transaction.
///
/// Outputs the cheater manages to sweep first are dropped from the package,
/// which is then rebuilt over what is left.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreachResolver {
    commitment_txid: Txid,
    commitment_height: u64,
    outputs: Vec<BreachOutput>,
    sweep: Sweep,
    outcome: Outcome,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct BreachOutput {
    input: ClaimInput,
    swept_by: Option<Txid>,
}

impl BreachResolver {
    pub fn new(commitment_txid: Txid, commitment_height: u64, mut inputs: Vec<ClaimInput>) -> Self {
        inputs.sort_by_key(|input| (input.outpoint.txid, input.outpoint.vout));

        Self {
            commitment_txid,
            commitment_height,
            outputs: inputs
                .into_iter()
                .map(|input| BreachOutput {
                    input,
                    swept_by: None,
                })
                .collect(),
            sweep: Sweep::default(),
            outcome: Outcome::Unresolved,
        }
    }

    pub fn id(&self) -> OutPoint {
        self.outputs
            .first()
            .map(|output| output.input.outpoint)
            .unwrap_or(OutPoint {
                txid: self.commitment_txid,
                vout: 0,
            })
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.outputs
            .iter()
            .map(|output| output.input.outpoint)
            .collect()
    }

    pub fn contested_outputs(&self) -> Vec<ContestedOutput> {
        self.outputs
            .iter()
            .map(|output| ContestedOutput {
                outpoint: output.input.outpoint,
                value: output.input.value,
                kind: ResolverKind::Breach,
                outcome: match (self.outcome, output.swept_by) {
                    (_, Some(_)) => Outcome::Lost,
                    (outcome, None) => outcome,
                },
                swept_by: output.swept_by,
            })
            .collect()
    }

    /// Outputs still part of the justice transaction.
    fn inputs(&self) -> Vec<ClaimInput> {
        self.outputs
            .iter()
            .filter(|output| output.swept_by.is_none())
            .map(|output| output.input.clone())
            .collect()
    }

    pub fn advance(&mut self, event: &Event, ctx: &Context<'_>) -> Vec<Effect> {
        match event {
            Event::BlockConnected { .. } => self.poll(ctx),
            Event::Spent {
                outpoint,
                spender,
                height,
            } => {
                if self.sweep.on_spent(spender, *height, ctx) {
                    return self.poll(ctx);
                }

                let txid = spender.txid();
                let output = match self
                    .outputs
                    .iter_mut()
                    .find(|output| output.input.outpoint == *outpoint)
                {
                    Some(output) => output,
                    None => return Vec::new(),
                };
                if output.swept_by == Some(txid) {
                    return Vec::new();
                }

                tracing::warn!(
                    "cheater swept {} of revoked commitment {} in {}",
                    outpoint,
                    self.commitment_height,
                    txid
                );
                output.swept_by = Some(txid);
                self.sweep.invalidate();

                self.poll(ctx)
            }
            Event::SpendReorged { outpoint, txid } => {
                if self.sweep.on_reorged(*txid) {
                    return Vec::new();
                }

                if let Some(output) = self.outputs.iter_mut().find(|output| {
                    output.input.outpoint == *outpoint && output.swept_by == Some(*txid)
                }) {
                    tracing::info!("sweep of {} by the cheater was reorged out", outpoint);
                    output.swept_by = None;
                    self.sweep.invalidate();
                }

                Vec::new()
            }
            Event::BroadcastRejected { .. } => {
                let inputs = self.inputs();
                if inputs.is_empty() {
                    return Vec::new();
                }

                self.sweep
                    .on_rejected(self.id(), inputs, ctx)
                    .map(Effect::Broadcast)
                    .into_iter()
                    .collect()
            }
            Event::Preimage { .. } | Event::HtlcFailed { .. } => Vec::new(),
        }
    }

    fn poll(&mut self, ctx: &Context<'_>) -> Vec<Effect> {
        let inputs = self.inputs();
        if inputs.is_empty() {
            tracing::error!(
                "cheater swept every output of revoked commitment {}",
                self.commitment_height
            );
            self.outcome = Outcome::Lost;

            return Vec::new();
        }

        match self.sweep.poll(self.id(), inputs, ctx) {
            Progress::Pending(request) => request.map(Effect::Broadcast).into_iter().collect(),
            Progress::Buried => {
                tracing::info!(
                    "justice transaction for revoked commitment {} is buried",
                    self.commitment_height
                );
                self.outcome = Outcome::Claimed;
                Vec::new()
            }
            Progress::Uneconomical => {
                self.outcome = Outcome::Lost;
                Vec::new()
            }
        }
    }

    pub fn resume(&self) -> Vec<Effect> {
        let inputs = self.inputs();
        if inputs.is_empty() {
            return Vec::new();
        }

        self.sweep
            .resume(self.id(), inputs)
            .map(Effect::Broadcast)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        resolver::tests::{contested, ctx, spender, sweep_script},
        witness::WitnessTemplate,
    };
    use bitcoin::{hashes::Hash, secp256k1::SecretKey, Script};

    fn resolver() -> BreachResolver {
        let secret = SecretKey::from_slice(&[4; 32]).unwrap();
        let revoked = |htlc| WitnessTemplate::Revoked {
            htlc,
            per_commitment_secret: secret,
        };

        BreachResolver::new(
            Txid::from_inner([7; 32]),
            5,
            vec![
                contested(2, 30_000).claim_input(revoked(true)),
                contested(0, 500_000).claim_input(revoked(false)),
                contested(1, 40_000).claim_input(revoked(true)),
            ],
        )
    }

    fn broadcast(effects: &[Effect]) -> Vec<OutPoint> {
        match effects {
            [Effect::Broadcast(request)] => request
                .inputs
                .iter()
                .map(|input| input.outpoint)
                .collect(),
            effects => panic!("expected a single broadcast, got {:?}", effects),
        }
    }

    #[test]
    fn justice_transaction_spends_every_output() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();

        let effects = resolver.advance(
            &Event::BlockConnected { height: 200 },
            &ctx(200, &script, &config),
        );

        assert_eq!(broadcast(&effects), resolver.outpoints());
        assert_eq!(resolver.id().vout, 0);
    }

    #[test]
    fn outputs_swept_by_the_cheater_are_dropped_from_the_package() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();
        resolver.advance(
            &Event::BlockConnected { height: 200 },
            &ctx(200, &script, &config),
        );
        let swept = resolver.outpoints()[2];

        let effects = resolver.advance(
            &Event::Spent {
                outpoint: swept,
                spender: spender(swept, Script::new(), vec![]),
                height: 201,
            },
            &ctx(201, &script, &config),
        );

        assert_eq!(broadcast(&effects), resolver.outpoints()[..2].to_vec());
        let lost = resolver
            .contested_outputs()
            .into_iter()
            .filter(|output| output.outcome == Outcome::Lost)
            .count();
        assert_eq!(lost, 1);
    }

    #[test]
    fn reorged_cheater_sweep_restores_the_output() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();
        let swept = resolver.outpoints()[1];
        let cheat = spender(swept, Script::new(), vec![]);
        resolver.advance(
            &Event::Spent {
                outpoint: swept,
                spender: cheat.clone(),
                height: 201,
            },
            &ctx(201, &script, &config),
        );

        resolver.advance(
            &Event::SpendReorged {
                outpoint: swept,
                txid: cheat.txid(),
            },
            &ctx(201, &script, &config),
        );
        let effects = resolver.advance(
            &Event::BlockConnected { height: 202 },
            &ctx(202, &script, &config),
        );

        assert_eq!(broadcast(&effects).len(), 3);
    }

    #[test]
    fn claimed_only_at_safety_depth() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = resolver();
        resolver.advance(
            &Event::BlockConnected { height: 200 },
            &ctx(200, &script, &config),
        );
        for outpoint in resolver.outpoints() {
            resolver.advance(
                &Event::Spent {
                    outpoint,
                    spender: spender(outpoint, script.clone(), vec![]),
                    height: 201,
                },
                &ctx(201, &script, &config),
            );
        }

        resolver.advance(
            &Event::BlockConnected { height: 205 },
            &ctx(205, &script, &config),
        );
        assert_eq!(resolver.outcome(), Outcome::Unresolved);

        resolver.advance(
            &Event::BlockConnected { height: 206 },
            &ctx(206, &script, &config),
        );
        assert_eq!(resolver.outcome(), Outcome::Claimed);
    }
}
