use crate::{
    claim::ClaimInput,
    resolver::{
        sweep::{Progress, Sweep},
        Context, Contested, Effect, Event, Outcome,
    },
    witness::WitnessTemplate,
};
use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};

/// Claims our own output of a commitment: the delayed output of our
/// commitment once its relative timelock matured, or our immediately
/// spendable output of the remote commitment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitmentSweepResolver {
    output: Contested,
    close_height: u32,
    csv_delay: Option<u16>,
    sweep: Sweep,
    outcome: Outcome,
}

impl CommitmentSweepResolver {
    pub fn new(output: Contested, close_height: u32, csv_delay: Option<u16>) -> Self {
        Self {
            output,
            close_height,
            csv_delay,
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
        let template = match self.csv_delay {
            Some(csv_delay) => WitnessTemplate::DelayedSweep { csv_delay },
            None => WitnessTemplate::RemoteSweep,
        };

        self.output.claim_input(template)
    }

    /// Height after which a claim can be mined in the next block.
    fn maturity(&self) -> u32 {
        match self.csv_delay {
            Some(csv_delay) => (self.close_height + u32::from(csv_delay)).saturating_sub(1),
            None => self.close_height,
        }
    }

    pub fn advance(&mut self, event: &Event, ctx: &Context<'_>) -> Vec<Effect> {
        match event {
            Event::BlockConnected { .. } => self.poll(ctx),
            Event::Spent {
                spender, height, ..
            } => {
                if self.sweep.on_spent(spender, *height, ctx) {
                    return self.poll(ctx);
                }

                tracing::warn!(
                    "output {} was swept by foreign transaction {}",
                    self.id(),
                    spender.txid()
                );
                self.outcome = Outcome::Lost;

                Vec::new()
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
            Event::Preimage { .. } | Event::HtlcFailed { .. } => Vec::new(),
        }
    }

    fn poll(&mut self, ctx: &Context<'_>) -> Vec<Effect> {
        if ctx.height < self.maturity() {
            return Vec::new();
        }

        match self.sweep.poll(self.id(), vec![self.input()], ctx) {
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

    pub fn resume(&self) -> Vec<Effect> {
        self.sweep
            .resume(self.id(), vec![self.input()])
            .map(Effect::Broadcast)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        claim::{self, ClaimRequest},
        config::Config,
        resolver::tests::{contested, ctx, spender, sweep_script},
    };
    use bitcoin::Script;

    fn broadcasts(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|effect| matches!(effect, Effect::Broadcast(_)))
            .count()
    }

    #[test]
    fn delayed_output_is_swept_once_the_timelock_matured() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, Some(10));

        let early = resolver.advance(
            &Event::BlockConnected { height: 108 },
            &ctx(108, &script, &config),
        );
        let mature = resolver.advance(
            &Event::BlockConnected { height: 109 },
            &ctx(109, &script, &config),
        );

        assert!(early.is_empty());
        assert_eq!(broadcasts(&mature), 1);
    }

    #[test]
    fn claimed_once_our_sweep_is_buried() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, None);
        resolver.advance(
            &Event::BlockConnected { height: 100 },
            &ctx(100, &script, &config),
        );

        resolver.advance(
            &Event::Spent {
                outpoint: resolver.id(),
                spender: spender(resolver.id(), script.clone(), vec![]),
                height: 101,
            },
            &ctx(101, &script, &config),
        );
        resolver.advance(
            &Event::BlockConnected { height: 105 },
            &ctx(105, &script, &config),
        );
        assert_eq!(resolver.outcome(), Outcome::Unresolved);

        resolver.advance(
            &Event::BlockConnected { height: 106 },
            &ctx(106, &script, &config),
        );
        assert_eq!(resolver.outcome(), Outcome::Claimed);
    }

    #[test]
    fn reorged_sweep_is_broadcast_again() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, None);
        let claim = spender(resolver.id(), script.clone(), vec![]);
        resolver.advance(
            &Event::BlockConnected { height: 100 },
            &ctx(100, &script, &config),
        );
        resolver.advance(
            &Event::Spent {
                outpoint: resolver.id(),
                spender: claim.clone(),
                height: 101,
            },
            &ctx(101, &script, &config),
        );

        resolver.advance(
            &Event::SpendReorged {
                outpoint: resolver.id(),
                txid: claim.txid(),
            },
            &ctx(101, &script, &config),
        );
        let effects = resolver.advance(
            &Event::BlockConnected { height: 102 },
            &ctx(102, &script, &config),
        );

        assert_eq!(broadcasts(&effects), 1);
        assert_eq!(resolver.outcome(), Outcome::Unresolved);
    }

    #[test]
    fn rejected_broadcast_is_bumped() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, None);
        resolver.advance(
            &Event::BlockConnected { height: 100 },
            &ctx(100, &script, &config),
        );

        let effects = resolver.advance(
            &Event::BroadcastRejected {
                resolver: resolver.id(),
            },
            &ctx(100, &script, &config),
        );

        assert!(matches!(
            effects.as_slice(),
            [Effect::Broadcast(request)] if request.fee_step == 1
        ));
    }

    fn requests(effects: Vec<Effect>) -> Vec<ClaimRequest> {
        effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Broadcast(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unconfirmed_sweep_is_bumped_after_the_interval() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, None);

        let first = requests(resolver.advance(
            &Event::BlockConnected { height: 100 },
            &ctx(100, &script, &config),
        ));
        for height in 101..106 {
            let effects = resolver.advance(
                &Event::BlockConnected { height },
                &ctx(height, &script, &config),
            );
            assert!(effects.is_empty());
        }
        let bumped = requests(resolver.advance(
            &Event::BlockConnected { height: 106 },
            &ctx(106, &script, &config),
        ));

        assert_eq!(first.len(), 1);
        assert_eq!(bumped.len(), 1);
        assert_eq!(first[0].fee_step, 0);
        assert_eq!(bumped[0].fee_step, 1);

        let first = claim::build(&first[0], &script, &config.fees).unwrap();
        let bumped = claim::build(&bumped[0], &script, &config.fees).unwrap();
        assert_ne!(first.transaction.txid(), bumped.transaction.txid());

        resolver.advance(
            &Event::Spent {
                outpoint: resolver.id(),
                spender: bumped.transaction,
                height: 107,
            },
            &ctx(107, &script, &config),
        );
        resolver.advance(
            &Event::BlockConnected { height: 112 },
            &ctx(112, &script, &config),
        );
        assert_eq!(resolver.outcome(), Outcome::Claimed);
    }

    #[test]
    fn sweep_at_the_fee_cap_is_broadcast_again_unchanged() {
        let mut config = Config::default();
        config.fees.max_sat_per_vbyte = config.fees.sat_per_vbyte;
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, None);

        let first = requests(resolver.advance(
            &Event::BlockConnected { height: 100 },
            &ctx(100, &script, &config),
        ));
        let again = requests(resolver.advance(
            &Event::BlockConnected { height: 106 },
            &ctx(106, &script, &config),
        ));

        assert_eq!(again.len(), 1);
        assert_eq!(again, first);
        assert_eq!(again[0].fee_step, 0);
    }

    #[test]
    fn foreign_spend_loses_the_output() {
        let config = Config::default();
        let script = sweep_script();
        let mut resolver = CommitmentSweepResolver::new(contested(0, 50_000), 100, Some(10));

        resolver.advance(
            &Event::Spent {
                outpoint: resolver.id(),
                spender: spender(resolver.id(), Script::new(), vec![]),
                height: 102,
            },
            &ctx(102, &script, &config),
        );

        assert_eq!(resolver.outcome(), Outcome::Lost);
    }
}
