//! Resolvers drive a single contested output, or in case of a breach the
//! whole revoked commitment, to a final outcome.
//!
//! Resolvers never talk to the outside world themselves. They are advanced
//! with [`Event`]s and answer with [`Effect`]s, which the arbitrator executes
//! after it has checkpointed the resolvers' new state.

mod breach;
mod commitment_sweep;
mod htlc_success;
mod htlc_timeout;
mod sweep;

pub use self::{
    breach::BreachResolver, commitment_sweep::CommitmentSweepResolver,
    htlc_success::HtlcSuccessResolver, htlc_timeout::HtlcTimeoutResolver, sweep::Sweep,
};

use crate::{
    channel::{ChannelSnapshot, Commitment, CommitmentOutput, OutputKind, PaymentHash, Preimage},
    claim::{ClaimInput, ClaimRequest},
    close::{Classification, CloseType},
    config::Config,
    keys,
    oracle::CircuitResolution,
    witness::WitnessTemplate,
    CircuitKey, Error,
};
use bitcoin::{secp256k1::PublicKey, OutPoint, Script, Transaction, Txid};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Clone, Debug, Display, PartialEq)]
pub enum Event {
    BlockConnected {
        height: u32,
    },
    Spent {
        outpoint: OutPoint,
        spender: Transaction,
        height: u32,
    },
    SpendReorged {
        outpoint: OutPoint,
        txid: Txid,
    },
    Preimage {
        payment_hash: PaymentHash,
        preimage: Preimage,
    },
    HtlcFailed {
        payment_hash: PaymentHash,
        reason: String,
    },
    BroadcastRejected {
        resolver: OutPoint,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    Broadcast(ClaimRequest),
    QueryPreimage {
        circuit: Option<CircuitKey>,
        payment_hash: PaymentHash,
    },
    NotifyCircuit {
        circuit: CircuitKey,
        resolution: CircuitResolution,
    },
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Unresolved,
    Claimed,
    TimedOut,
    Lost,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Outcome::Unresolved
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolverKind {
    CommitmentSweep,
    HtlcSuccess,
    HtlcTimeout,
    Breach,
}

/// What a resolver gets to know about the world besides the event.
#[derive(Clone, Copy, Debug)]
pub struct Context<'a> {
    /// Best block height processed by the arbitrator.
    pub height: u32,
    pub sweep_script: &'a Script,
    pub config: &'a Config,
}

impl Context<'_> {
    /// Confirmations of a transaction included at `height`.
    pub fn depth(&self, height: u32) -> u32 {
        if self.height < height {
            return 0;
        }

        self.height - height + 1
    }
}

/// An output of the closing transaction together with what is needed to
/// spend it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contested {
    pub outpoint: OutPoint,
    pub value: u64,
    pub witness_script: Script,
    pub per_commitment_point: PublicKey,
}

impl Contested {
    fn new(commitment: &Commitment, output: &CommitmentOutput) -> Self {
        Self {
            outpoint: commitment.outpoint(output),
            value: output.value,
            witness_script: output.witness_script.clone(),
            per_commitment_point: commitment.per_commitment_point,
        }
    }

    pub fn claim_input(&self, template: WitnessTemplate) -> ClaimInput {
        ClaimInput {
            outpoint: self.outpoint,
            value: self.value,
            witness_script: self.witness_script.clone(),
            per_commitment_point: self.per_commitment_point,
            template,
        }
    }
}

/// One contested output as shown to an operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContestedOutput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub kind: ResolverKind,
    pub outcome: Outcome,
    /// Set for breach outputs the cheater managed to sweep first.
    pub swept_by: Option<Txid>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Resolver {
    CommitmentSweep(CommitmentSweepResolver),
    HtlcSuccess(HtlcSuccessResolver),
    HtlcTimeout(HtlcTimeoutResolver),
    Breach(BreachResolver),
}

impl Resolver {
    /// Identity of the resolver: its (first) contested outpoint.
    pub fn id(&self) -> OutPoint {
        match self {
            Resolver::CommitmentSweep(resolver) => resolver.id(),
            Resolver::HtlcSuccess(resolver) => resolver.id(),
            Resolver::HtlcTimeout(resolver) => resolver.id(),
            Resolver::Breach(resolver) => resolver.id(),
        }
    }

    pub fn kind(&self) -> ResolverKind {
        match self {
            Resolver::CommitmentSweep(_) => ResolverKind::CommitmentSweep,
            Resolver::HtlcSuccess(_) => ResolverKind::HtlcSuccess,
            Resolver::HtlcTimeout(_) => ResolverKind::HtlcTimeout,
            Resolver::Breach(_) => ResolverKind::Breach,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Resolver::CommitmentSweep(resolver) => resolver.outcome(),
            Resolver::HtlcSuccess(resolver) => resolver.outcome(),
            Resolver::HtlcTimeout(resolver) => resolver.outcome(),
            Resolver::Breach(resolver) => resolver.outcome(),
        }
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        match self {
            Resolver::Breach(resolver) => resolver.outpoints(),
            _ => vec![self.id()],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_terminal()
    }

    /// Whether `event` is addressed to this resolver.
    pub fn concerns(&self, event: &Event) -> bool {
        match event {
            Event::Spent { outpoint, .. } | Event::SpendReorged { outpoint, .. } => {
                self.outpoints().contains(outpoint)
            }
            Event::BroadcastRejected { resolver } => *resolver == self.id(),
            Event::BlockConnected { .. } | Event::Preimage { .. } | Event::HtlcFailed { .. } => {
                true
            }
        }
    }

    pub fn advance(&mut self, event: &Event, ctx: &Context<'_>) -> Vec<Effect> {
        if self.is_terminal() {
            tracing::warn!(
                "ignoring {} for {} resolver {} which is already {}",
                event,
                self.kind(),
                self.id(),
                self.outcome()
            );
            return Vec::new();
        }

        match self {
            Resolver::CommitmentSweep(resolver) => resolver.advance(event, ctx),
            Resolver::HtlcSuccess(resolver) => resolver.advance(event, ctx),
            Resolver::HtlcTimeout(resolver) => resolver.advance(event, ctx),
            Resolver::Breach(resolver) => resolver.advance(event, ctx),
        }
    }

    /// Effects that may have been lost in a crash and have to be issued
    /// again.
    pub fn resume(&self) -> Vec<Effect> {
        if self.is_terminal() {
            return Vec::new();
        }

        match self {
            Resolver::CommitmentSweep(resolver) => resolver.resume(),
            Resolver::HtlcSuccess(resolver) => resolver.resume(),
            Resolver::HtlcTimeout(resolver) => resolver.resume(),
            Resolver::Breach(resolver) => resolver.resume(),
        }
    }

    pub fn contested_outputs(&self) -> Vec<ContestedOutput> {
        match self {
            Resolver::Breach(resolver) => resolver.contested_outputs(),
            Resolver::CommitmentSweep(resolver) => vec![self.contested(resolver.value())],
            Resolver::HtlcSuccess(resolver) => vec![self.contested(resolver.value())],
            Resolver::HtlcTimeout(resolver) => vec![self.contested(resolver.value())],
        }
    }

    fn contested(&self, value: u64) -> ContestedOutput {
        ContestedOutput {
            outpoint: self.id(),
            value,
            kind: self.kind(),
            outcome: self.outcome(),
            swept_by: None,
        }
    }
}

/// Spawns the resolvers for the contested outputs of a confirmed close.
///
/// The result only depends on the snapshot and the classification, spawning
/// twice yields the same resolvers in the same order.
pub fn spawn(
    snapshot: &ChannelSnapshot,
    classification: &Classification,
    close_height: u32,
) -> Result<Vec<Resolver>, Error> {
    let mut resolvers = match classification.close_type {
        CloseType::CooperativeClose => Vec::new(),
        CloseType::LocalForceClose => {
            spawn_force_close(&snapshot.local_commitment, close_height, Side::Local)
        }
        CloseType::RemoteForceClose => {
            let commitment = snapshot
                .remote_commitment_with_txid(classification.txid)
                .ok_or(Error::UnknownCommitment {
                    txid: classification.txid,
                    height: classification.commitment_height.unwrap_or_default(),
                })?;

            spawn_force_close(commitment, close_height, Side::Remote)
        }
        CloseType::Breach => spawn_breach(snapshot, classification)?
            .map(Resolver::Breach)
            .into_iter()
            .collect(),
    };

    resolvers.sort_by_key(|resolver| {
        let id = resolver.id();
        (id.txid, id.vout)
    });

    Ok(resolvers)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Side {
    Local,
    Remote,
}

fn spawn_force_close(commitment: &Commitment, close_height: u32, side: Side) -> Vec<Resolver> {
    commitment
        .outputs
        .iter()
        .filter_map(|output| {
            let contested = Contested::new(commitment, output);

            match (side, output.kind) {
                (Side::Local, OutputKind::ToLocal { csv_delay }) => Some(Resolver::CommitmentSweep(
                    CommitmentSweepResolver::new(contested, close_height, Some(csv_delay)),
                )),
                (Side::Remote, OutputKind::ToRemote) => Some(Resolver::CommitmentSweep(
                    CommitmentSweepResolver::new(contested, close_height, None),
                )),
                (Side::Local, OutputKind::OfferedHtlc(htlc))
                | (Side::Remote, OutputKind::ReceivedHtlc(htlc)) => Some(Resolver::HtlcTimeout(
                    HtlcTimeoutResolver::new(contested, htlc),
                )),
                (Side::Local, OutputKind::ReceivedHtlc(htlc))
                | (Side::Remote, OutputKind::OfferedHtlc(htlc)) => Some(Resolver::HtlcSuccess(
                    HtlcSuccessResolver::new(contested, htlc),
                )),
                // the counterparty's output, not ours to claim
                (Side::Local, OutputKind::ToRemote) | (Side::Remote, OutputKind::ToLocal { .. }) => {
                    None
                }
            }
        })
        .collect()
}

fn spawn_breach(
    snapshot: &ChannelSnapshot,
    classification: &Classification,
) -> Result<Option<BreachResolver>, Error> {
    let height = classification
        .commitment_height
        .ok_or(Error::MissingRevocationSecret { height: 0 })?;

    let revoked = snapshot
        .revocation_log
        .iter()
        .find(|revoked| revoked.commitment.txid == classification.txid)
        .or_else(|| snapshot.revoked_at(height))
        .ok_or(Error::MissingRevocationSecret { height })?;
    let secret = revoked
        .per_commitment_secret
        .ok_or(Error::MissingRevocationSecret { height })?;

    let commitment = &revoked.commitment;
    keys::verify_per_commitment_secret(&secret, &commitment.per_commitment_point, height)?;

    // The revocation log can only tell us about the commitment's outputs if
    // the cheater broadcast exactly the revoked commitment we know.
    if commitment.txid != classification.txid {
        return Err(Error::MissingRevocationSecret { height });
    }

    let inputs = commitment
        .outputs
        .iter()
        .map(|output| {
            let template = match output.kind {
                OutputKind::ToLocal { .. } => WitnessTemplate::Revoked {
                    htlc: false,
                    per_commitment_secret: secret,
                },
                OutputKind::ToRemote => WitnessTemplate::RemoteSweep,
                OutputKind::OfferedHtlc(_) | OutputKind::ReceivedHtlc(_) => {
                    WitnessTemplate::Revoked {
                        htlc: true,
                        per_commitment_secret: secret,
                    }
                }
            };

            Contested::new(commitment, output).claim_input(template)
        })
        .collect::<Vec<_>>();

    if inputs.is_empty() {
        return Ok(None);
    }

    Ok(Some(BreachResolver::new(commitment.txid, height, inputs)))
}
