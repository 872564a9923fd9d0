//! Interfaces to the invoice registry and the forwarding layer.

use crate::channel::{CircuitKey, PaymentHash, Preimage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the invoice registry knows about an HTLC.
#[derive(Clone, Debug, PartialEq)]
pub enum HtlcResolution {
    Settled(Preimage),
    Failed(String),
    Pending,
}

/// Supplies the preimages needed to claim incoming HTLCs.
///
/// Asking repeatedly must not have any side effect beyond the first
/// authoritative answer.
#[async_trait]
pub trait PreimageOracle: Send + Sync + 'static {
    async fn resolve_htlc(
        &self,
        circuit: Option<CircuitKey>,
        payment_hash: PaymentHash,
    ) -> anyhow::Result<HtlcResolution>;
}

/// On-chain fate of an HTLC as reported upstream.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, strum_macros::Display)]
pub enum CircuitResolution {
    Settled { preimage: Preimage },
    Failed,
}

/// Tells the forwarding layer how the upstream leg of an HTLC has to be
/// resolved.
#[async_trait]
pub trait CircuitNotifier: Send + Sync + 'static {
    /// Returns `false` if the circuit had already been resolved, in which
    /// case the notification was a no-op.
    async fn notify_resolution(
        &self,
        circuit: CircuitKey,
        resolution: CircuitResolution,
    ) -> anyhow::Result<bool>;
}
