use crate::{
    channel::{CircuitKey, PaymentHash, Preimage},
    database::{deserialize, serialize, Database},
    oracle::{HtlcResolution, PreimageOracle},
};
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Final state of an invoice. Only the first one recorded for a payment hash
/// counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Invoice {
    Settled { preimage: Preimage },
    Canceled { reason: String },
}

impl Database {
    /// Returns `false` if the invoice had already been canceled.
    pub async fn settle_invoice(&self, preimage: Preimage) -> anyhow::Result<bool> {
        self.record_invoice(preimage.hash(), Invoice::Settled { preimage })
            .await
    }

    /// Returns `false` if the invoice had already been settled.
    pub async fn cancel_invoice(
        &self,
        payment_hash: PaymentHash,
        reason: String,
    ) -> anyhow::Result<bool> {
        self.record_invoice(payment_hash, Invoice::Canceled { reason })
            .await
    }

    pub fn invoice(&self, payment_hash: &PaymentHash) -> anyhow::Result<Option<Invoice>> {
        self.invoices
            .get(&payment_hash.as_bytes()[..])?
            .map(|bytes| deserialize(&bytes).context("Could not deserialize invoice"))
            .transpose()
    }

    async fn record_invoice(
        &self,
        payment_hash: PaymentHash,
        invoice: Invoice,
    ) -> anyhow::Result<bool> {
        let new_value = serialize(&invoice)?;

        match self
            .invoices
            .compare_and_swap(
                &payment_hash.as_bytes()[..],
                Option::<Vec<u8>>::None,
                Some(new_value),
            )
            .context("Could not write in the DB")?
        {
            Ok(()) => {
                self.flush().await?;
                Ok(true)
            }
            Err(_) => {
                let current = self.invoice(&payment_hash)?;
                if current.as_ref() != Some(&invoice) {
                    tracing::warn!(
                        "invoice {} is already final ({:?}), ignoring {:?}",
                        payment_hash,
                        current,
                        invoice
                    );
                    return Ok(false);
                }

                Ok(true)
            }
        }
    }
}

#[async_trait::async_trait]
impl PreimageOracle for Database {
    async fn resolve_htlc(
        &self,
        circuit: Option<CircuitKey>,
        payment_hash: PaymentHash,
    ) -> anyhow::Result<HtlcResolution> {
        let resolution = match self.invoice(&payment_hash)? {
            Some(Invoice::Settled { preimage }) => HtlcResolution::Settled(preimage),
            Some(Invoice::Canceled { reason }) => HtlcResolution::Failed(reason),
            None => HtlcResolution::Pending,
        };

        if let Some(circuit) = circuit {
            tracing::trace!("resolved htlc of circuit {} to {:?}", circuit, resolution);
        }

        Ok(resolution)
    }
}
