use crate::command::Wiring;
use court::{PaymentHash, Preimage};

/// Records `preimage` as settling its invoice. Arbitrators asking the
/// database for it pick it up with the next block.
pub async fn preimage(wiring: &Wiring, preimage: Preimage) -> anyhow::Result<PaymentHash> {
    let payment_hash = preimage.hash();

    if !wiring.database.settle_invoice(preimage).await? {
        anyhow::bail!("invoice {} was canceled already", payment_hash)
    }

    Ok(payment_hash)
}
