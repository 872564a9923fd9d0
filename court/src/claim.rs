//! Deterministic construction of claim transactions.
//!
//! A claim is rebuilt from its request every time it is (re)broadcast. The
//! same request always yields the same transaction, which is what makes
//! broadcasting after a restart safe.

use crate::{
    config::FeePolicy,
    witness::{dust_limit, WitnessTemplate},
    Error,
};
use bitcoin::{
    consensus::encode::serialize, secp256k1::PublicKey, OutPoint, Script, Transaction, TxIn,
    TxOut,
};
use serde::{Deserialize, Serialize};

/// A contested output together with everything needed to spend it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClaimInput {
    pub outpoint: OutPoint,
    pub value: u64,
    pub witness_script: Script,
    pub per_commitment_point: PublicKey,
    pub template: WitnessTemplate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClaimRequest {
    /// Identity of the resolver asking for the claim.
    pub resolver: OutPoint,
    pub inputs: Vec<ClaimInput>,
    pub fee_step: u32,
}

/// An unsigned claim transaction and the inputs it spends, in input order.
#[derive(Clone, Debug, PartialEq)]
pub struct Claim {
    pub transaction: Transaction,
    pub inputs: Vec<ClaimInput>,
}

pub fn build(
    request: &ClaimRequest,
    sweep_script: &Script,
    fees: &FeePolicy,
) -> Result<Claim, Error> {
    let mut inputs = request.inputs.clone();
    inputs.sort_by_key(|input| (input.outpoint.txid, input.outpoint.vout));

    let lock_time = inputs
        .iter()
        .filter_map(|input| input.template.lock_time())
        .max()
        .unwrap_or(0);

    let mut transaction = Transaction {
        version: 2,
        lock_time,
        input: inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.outpoint,
                script_sig: Script::new(),
                sequence: input.template.sequence(),
                witness: Vec::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: 0,
            script_pubkey: sweep_script.clone(),
        }],
    };

    let weight = expected_weight(&transaction, &inputs);
    let vbytes = (weight as u64 + 3) / 4;
    let fee = fees.rate(request.fee_step).saturating_mul(vbytes);
    let total = inputs.iter().map(|input| input.value).sum::<u64>();

    let value = total
        .checked_sub(fee)
        .filter(|value| *value >= dust_limit(sweep_script))
        .ok_or(Error::Uneconomical { total, fee })?;
    transaction.output[0].value = value;

    Ok(Claim {
        transaction,
        inputs,
    })
}

/// Weight of `transaction` once every input carries its witness.
fn expected_weight(transaction: &Transaction, inputs: &[ClaimInput]) -> usize {
    const SEGWIT_MARKER_AND_FLAG: usize = 2;

    let witnesses = inputs
        .iter()
        .map(|input| input.template.witness_weight(&input.witness_script))
        .sum::<usize>();

    serialize(transaction).len() * 4 + SEGWIT_MARKER_AND_FLAG + witnesses
}

/// Whether `transaction` pays to `script`, which marks our own claims even
/// after they have been replaced by fee bumps.
pub fn pays_to(transaction: &Transaction, script: &Script) -> bool {
    transaction
        .output
        .iter()
        .any(|output| output.script_pubkey == *script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{witness, SECP};
    use bitcoin::{hashes::Hash, secp256k1::SecretKey, Txid};
    use spectral::prelude::*;

    fn point() -> PublicKey {
        PublicKey::from_secret_key(&SECP, &SecretKey::from_slice(&[9u8; 32]).unwrap())
    }

    fn sweep_script() -> Script {
        witness::p2wpkh(&point())
    }

    fn input(txid_byte: u8, vout: u32, value: u64, template: WitnessTemplate) -> ClaimInput {
        ClaimInput {
            outpoint: OutPoint {
                txid: Txid::from_inner([txid_byte; 32]),
                vout,
            },
            value,
            witness_script: Script::from(vec![0x51; 100]),
            per_commitment_point: point(),
            template,
        }
    }

    fn fees() -> FeePolicy {
        FeePolicy {
            sat_per_vbyte: 10,
            max_sat_per_vbyte: 100,
            escalation_percent: 25,
            bump_interval: 6,
        }
    }

    #[test]
    fn identical_requests_build_identical_transactions() {
        let request = ClaimRequest {
            resolver: OutPoint::null(),
            inputs: vec![
                input(2, 1, 50_000, WitnessTemplate::HtlcTimeout { cltv_expiry: 700 }),
                input(1, 0, 80_000, WitnessTemplate::DelayedSweep { csv_delay: 144 }),
            ],
            fee_step: 0,
        };
        let mut reversed = request.clone();
        reversed.inputs.reverse();

        let claim = build(&request, &sweep_script(), &fees()).unwrap();
        let other = build(&reversed, &sweep_script(), &fees()).unwrap();

        assert_eq!(claim.transaction.txid(), other.transaction.txid());
        assert_eq!(claim.transaction.input[0].sequence, 144);
        assert_eq!(claim.transaction.input[1].sequence, witness::RBF_SEQUENCE);
        assert_eq!(claim.transaction.lock_time, 700);
    }

    #[test]
    fn fee_bump_lowers_the_claimed_value() {
        let inputs = vec![input(1, 0, 80_000, WitnessTemplate::RemoteSweep)];
        let first = ClaimRequest {
            resolver: OutPoint::null(),
            inputs: inputs.clone(),
            fee_step: 0,
        };
        let bumped = ClaimRequest {
            fee_step: 1,
            ..first.clone()
        };

        let first = build(&first, &sweep_script(), &fees()).unwrap();
        let bumped = build(&bumped, &sweep_script(), &fees()).unwrap();

        assert!(bumped.transaction.output[0].value < first.transaction.output[0].value);
        assert_ne!(first.transaction.txid(), bumped.transaction.txid());
    }

    #[test]
    fn claim_below_dust_is_uneconomical() {
        let request = ClaimRequest {
            resolver: OutPoint::null(),
            inputs: vec![input(1, 0, 1_300, WitnessTemplate::RemoteSweep)],
            fee_step: 0,
        };

        let result = build(&request, &sweep_script(), &fees());

        assert_that(&result).is_err();
        assert!(matches!(result, Err(Error::Uneconomical { total: 1_300, .. })));
    }

    #[test]
    fn recognises_transactions_paying_to_the_sweep_script() {
        let request = ClaimRequest {
            resolver: OutPoint::null(),
            inputs: vec![input(1, 0, 80_000, WitnessTemplate::RemoteSweep)],
            fee_step: 0,
        };
        let claim = build(&request, &sweep_script(), &fees()).unwrap();

        assert!(pays_to(&claim.transaction, &sweep_script()));
        assert!(!pays_to(&claim.transaction, &Script::new()));
    }
}
