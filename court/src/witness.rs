//! Spend paths of contested outputs and what spending them costs.

use crate::channel::Preimage;
use bitcoin::{
    blockdata::{
        opcodes::all::{OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160},
        script::Builder,
    },
    hashes::{hash160, Hash},
    secp256k1::{PublicKey, SecretKey},
    Script,
};
use serde::{Deserialize, Serialize};

/// Sequence of inputs that are not relatively timelocked. Signals
/// replaceability so that claims can be fee-bumped.
pub const RBF_SEQUENCE: u32 = 0xffff_fffd;

/// DER signature of maximum size plus the sighash flag, with its push.
const SIGNATURE: usize = 1 + 73;
const EMPTY: usize = 1;
const TRUE: usize = 1 + 1;
const PUBKEY: usize = 1 + 33;
const PREIMAGE: usize = 1 + 32;

/// How the witness of a claim input is built.
///
/// Together with the outpoint this identifies a claim independent of the
/// transaction that ends up carrying it, so a fee-bumped claim is still the
/// same claim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WitnessTemplate {
    /// Our own output on our commitment, behind a relative timelock.
    DelayedSweep { csv_delay: u16 },
    /// Our output on the remote commitment, P2WPKH to our payment key.
    RemoteSweep,
    /// An HTLC paying to us, claimed with its preimage.
    HtlcSuccess { preimage: Preimage },
    /// An HTLC we offered, claimed back after its absolute timeout.
    HtlcTimeout { cltv_expiry: u32 },
    /// Any output of a revoked commitment, claimed with the revocation key.
    Revoked {
        htlc: bool,
        per_commitment_secret: SecretKey,
    },
}

impl WitnessTemplate {
    pub fn sequence(&self) -> u32 {
        match self {
            WitnessTemplate::DelayedSweep { csv_delay } => u32::from(*csv_delay),
            _ => RBF_SEQUENCE,
        }
    }

    pub fn lock_time(&self) -> Option<u32> {
        match self {
            WitnessTemplate::HtlcTimeout { cltv_expiry } => Some(*cltv_expiry),
            _ => None,
        }
    }

    /// Upper bound of the weight of the witness spending an output locked
    /// with `witness_script`.
    pub fn witness_weight(&self, witness_script: &Script) -> usize {
        let script = var_int_len(witness_script.len()) + witness_script.len();

        1 + SIGNATURE
            + match self {
                WitnessTemplate::DelayedSweep { .. } => EMPTY + script,
                WitnessTemplate::RemoteSweep => PUBKEY,
                WitnessTemplate::HtlcSuccess { .. } => PREIMAGE + script,
                WitnessTemplate::HtlcTimeout { .. } => EMPTY + script,
                WitnessTemplate::Revoked { htlc: false, .. } => TRUE + script,
                WitnessTemplate::Revoked { htlc: true, .. } => PUBKEY + script,
            }
    }
}

fn var_int_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    }
}

/// P2WPKH output script paying to `key`.
pub fn p2wpkh(key: &PublicKey) -> Script {
    let hash = hash160::Hash::hash(&key.serialize());

    Builder::new().push_int(0).push_slice(&hash[..]).into_script()
}

/// Script code signed over when spending a P2WPKH output (BIP143).
pub fn p2wpkh_script_code(key: &PublicKey) -> Script {
    let hash = hash160::Hash::hash(&key.serialize());

    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(&hash[..])
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Smallest output value the network relays for the given output script.
pub fn dust_limit(script_pubkey: &Script) -> u64 {
    if script_pubkey.is_v0_p2wpkh() {
        294
    } else if script_pubkey.is_v0_p2wsh() {
        330
    } else if script_pubkey.is_p2sh() {
        540
    } else if is_witness_program(script_pubkey) {
        354
    } else {
        546
    }
}

/// BIP141: a version byte followed by a single push of 2 to 40 bytes.
fn is_witness_program(script: &Script) -> bool {
    let bytes = script.as_bytes();

    (4..=42).contains(&bytes.len())
        && (bytes[0] == 0x00 || (0x51..=0x60).contains(&bytes[0]))
        && usize::from(bytes[1]) + 2 == bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SECP;
    use bitcoin::blockdata::opcodes::all::OP_RETURN;

    fn script_of_len(len: usize) -> Script {
        Script::from(vec![0x51; len])
    }

    #[test]
    fn htlc_witness_weights_match_bolt3_expectations() {
        // offered HTLC script of 133 bytes, received HTLC script of 139 bytes
        let offered = script_of_len(133);
        let received = script_of_len(139);
        let preimage = Preimage::from([0u8; 32]);
        let secret = SecretKey::from_slice(&[1u8; 32]).unwrap();

        assert_eq!(
            WitnessTemplate::HtlcSuccess { preimage }.witness_weight(&offered),
            1 + 1 + 73 + 1 + 32 + 1 + 133
        );
        assert_eq!(
            WitnessTemplate::HtlcTimeout { cltv_expiry: 0 }.witness_weight(&received),
            1 + 1 + 73 + 1 + 1 + 139
        );
        assert_eq!(
            WitnessTemplate::Revoked {
                htlc: true,
                per_commitment_secret: secret
            }
            .witness_weight(&received),
            1 + 1 + 73 + 1 + 33 + 1 + 139
        );
    }

    #[test]
    fn revoked_to_local_witness_weight() {
        let to_local = script_of_len(77);
        let secret = SecretKey::from_slice(&[1u8; 32]).unwrap();

        assert_eq!(
            WitnessTemplate::Revoked {
                htlc: false,
                per_commitment_secret: secret
            }
            .witness_weight(&to_local),
            1 + 1 + 73 + 1 + 1 + 1 + 77
        );
    }

    #[test]
    fn only_delayed_sweeps_are_relatively_timelocked() {
        assert_eq!(
            WitnessTemplate::DelayedSweep { csv_delay: 144 }.sequence(),
            144
        );
        assert_eq!(WitnessTemplate::RemoteSweep.sequence(), RBF_SEQUENCE);
        assert_eq!(
            WitnessTemplate::HtlcTimeout { cltv_expiry: 500 }.lock_time(),
            Some(500)
        );
        assert_eq!(WitnessTemplate::RemoteSweep.lock_time(), None);
    }

    #[test]
    fn dust_limit_depends_on_script_type() {
        let key = PublicKey::from_secret_key(&SECP, &SecretKey::from_slice(&[3u8; 32]).unwrap());
        let p2wpkh = p2wpkh(&key);
        let p2wsh = script_of_len(10).to_v0_p2wsh();
        let p2pkh = p2wpkh_script_code(&key);
        let op_return = Builder::new().push_opcode(OP_RETURN).into_script();

        assert_eq!(dust_limit(&p2wpkh), 294);
        assert_eq!(dust_limit(&p2wsh), 330);
        assert_eq!(dust_limit(&p2pkh), 546);
        assert_eq!(dust_limit(&op_return), 546);
        assert_eq!(dust_limit(&Script::from(vec![0x51, 0x02, 0x4e, 0x73])), 354);
    }
}
