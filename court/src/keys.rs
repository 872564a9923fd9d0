//! BOLT3 key derivation and signing of claim inputs.

use crate::{
    claim::{Claim, ClaimInput},
    witness::WitnessTemplate,
    Error, SECP,
};
use bitcoin::{
    hashes::{sha256, Hash, HashEngine},
    secp256k1::{Message, PublicKey, SecretKey},
    util::bip143::SigHashCache,
    SigHashType,
};
use std::fmt;

/// Signs the inputs of claim transactions.
pub trait Signer: Send + Sync + 'static {
    fn sign(&self, claim: &mut Claim) -> Result<(), Error>;
}

/// Our base secrets of a channel, from which the keys of every commitment
/// are derived.
#[derive(Clone, Copy)]
pub struct BaseSecrets {
    pub payment: SecretKey,
    pub delayed_payment: SecretKey,
    pub htlc: SecretKey,
    pub revocation: SecretKey,
}

impl fmt::Debug for BaseSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BaseSecrets([*****])")
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Basepoints {
    pub payment: PublicKey,
    pub delayed_payment: PublicKey,
    pub htlc: PublicKey,
    pub revocation: PublicKey,
}

#[derive(Clone, Copy, Debug)]
pub struct LocalSigner {
    secrets: BaseSecrets,
}

impl LocalSigner {
    pub fn new(secrets: BaseSecrets) -> Self {
        Self { secrets }
    }

    pub fn basepoints(&self) -> Basepoints {
        Basepoints {
            payment: PublicKey::from_secret_key(&SECP, &self.secrets.payment),
            delayed_payment: PublicKey::from_secret_key(&SECP, &self.secrets.delayed_payment),
            htlc: PublicKey::from_secret_key(&SECP, &self.secrets.htlc),
            revocation: PublicKey::from_secret_key(&SECP, &self.secrets.revocation),
        }
    }

    fn signing_key(&self, input: &ClaimInput) -> Result<SecretKey, Error> {
        let point = &input.per_commitment_point;

        match &input.template {
            WitnessTemplate::DelayedSweep { .. } => {
                derive_private_key(&self.secrets.delayed_payment, point)
            }
            WitnessTemplate::RemoteSweep => Ok(self.secrets.payment),
            WitnessTemplate::HtlcSuccess { .. } | WitnessTemplate::HtlcTimeout { .. } => {
                derive_private_key(&self.secrets.htlc, point)
            }
            WitnessTemplate::Revoked {
                per_commitment_secret,
                ..
            } => derive_revocation_private_key(&self.secrets.revocation, per_commitment_secret),
        }
    }
}

impl Signer for LocalSigner {
    fn sign(&self, claim: &mut Claim) -> Result<(), Error> {
        let witnesses = {
            let mut cache = SigHashCache::new(&claim.transaction);

            claim
                .inputs
                .iter()
                .enumerate()
                .map(|(index, input)| {
                    let key = self.signing_key(input)?;
                    let sighash = cache.signature_hash(
                        index,
                        &input.witness_script,
                        input.value,
                        SigHashType::All,
                    );
                    let message = Message::from_slice(&sighash[..])?;
                    let mut signature = SECP.sign(&message, &key).serialize_der().to_vec();
                    signature.push(SigHashType::All as u8);

                    Ok(witness(signature, &key, input))
                })
                .collect::<Result<Vec<_>, Error>>()?
        };

        for (txin, witness) in claim.transaction.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }

        Ok(())
    }
}

fn witness(signature: Vec<u8>, key: &SecretKey, input: &ClaimInput) -> Vec<Vec<u8>> {
    let script = input.witness_script.to_bytes();

    match &input.template {
        WitnessTemplate::DelayedSweep { .. } | WitnessTemplate::HtlcTimeout { .. } => {
            vec![signature, vec![], script]
        }
        WitnessTemplate::RemoteSweep => vec![
            signature,
            PublicKey::from_secret_key(&SECP, key).serialize().to_vec(),
        ],
        WitnessTemplate::HtlcSuccess { preimage } => {
            vec![signature, preimage.as_bytes().to_vec(), script]
        }
        WitnessTemplate::Revoked { htlc: false, .. } => vec![signature, vec![1], script],
        WitnessTemplate::Revoked { htlc: true, .. } => vec![
            signature,
            PublicKey::from_secret_key(&SECP, key).serialize().to_vec(),
            script,
        ],
    }
}

fn sha256_of(first: &PublicKey, second: &PublicKey) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&first.serialize());
    engine.input(&second.serialize());

    sha256::Hash::from_engine(engine).into_inner()
}

/// `basepoint_secret + SHA256(per_commitment_point || basepoint)`
pub fn derive_private_key(
    basepoint_secret: &SecretKey,
    per_commitment_point: &PublicKey,
) -> Result<SecretKey, Error> {
    let basepoint = PublicKey::from_secret_key(&SECP, basepoint_secret);
    let tweak = sha256_of(per_commitment_point, &basepoint);

    let mut key = *basepoint_secret;
    key.add_assign(&tweak)?;

    Ok(key)
}

/// `basepoint + SHA256(per_commitment_point || basepoint) * G`
pub fn derive_public_key(
    basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> Result<PublicKey, Error> {
    let tweak = sha256_of(per_commitment_point, basepoint);

    let mut key = *basepoint;
    key.add_exp_assign(&SECP, &tweak)?;

    Ok(key)
}

/// `revocation_basepoint_secret * SHA256(revocation_basepoint ||
/// per_commitment_point) + per_commitment_secret *
/// SHA256(per_commitment_point || revocation_basepoint)`
pub fn derive_revocation_private_key(
    revocation_basepoint_secret: &SecretKey,
    per_commitment_secret: &SecretKey,
) -> Result<SecretKey, Error> {
    let revocation_basepoint = PublicKey::from_secret_key(&SECP, revocation_basepoint_secret);
    let per_commitment_point = PublicKey::from_secret_key(&SECP, per_commitment_secret);

    let mut revocation_part = *revocation_basepoint_secret;
    revocation_part.mul_assign(&sha256_of(&revocation_basepoint, &per_commitment_point))?;

    let mut commitment_part = *per_commitment_secret;
    commitment_part.mul_assign(&sha256_of(&per_commitment_point, &revocation_basepoint))?;

    revocation_part.add_assign(&commitment_part[..])?;

    Ok(revocation_part)
}

pub fn derive_revocation_public_key(
    revocation_basepoint: &PublicKey,
    per_commitment_point: &PublicKey,
) -> Result<PublicKey, Error> {
    let mut revocation_part = *revocation_basepoint;
    revocation_part.mul_assign(&SECP, &sha256_of(revocation_basepoint, per_commitment_point))?;

    let mut commitment_part = *per_commitment_point;
    commitment_part.mul_assign(&SECP, &sha256_of(per_commitment_point, revocation_basepoint))?;

    Ok(revocation_part.combine(&commitment_part)?)
}

/// Checks that a secret handed over on revocation belongs to the commitment
/// it revoked.
pub fn verify_per_commitment_secret(
    secret: &SecretKey,
    point: &PublicKey,
    height: u64,
) -> Result<(), Error> {
    if PublicKey::from_secret_key(&SECP, secret) != *point {
        return Err(Error::RevocationSecretMismatch { height });
    }

    Ok(())
}
