use crate::fs::ensure_directory_exists;
use anyhow::{anyhow, Context};
use bitcoin::{
    hashes::{sha256, Hash, HashEngine},
    secp256k1::{PublicKey, SecretKey},
};
use court::{keys::BaseSecrets, SECP};
use pem::{encode, Pem};
use rand::Rng;
use std::{
    fmt,
    fs::{self, File},
    io::Write,
    path::Path,
};

pub const SEED_LENGTH: usize = 32;

/// The secret every key of the daemon is derived from.
#[derive(Clone, Copy, PartialEq)]
pub struct Seed([u8; SEED_LENGTH]);

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed([*****])")
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Seed {
    pub fn new_random<R: Rng>(mut rand: R) -> Result<Seed, rand::Error> {
        let mut arr = [0u8; SEED_LENGTH];
        rand.try_fill(&mut arr[..])?;
        Ok(Seed(arr))
    }

    /// Reads the seed from `seed.pem` in `data_dir`, generating and writing a
    /// new one if there is none yet.
    pub fn from_file_or_generate<R: Rng>(data_dir: &Path, rand: R) -> anyhow::Result<Seed> {
        let path = data_dir.join("seed.pem");

        if path.exists() {
            return Self::from_file(&path);
        }

        let random_seed = Seed::new_random(rand)?;
        random_seed.write_to(&path)?;

        tracing::info!("No seed file found, created new one at {}", path.display());

        Ok(random_seed)
    }

    pub fn from_file(seed_file: &Path) -> anyhow::Result<Seed> {
        tracing::info!("Reading seed from {}", seed_file.display());

        let contents = fs::read_to_string(seed_file)
            .with_context(|| format!("failed to read seed file {}", seed_file.display()))?;
        let pem = pem::parse(contents).map_err(|e| anyhow!("seed file is not PEM: {:?}", e))?;

        Seed::from_pem(pem)
    }

    fn from_pem(pem: Pem) -> anyhow::Result<Seed> {
        if pem.contents.len() != SEED_LENGTH {
            anyhow::bail!(
                "expected {} bytes of seed, got {} bytes",
                SEED_LENGTH,
                pem.contents.len()
            )
        }

        let mut array = [0; SEED_LENGTH];
        array.copy_from_slice(&pem.contents);

        Ok(Seed(array))
    }

    fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        ensure_directory_exists(path)?;

        let pem = Pem {
            tag: String::from("SEED"),
            contents: self.0.to_vec(),
        };

        let mut file = File::create(path)?;
        file.write_all(encode(&pem).as_bytes())?;

        Ok(())
    }

    pub fn sha256_with_seed(&self, slices: &[&[u8]]) -> [u8; SEED_LENGTH] {
        let mut engine = sha256::Hash::engine();
        engine.input(&self.0);
        for slice in slices {
            engine.input(slice);
        }

        sha256::Hash::from_engine(engine).into_inner()
    }

    /// Base secrets of our side of every channel handed to the court.
    pub fn base_secrets(&self) -> anyhow::Result<BaseSecrets> {
        Ok(BaseSecrets {
            payment: self.secret_key(b"PAYMENT")?,
            delayed_payment: self.secret_key(b"DELAYED_PAYMENT")?,
            htlc: self.secret_key(b"HTLC")?,
            revocation: self.secret_key(b"REVOCATION")?,
        })
    }

    /// Key of the default destination of all claims.
    pub fn sweep_key(&self) -> anyhow::Result<PublicKey> {
        let secret = self.secret_key(b"SWEEP")?;

        Ok(PublicKey::from_secret_key(&SECP, &secret))
    }

    fn secret_key(&self, tag: &[u8]) -> anyhow::Result<SecretKey> {
        SecretKey::from_slice(&self.sha256_with_seed(&[tag]))
            .with_context(|| format!("seed derives no valid {} key", String::from_utf8_lossy(tag)))
    }
}

impl From<[u8; SEED_LENGTH]> for Seed {
    fn from(seed: [u8; SEED_LENGTH]) -> Self {
        Seed(seed)
    }
}
