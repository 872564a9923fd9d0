//! What the channel-state layer tells the court about a channel.
//!
//! Output kinds are always expressed from the point of view of the party that
//! broadcasts the commitment, as in BOLT3: an `OfferedHtlc` on the remote
//! commitment is an HTLC the remote party offered to us.

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::{PublicKey, SecretKey},
    OutPoint, Script, Txid,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

macro_rules! hex_bytes32 {
    ($name:ident, $expecting:expr) => {
        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(&self.0))
            }
        }

        impl FromStr for $name {
            type Err = FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let vec = hex::decode(s)?;
                if vec.len() != 32 {
                    return Err(FromHexError::InvalidLength(vec.len()));
                }
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&vec);

                Ok($name(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                struct Visitor;

                impl<'de> de::Visitor<'de> for Visitor {
                    type Value = $name;

                    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                    where
                        E: de::Error,
                    {
                        $name::from_str(v).map_err(|_| {
                            de::Error::invalid_value(de::Unexpected::Str(v), &$expecting)
                        })
                    }
                }

                deserializer.deserialize_str(Visitor)
            }
        }
    };
}

#[derive(Debug, thiserror::Error)]
pub enum FromHexError {
    #[error("invalid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Identifies a channel by the 32 bytes derived from its funding outpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId([u8; 32]);

hex_bytes32!(ChannelId, "a hex encoded 32 byte channel id");

impl ChannelId {
    /// BOLT2 channel id: the funding txid xor-ed with the funding output
    /// index in its last two bytes.
    pub fn from_funding_outpoint(outpoint: OutPoint) -> Self {
        let mut bytes = outpoint.txid.into_inner();
        #[allow(clippy::cast_possible_truncation)]
        let index = (outpoint.vout & 0xffff) as u16;
        let index = index.to_be_bytes();
        bytes[30] ^= index[0];
        bytes[31] ^= index[1];

        ChannelId(bytes)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Preimage([u8; 32]);

hex_bytes32!(Preimage, "a hex encoded 32 byte preimage");

impl Preimage {
    pub fn hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).into_inner())
    }

    /// Interprets a witness stack element as a preimage.
    pub fn from_witness_element(element: &[u8]) -> Option<Self> {
        if element.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(element);

        Some(Preimage(bytes))
    }

    pub fn matches(&self, payment_hash: &PaymentHash) -> bool {
        self.hash() == *payment_hash
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage({})", self.hash())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentHash([u8; 32]);

hex_bytes32!(PaymentHash, "a hex encoded 32 byte payment hash");

/// BOLT7 short channel id: funding block height, transaction index and
/// output index packed into 64 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShortChannelId(u64);

impl ShortChannelId {
    pub fn new(block_height: u32, tx_index: u32, output_index: u16) -> Self {
        let block_height = u64::from(block_height & 0x00ff_ffff);
        let tx_index = u64::from(tx_index & 0x00ff_ffff);

        ShortChannelId(block_height << 40 | tx_index << 16 | u64::from(output_index))
    }

    pub fn block_height(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let height = (self.0 >> 40) as u32;
        height
    }

    pub fn tx_index(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let index = ((self.0 >> 16) & 0x00ff_ffff) as u32;
        index
    }

    pub fn output_index(&self) -> u16 {
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.0 & 0xffff) as u16;
        index
    }
}

impl From<u64> for ShortChannelId {
    fn from(raw: u64) -> Self {
        ShortChannelId(raw)
    }
}

impl From<ShortChannelId> for u64 {
    fn from(scid: ShortChannelId) -> Self {
        scid.0
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

impl FromStr for ShortChannelId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('x').collect::<Vec<_>>();
        match parts.as_slice() {
            [block, tx, output] => Ok(ShortChannelId::new(
                block.parse()?,
                tx.parse()?,
                output.parse()?,
            )),
            _ => anyhow::bail!("expected short channel id of the form BLOCKxTXxOUTPUT"),
        }
    }
}

/// Position of an HTLC on its incoming channel.
///
/// The forwarding layer uses it to settle or fail the upstream leg of an HTLC
/// once its on-chain fate is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CircuitKey {
    pub channel: ShortChannelId,
    pub htlc_id: u64,
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.htlc_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Htlc {
    pub htlc_id: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
    /// Upstream leg to notify once this HTLC is resolved, absent for
    /// payments we originated.
    pub circuit_key: Option<CircuitKey>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputKind {
    ToLocal { csv_delay: u16 },
    ToRemote,
    OfferedHtlc(Htlc),
    ReceivedHtlc(Htlc),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitmentOutput {
    pub vout: u32,
    pub value: u64,
    pub kind: OutputKind,
    /// Script code signed over when spending this output: the witness script
    /// for P2WSH outputs, the P2PKH script of the key for `ToRemote`.
    pub witness_script: Script,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub height: u64,
    pub txid: Txid,
    pub per_commitment_point: PublicKey,
    pub outputs: Vec<CommitmentOutput>,
}

impl Commitment {
    pub fn outpoint(&self, output: &CommitmentOutput) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: output.vout,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevokedCommitment {
    pub commitment: Commitment,
    pub per_commitment_secret: Option<SecretKey>,
}

/// Latest known state of an open channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel_id: ChannelId,
    pub short_channel_id: ShortChannelId,
    pub funding_outpoint: OutPoint,
    /// 48 bit factor the commitment number is xor-ed with before being
    /// encoded into the commitment transaction's locktime and sequence.
    pub obscuring_factor: u64,
    pub local_commitment: Commitment,
    pub remote_commitment: Commitment,
    pub remote_pending_commitment: Option<Commitment>,
    #[serde(default)]
    pub revocation_log: Vec<RevokedCommitment>,
}

impl ChannelSnapshot {
    pub fn revoked_at(&self, height: u64) -> Option<&RevokedCommitment> {
        self.revocation_log
            .iter()
            .find(|revoked| revoked.commitment.height == height)
    }

    pub fn remote_commitment_with_txid(&self, txid: Txid) -> Option<&Commitment> {
        std::iter::once(&self.remote_commitment)
            .chain(self.remote_pending_commitment.as_ref())
            .find(|commitment| commitment.txid == txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;

    #[test]
    fn short_channel_id_displays_as_block_tx_output() {
        let scid = ShortChannelId::new(539_268, 845, 1);

        assert_eq!(scid.to_string(), "539268x845x1");
        assert_that(&ShortChannelId::from_str("539268x845x1"))
            .is_ok()
            .is_equal_to(scid);
    }

    #[test]
    fn malformed_short_channel_id_is_rejected() {
        assert_that(&ShortChannelId::from_str("539268x845")).is_err();
        assert_that(&ShortChannelId::from_str("axbxc")).is_err();
    }

    #[test]
    fn preimage_matches_its_hash_only() {
        let preimage = Preimage::from([7u8; 32]);
        let other = Preimage::from([8u8; 32]);

        assert!(preimage.matches(&preimage.hash()));
        assert!(!other.matches(&preimage.hash()));
    }

    #[test]
    fn preimage_is_extracted_from_32_byte_elements_only() {
        assert_that(&Preimage::from_witness_element(&[1u8; 32])).is_some();
        assert_that(&Preimage::from_witness_element(&[1u8; 33])).is_none();
        assert_that(&Preimage::from_witness_element(&[])).is_none();
    }

    #[test]
    fn channel_id_serializes_as_hex() {
        let channel_id = ChannelId::from([0xab; 32]);

        let json = serde_json::to_string(&channel_id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));

        let deserialized = serde_json::from_str::<ChannelId>(&json).unwrap();
        assert_eq!(deserialized, channel_id);
    }

    #[test]
    fn channel_id_xors_output_index_into_funding_txid() {
        let txid = Txid::from_inner([0u8; 32]);

        let channel_id = ChannelId::from_funding_outpoint(OutPoint { txid, vout: 0x0102 });

        assert_eq!(channel_id.as_bytes()[30], 0x01);
        assert_eq!(channel_id.as_bytes()[31], 0x02);
    }
}
