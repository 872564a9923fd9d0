//! Classification of transactions spending a channel's funding output.

use crate::{channel::ChannelSnapshot, Error};
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

const COMMITMENT_SEQUENCE_MARKER: u32 = 0x80;
const COMMITMENT_LOCK_TIME_MARKER: u32 = 0x20;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseType {
    CooperativeClose,
    LocalForceClose,
    RemoteForceClose,
    Breach,
}

impl CloseType {
    /// Order in which competing closes of the same channel are acted upon.
    /// A revoked state on chain always calls for retribution.
    pub fn precedence(self) -> u8 {
        match self {
            CloseType::Breach => 3,
            CloseType::LocalForceClose => 2,
            CloseType::RemoteForceClose => 1,
            CloseType::CooperativeClose => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub close_type: CloseType,
    pub txid: Txid,
    /// Commitment number of the closing transaction, none for cooperative
    /// closes.
    pub commitment_height: Option<u64>,
}

pub fn classify(
    snapshot: &ChannelSnapshot,
    transaction: &Transaction,
    commitment_height_hint: Option<u64>,
) -> Result<Classification, Error> {
    let txid = transaction.txid();

    if !transaction
        .input
        .iter()
        .any(|input| input.previous_output == snapshot.funding_outpoint)
    {
        return Err(Error::NotAChannelClose(txid));
    }

    let classification = |close_type, height| Classification {
        close_type,
        txid,
        commitment_height: Some(height),
    };

    if txid == snapshot.local_commitment.txid {
        return Ok(classification(
            CloseType::LocalForceClose,
            snapshot.local_commitment.height,
        ));
    }
    if let Some(commitment) = snapshot.remote_commitment_with_txid(txid) {
        return Ok(classification(
            CloseType::RemoteForceClose,
            commitment.height,
        ));
    }
    if let Some(revoked) = snapshot
        .revocation_log
        .iter()
        .find(|revoked| revoked.commitment.txid == txid)
    {
        return Ok(classification(
            CloseType::Breach,
            revoked.commitment.height,
        ));
    }

    let height = match commitment_height_hint
        .or_else(|| decode_commitment_height(transaction, snapshot.obscuring_factor))
    {
        Some(height) => height,
        None => {
            return Ok(Classification {
                close_type: CloseType::CooperativeClose,
                txid,
                commitment_height: None,
            })
        }
    };

    if height < snapshot.remote_commitment.height {
        return Ok(classification(CloseType::Breach, height));
    }

    Err(Error::UnknownCommitment { txid, height })
}

/// Recovers the commitment number from the locktime and sequence of a
/// commitment transaction, none if the transaction does not carry the
/// commitment markers.
pub fn decode_commitment_height(transaction: &Transaction, obscuring_factor: u64) -> Option<u64> {
    let input = transaction.input.first()?;

    if input.sequence >> 24 != COMMITMENT_SEQUENCE_MARKER
        || transaction.lock_time >> 24 != COMMITMENT_LOCK_TIME_MARKER
    {
        return None;
    }

    let obscured = u64::from(input.sequence & 0x00ff_ffff) << 24
        | u64::from(transaction.lock_time & 0x00ff_ffff);

    Some(obscured ^ (obscuring_factor & 0xffff_ffff_ffff))
}

/// Locktime and sequence of the commitment transaction with the given
/// commitment number.
pub fn obscure(height: u64, obscuring_factor: u64) -> (u32, u32) {
    let obscured = (height ^ obscuring_factor) & 0xffff_ffff_ffff;

    #[allow(clippy::cast_possible_truncation)]
    let lock_time = COMMITMENT_LOCK_TIME_MARKER << 24 | (obscured & 0x00ff_ffff) as u32;
    #[allow(clippy::cast_possible_truncation)]
    let sequence = COMMITMENT_SEQUENCE_MARKER << 24 | (obscured >> 24) as u32;

    (lock_time, sequence)
}
