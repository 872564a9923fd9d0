use crate::channel::ChannelId;
use bitcoin::Txid;

/// Failures the court distinguishes.
///
/// Errors for which [`Error::is_fatal`] returns `true` halt the arbitration
/// of the affected channel: funds are at risk and an operator has to step in.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transaction {0} does not spend the funding output of the channel")]
    NotAChannelClose(Txid),
    #[error("transaction {txid} is commitment {height} which is unknown to us, our channel state is behind")]
    UnknownCommitment { txid: Txid, height: u64 },
    #[error("no revocation secret for revoked commitment {height}")]
    MissingRevocationSecret { height: u64 },
    #[error("revocation secret for commitment {height} does not match its per-commitment point")]
    RevocationSecretMismatch { height: u64 },
    #[error("key derivation failed")]
    KeyDerivation(#[from] bitcoin::secp256k1::Error),
    #[error("checkpoint of channel {channel_id} is corrupted: {reason}")]
    CorruptedCheckpoint { channel_id: ChannelId, reason: String },
    #[error("claiming {total} sat does not cover a fee of {fee} sat and the dust limit")]
    Uneconomical { total: u64, fee: u64 },
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::UnknownCommitment { .. }
            | Error::MissingRevocationSecret { .. }
            | Error::RevocationSecretMismatch { .. }
            | Error::KeyDerivation(_)
            | Error::CorruptedCheckpoint { .. } => true,
            Error::NotAChannelClose(_) | Error::Uneconomical { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_losing_track_of_funds_is_fatal() {
        assert!(Error::MissingRevocationSecret { height: 3 }.is_fatal());
        assert!(Error::RevocationSecretMismatch { height: 3 }.is_fatal());
        assert!(!Error::Uneconomical { total: 300, fee: 200 }.is_fatal());
        assert!(!Error::NotAChannelClose(Default::default()).is_fatal());
    }
}
