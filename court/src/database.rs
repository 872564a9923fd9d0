//! sled backed [`ResolutionStore`] and the registries the court consults.
//!
//! The state of an arbitrator is stored as one header record plus one
//! record per resolver, all keyed by the channel id, so that a single
//! channel can be loaded without touching the others.

use crate::{
    arbitrator::{
        ArbitrationReport, ArbitratorState, CloseCandidate, CloseSummary, PendingNotification,
        Phase,
    },
    channel::{ChannelId, ChannelSnapshot, CircuitKey},
    resolver::Resolver,
    store::ResolutionStore,
    Error,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bitcoin::{OutPoint, Script};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

mod circuits;
mod invoices;

pub use self::{circuits::ResolvedCircuit, invoices::Invoice};

const HEADER_TAG: u8 = 0x00;
const RESOLVER_TAG: u8 = 0x01;

#[derive(Debug)]
pub struct Database {
    db: sled::Db,
    /// Arbitrations in progress.
    active: sled::Tree,
    /// Finished arbitrations, kept for operators.
    archive: sled::Tree,
    invoices: sled::Tree,
    circuits: sled::Tree,
    #[cfg(test)]
    tmp_dir: Option<tempfile::TempDir>,
}

impl Database {
    pub fn new(path: &std::path::Path) -> anyhow::Result<Self> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("The path is not utf-8 valid: {:?}", path))?;
        let db = sled::open(path).with_context(|| format!("Could not open the DB at {}", path))?;

        Self::from_db(db)
    }

    #[cfg(test)]
    pub fn new_test() -> anyhow::Result<Self> {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(tmp_dir.path())
            .with_context(|| format!("Could not open the DB at {}", tmp_dir.path().display()))?;

        let mut database = Self::from_db(db)?;
        database.tmp_dir = Some(tmp_dir);

        Ok(database)
    }

    fn from_db(db: sled::Db) -> anyhow::Result<Self> {
        Ok(Database {
            active: db.open_tree("active")?,
            archive: db.open_tree("archive")?,
            invoices: db.open_tree("invoices")?,
            circuits: db.open_tree("circuits")?,
            db,
            #[cfg(test)]
            tmp_dir: None,
        })
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .context("Could not flush db")
    }
}

/// Arbitration related functions
impl Database {
    pub fn load_state(&self, channel_id: &ChannelId) -> anyhow::Result<Option<ArbitratorState>> {
        let header = match self.active.get(header_key(channel_id))? {
            Some(header) => header,
            None => return Ok(None),
        };
        let header = deserialize::<Header>(&header).map_err(|e| corrupted(channel_id, e))?;

        let resolvers = self
            .active
            .scan_prefix(resolver_prefix(channel_id))
            .map(|item| {
                let (_, value) = item.context("Could not retrieve data")?;

                deserialize::<Resolver>(&value).map_err(|e| corrupted(channel_id, e))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Some(header.into_state(resolvers)))
    }

    pub async fn save_state(&self, state: &ArbitratorState) -> anyhow::Result<()> {
        let channel_id = &state.channel_id;
        let live = state
            .resolvers
            .iter()
            .map(|resolver| resolver_key(channel_id, resolver.id()))
            .collect::<BTreeSet<_>>();

        let mut batch = sled::Batch::default();

        for item in self.active.scan_prefix(resolver_prefix(channel_id)).keys() {
            let key = item.context("Could not retrieve data")?;
            if !live.contains(&key[..]) {
                batch.remove(key);
            }
        }

        batch.insert(header_key(channel_id), serialize(&Header::from(state))?);
        for resolver in state.resolvers.iter() {
            batch.insert(resolver_key(channel_id, resolver.id()), serialize(resolver)?);
        }

        self.active
            .apply_batch(batch)
            .with_context(|| format!("Could not checkpoint channel {}", channel_id))?;

        self.flush().await
    }

    /// Moves a finished arbitration from the active records into the
    /// archive.
    pub async fn archive_state(&self, channel_id: &ChannelId) -> anyhow::Result<()> {
        if let Some(state) = self.load_state(channel_id)? {
            let archived = Archived {
                report: ArbitrationReport::from(&state),
                archived_at: Utc::now(),
            };
            self.archive
                .insert(&channel_id.as_bytes()[..], serialize(&archived)?)
                .with_context(|| format!("Could not archive channel {}", channel_id))?;
        }

        let mut batch = sled::Batch::default();
        for item in self.active.scan_prefix(channel_id.as_bytes()).keys() {
            batch.remove(item.context("Could not retrieve data")?);
        }
        self.active
            .apply_batch(batch)
            .with_context(|| format!("Could not delete channel {}", channel_id))?;

        self.flush().await
    }

    pub fn active_channel_ids(&self) -> anyhow::Result<Vec<ChannelId>> {
        self.active
            .iter()
            .keys()
            .filter_map(|item| match item {
                Ok(key) if key.len() == 33 && key[32] == HEADER_TAG => {
                    let mut bytes = [0u8; 32];
                    bytes.copy_from_slice(&key[..32]);

                    Some(Ok(ChannelId::from(bytes)))
                }
                Ok(_) => None,
                Err(err) => Some(Err(err).context("Could not retrieve data")),
            })
            .collect()
    }

    pub fn archived(&self, channel_id: &ChannelId) -> anyhow::Result<Option<Archived>> {
        self.archive
            .get(channel_id.as_bytes())?
            .map(|bytes| deserialize(&bytes).context("Could not deserialize archived arbitration"))
            .transpose()
    }

    pub fn all_archived(&self) -> anyhow::Result<Vec<Archived>> {
        self.archive
            .iter()
            .values()
            .map(|item| {
                let bytes = item.context("Could not retrieve data")?;

                deserialize(&bytes).context("Could not deserialize archived arbitration")
            })
            .collect()
    }
}

#[async_trait]
impl ResolutionStore for Database {
    async fn checkpoint(&self, state: &ArbitratorState) -> anyhow::Result<()> {
        self.save_state(state).await
    }

    async fn load(&self, channel_id: &ChannelId) -> anyhow::Result<Option<ArbitratorState>> {
        self.load_state(channel_id)
    }

    async fn delete(&self, channel_id: &ChannelId) -> anyhow::Result<()> {
        self.archive_state(channel_id).await
    }

    async fn active_channels(&self) -> anyhow::Result<Vec<ChannelId>> {
        self.active_channel_ids()
    }
}

/// A finished arbitration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Archived {
    pub report: ArbitrationReport,
    pub archived_at: DateTime<Utc>,
}

fn corrupted(channel_id: &ChannelId, error: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(Error::CorruptedCheckpoint {
        channel_id: *channel_id,
        reason: format!("{:#}", error),
    })
}

fn header_key(channel_id: &ChannelId) -> Vec<u8> {
    let mut key = channel_id.as_bytes().to_vec();
    key.push(HEADER_TAG);

    key
}

fn resolver_prefix(channel_id: &ChannelId) -> Vec<u8> {
    let mut key = channel_id.as_bytes().to_vec();
    key.push(RESOLVER_TAG);

    key
}

/// Keys of resolvers sort like their outpoints, which is the order the
/// arbitrator keeps them in.
fn resolver_key(channel_id: &ChannelId, outpoint: OutPoint) -> Vec<u8> {
    let mut key = resolver_prefix(channel_id);
    key.extend_from_slice(&outpoint.txid[..]);
    key.extend_from_slice(&outpoint.vout.to_be_bytes());

    key
}

fn circuit_key(circuit: &CircuitKey) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&u64::from(circuit.channel).to_be_bytes());
    key[8..].copy_from_slice(&circuit.htlc_id.to_be_bytes());

    key
}

pub fn serialize<T>(t: &T) -> anyhow::Result<Vec<u8>>
where
    T: Serialize,
{
    Ok(serde_cbor::to_vec(t)?)
}

pub fn deserialize<'a, T>(v: &'a [u8]) -> anyhow::Result<T>
where
    T: Deserialize<'a>,
{
    Ok(serde_cbor::from_slice(v)?)
}

/// Everything of an [`ArbitratorState`] but its resolvers.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Header {
    channel_id: ChannelId,
    phase: Phase,
    snapshot: ChannelSnapshot,
    sweep_script: Script,
    best_height: u32,
    candidates: Vec<CloseCandidate>,
    close: Option<CloseSummary>,
    pending_notifications: Vec<PendingNotification>,
    notified_circuits: BTreeSet<CircuitKey>,
    fatal: Option<String>,
    checkpoint_seq: u64,
}

impl From<&ArbitratorState> for Header {
    fn from(state: &ArbitratorState) -> Self {
        Header {
            channel_id: state.channel_id,
            phase: state.phase,
            snapshot: state.snapshot.clone(),
            sweep_script: state.sweep_script.clone(),
            best_height: state.best_height,
            candidates: state.candidates.clone(),
            close: state.close,
            pending_notifications: state.pending_notifications.clone(),
            notified_circuits: state.notified_circuits.clone(),
            fatal: state.fatal.clone(),
            checkpoint_seq: state.checkpoint_seq,
        }
    }
}

impl Header {
    fn into_state(self, resolvers: Vec<Resolver>) -> ArbitratorState {
        ArbitratorState {
            channel_id: self.channel_id,
            phase: self.phase,
            snapshot: self.snapshot,
            sweep_script: self.sweep_script,
            best_height: self.best_height,
            candidates: self.candidates,
            close: self.close,
            resolvers,
            pending_notifications: self.pending_notifications,
            notified_circuits: self.notified_circuits,
            fatal: self.fatal,
            checkpoint_seq: self.checkpoint_seq,
        }
    }
}
