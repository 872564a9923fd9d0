#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::{
    hashes::Hash,
    secp256k1::{PublicKey, SecretKey},
    OutPoint, Script, Transaction, TxIn, TxOut, Txid,
};
use court::{
    arbitrator::{ArbitratorState, Services},
    chain::{BroadcastError, Broadcaster, ChainWatcher, OutpointUpdate},
    channel::{
        ChannelId, ChannelSnapshot, CircuitKey, Commitment, CommitmentOutput, Htlc, OutputKind,
        Preimage, RevokedCommitment, ShortChannelId,
    },
    close,
    keys::{BaseSecrets, LocalSigner},
    oracle::{CircuitNotifier, CircuitResolution},
    witness, Database, ResolutionStore, SECP,
};
use futures::stream::{BoxStream, StreamExt};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const OBSCURING_FACTOR: u64 = 0x2bb0_3852_1914;
pub const LOCAL_HEIGHT: u64 = 8;
pub const REVOKED_HEIGHT: u64 = 5;

/// Everything the court did to the outside world, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Checkpoint { seq: u64 },
    Broadcast(Transaction),
    Notify(CircuitKey, CircuitResolution),
}

pub type Log = Arc<Mutex<Vec<Op>>>;

pub struct RecordingStore {
    db: Arc<Database>,
    log: Log,
}

#[async_trait]
impl ResolutionStore for RecordingStore {
    async fn checkpoint(&self, state: &ArbitratorState) -> anyhow::Result<()> {
        self.db.checkpoint(state).await?;
        self.log.lock().unwrap().push(Op::Checkpoint {
            seq: state.checkpoint_seq,
        });

        Ok(())
    }

    async fn load(&self, channel_id: &ChannelId) -> anyhow::Result<Option<ArbitratorState>> {
        self.db.load(channel_id).await
    }

    async fn delete(&self, channel_id: &ChannelId) -> anyhow::Result<()> {
        self.db.delete(channel_id).await
    }

    async fn active_channels(&self) -> anyhow::Result<Vec<ChannelId>> {
        self.db.active_channels().await
    }
}

/// Records every transaction it is asked to broadcast, failing the first
/// `failures` of them as if the node was unreachable.
pub struct RecordingBroadcaster {
    log: Log,
    failures: Mutex<usize>,
}

impl RecordingBroadcaster {
    pub fn fail_next(&self, failures: usize) {
        *self.failures.lock().unwrap() = failures;
    }
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, BroadcastError> {
        self.log
            .lock()
            .unwrap()
            .push(Op::Broadcast(transaction.clone()));

        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(BroadcastError::Other(anyhow::anyhow!("connection refused")));
        }

        Ok(transaction.txid())
    }
}

pub struct RecordingNotifier {
    log: Log,
}

#[async_trait]
impl CircuitNotifier for RecordingNotifier {
    async fn notify_resolution(
        &self,
        circuit: CircuitKey,
        resolution: CircuitResolution,
    ) -> anyhow::Result<bool> {
        self.log
            .lock()
            .unwrap()
            .push(Op::Notify(circuit, resolution));

        Ok(true)
    }
}

pub struct World {
    pub log: Log,
    pub db: Arc<Database>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    _tmp_dir: TempDir,
}

impl World {
    pub fn new() -> Self {
        let tmp_dir = TempDir::new().unwrap();
        let db = Database::new(tmp_dir.path()).unwrap();
        let log = Log::default();

        World {
            broadcaster: Arc::new(RecordingBroadcaster {
                log: log.clone(),
                failures: Mutex::new(0),
            }),
            log,
            db: Arc::new(db),
            _tmp_dir: tmp_dir,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            store: Arc::new(RecordingStore {
                db: self.db.clone(),
                log: self.log.clone(),
            }),
            broadcaster: self.broadcaster.clone(),
            oracle: self.db.clone(),
            notifier: Arc::new(RecordingNotifier {
                log: self.log.clone(),
            }),
            signer: Arc::new(signer()),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.log.lock().unwrap().clone()
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Broadcast(transaction) => Some(transaction),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<(CircuitKey, CircuitResolution)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Notify(circuit, resolution) => Some((circuit, resolution)),
                _ => None,
            })
            .collect()
    }
}

/// Chain notifications driven by the test.
///
/// Like a real watcher it tells late subscribers about the current height
/// and about spends that happened before they subscribed.
#[derive(Default)]
pub struct MockChain {
    height: Mutex<Option<u32>>,
    spends: Mutex<HashMap<OutPoint, OutpointUpdate>>,
    height_subscribers: Mutex<Vec<mpsc::UnboundedSender<u32>>>,
    outpoint_subscribers: Mutex<HashMap<OutPoint, Vec<mpsc::UnboundedSender<OutpointUpdate>>>>,
}

impl MockChain {
    pub fn connect_block(&self, height: u32) {
        *self.height.lock().unwrap() = Some(height);
        self.height_subscribers
            .lock()
            .unwrap()
            .retain(|sender| sender.send(height).is_ok());
    }

    pub fn spend(&self, outpoint: OutPoint, spender: Transaction, height: u32) {
        let update = OutpointUpdate::Spent { spender, height };
        self.spends
            .lock()
            .unwrap()
            .insert(outpoint, update.clone());

        if let Some(subscribers) = self.outpoint_subscribers.lock().unwrap().get_mut(&outpoint) {
            subscribers.retain(|sender| sender.send(update.clone()).is_ok());
        }
    }
}

impl ChainWatcher for MockChain {
    fn watch_outpoint(&self, outpoint: OutPoint) -> BoxStream<'static, OutpointUpdate> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(update) = self.spends.lock().unwrap().get(&outpoint) {
            let _ = sender.send(update.clone());
        }
        self.outpoint_subscribers
            .lock()
            .unwrap()
            .entry(outpoint)
            .or_default()
            .push(sender);

        receiver.boxed()
    }

    fn watch_height(&self) -> BoxStream<'static, u32> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(height) = *self.height.lock().unwrap() {
            let _ = sender.send(height);
        }
        self.height_subscribers.lock().unwrap().push(sender);

        receiver.boxed()
    }
}

pub fn secret(byte: u8) -> SecretKey {
    SecretKey::from_slice(&[byte; 32]).unwrap()
}

pub fn point(byte: u8) -> PublicKey {
    PublicKey::from_secret_key(&SECP, &secret(byte))
}

pub fn signer() -> LocalSigner {
    LocalSigner::new(BaseSecrets {
        payment: secret(1),
        delayed_payment: secret(2),
        htlc: secret(3),
        revocation: secret(4),
    })
}

pub fn sweep_script() -> Script {
    witness::p2wpkh(&point(9))
}

pub fn funding_outpoint() -> OutPoint {
    OutPoint {
        txid: Txid::from_inner([1; 32]),
        vout: 0,
    }
}

pub fn circuit(htlc_id: u64) -> CircuitKey {
    CircuitKey {
        channel: ShortChannelId::new(400, 7, 1),
        htlc_id,
    }
}

pub fn htlc(htlc_id: u64, preimage: Preimage, cltv_expiry: u32) -> Htlc {
    Htlc {
        htlc_id,
        payment_hash: preimage.hash(),
        cltv_expiry,
        circuit_key: Some(circuit(htlc_id)),
    }
}

/// A commitment transaction spending the funding output together with its
/// description, output `i` carrying `outputs[i]`.
pub fn commitment(
    height: u64,
    per_commitment_point: PublicKey,
    outputs: Vec<(u64, OutputKind)>,
) -> (Transaction, Commitment) {
    let (lock_time, sequence) = close::obscure(height, OBSCURING_FACTOR);

    let outputs = outputs
        .into_iter()
        .enumerate()
        .map(|(vout, (value, kind))| CommitmentOutput {
            vout: vout as u32,
            value,
            kind,
            witness_script: Script::from(vec![0x51; 60 + vout]),
        })
        .collect::<Vec<_>>();

    let transaction = Transaction {
        version: 2,
        lock_time,
        input: vec![TxIn {
            previous_output: funding_outpoint(),
            script_sig: Script::new(),
            sequence,
            witness: vec![vec![0; 72], vec![0; 72]],
        }],
        output: outputs
            .iter()
            .map(|output| TxOut {
                value: output.value,
                script_pubkey: output.witness_script.to_v0_p2wsh(),
            })
            .collect(),
    };

    let commitment = Commitment {
        height,
        txid: transaction.txid(),
        per_commitment_point,
        outputs,
    };

    (transaction, commitment)
}

pub struct Channel {
    pub snapshot: ChannelSnapshot,
    pub local: Transaction,
    pub remote: Transaction,
    pub revoked: Transaction,
}

/// A channel at commitment height 8 with `htlcs` on our commitment. Its
/// revocation log holds commitment 5 with three outputs, revoked with
/// `revocation_secret`.
pub fn channel(htlcs: Vec<OutputKind>, revocation_secret: Option<SecretKey>) -> Channel {
    let mut local_outputs = vec![
        (100_000, OutputKind::ToLocal { csv_delay: 144 }),
        (50_000, OutputKind::ToRemote),
    ];
    local_outputs.extend(htlcs.into_iter().map(|kind| (20_000, kind)));
    let (local, local_commitment) = commitment(LOCAL_HEIGHT, point(20), local_outputs);

    let (remote, remote_commitment) = commitment(
        LOCAL_HEIGHT,
        point(21),
        vec![
            (50_000, OutputKind::ToLocal { csv_delay: 144 }),
            (100_000, OutputKind::ToRemote),
        ],
    );

    let revoked_secret = secret(22);
    let (revoked, revoked_commitment) = commitment(
        REVOKED_HEIGHT,
        PublicKey::from_secret_key(&SECP, &revoked_secret),
        vec![
            (60_000, OutputKind::ToLocal { csv_delay: 144 }),
            (40_000, OutputKind::ToRemote),
            (
                30_000,
                OutputKind::OfferedHtlc(htlc(1, Preimage::from([5; 32]), 500)),
            ),
        ],
    );

    let snapshot = ChannelSnapshot {
        channel_id: ChannelId::from_funding_outpoint(funding_outpoint()),
        short_channel_id: ShortChannelId::new(300, 2, 0),
        funding_outpoint: funding_outpoint(),
        obscuring_factor: OBSCURING_FACTOR,
        local_commitment,
        remote_commitment,
        remote_pending_commitment: None,
        revocation_log: vec![RevokedCommitment {
            commitment: revoked_commitment,
            per_commitment_secret: revocation_secret,
        }],
    };

    Channel {
        snapshot,
        local,
        remote,
        revoked,
    }
}

pub fn revocation_secret() -> SecretKey {
    secret(22)
}

/// A mutual close: no commitment markers in locktime and sequence.
pub fn cooperative_close() -> Transaction {
    Transaction {
        version: 2,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: funding_outpoint(),
            script_sig: Script::new(),
            sequence: 0xffff_ffff,
            witness: vec![vec![0; 72], vec![0; 72]],
        }],
        output: vec![
            TxOut {
                value: 90_000,
                script_pubkey: sweep_script(),
            },
            TxOut {
                value: 60_000,
                script_pubkey: witness::p2wpkh(&point(10)),
            },
        ],
    }
}

/// A transaction of the counterparty spending `outpoint`.
pub fn foreign_spend(outpoint: OutPoint, witness: Vec<Vec<u8>>) -> Transaction {
    Transaction {
        version: 2,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: Script::new(),
            sequence: 0xffff_ffff,
            witness,
        }],
        output: vec![TxOut {
            value: 10_000,
            script_pubkey: witness::p2wpkh(&point(10)),
        }],
    }
}

pub fn outpoint(transaction: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: transaction.txid(),
        vout,
    }
}
