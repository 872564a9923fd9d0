use crate::chain::{BlockSource, ChainWatcher, OutpointUpdate};
use backoff::{future::FutureOperation, ExponentialBackoff};
use bitcoin::{Block, BlockHash, OutPoint, Txid};
use futures::{
    future::Future,
    stream::{BoxStream, StreamExt},
    TryFutureExt,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug)]
enum Registration {
    Outpoint {
        outpoint: OutPoint,
        sender: mpsc::UnboundedSender<OutpointUpdate>,
    },
    Height {
        sender: mpsc::UnboundedSender<u32>,
    },
}

/// Cheap to clone handle used to subscribe to a running [`BlockWatcher`].
#[derive(Clone, Debug)]
pub struct BlockWatcherHandle {
    registrations: mpsc::UnboundedSender<Registration>,
}

impl BlockWatcherHandle {
    fn register(&self, registration: Registration) {
        if self.registrations.send(registration).is_err() {
            tracing::warn!("block watcher is not running, subscription will never fire");
        }
    }
}

impl ChainWatcher for BlockWatcherHandle {
    fn watch_outpoint(&self, outpoint: OutPoint) -> BoxStream<'static, OutpointUpdate> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.register(Registration::Outpoint { outpoint, sender });

        receiver.boxed()
    }

    fn watch_height(&self) -> BoxStream<'static, u32> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.register(Registration::Height { sender });

        receiver.boxed()
    }
}

#[derive(Debug)]
struct RecentBlock {
    height: u32,
    hash: BlockHash,
    /// Spends of watched outpoints in this block.
    spends: Vec<(OutPoint, Txid)>,
}

/// Follows the best chain of a [`BlockSource`] by polling it.
///
/// The last `window` blocks are remembered to detect reorgs: a new tip is
/// connected by walking back its ancestors until a remembered block is met,
/// everything above that block is disconnected.
#[derive(Debug)]
pub struct BlockWatcher<S> {
    source: Arc<S>,
    poll_interval: Duration,
    window: usize,
    recent: VecDeque<RecentBlock>,
    delivered_height: Option<u32>,
    outpoints: HashMap<OutPoint, Vec<mpsc::UnboundedSender<OutpointUpdate>>>,
    heights: Vec<mpsc::UnboundedSender<u32>>,
    registrations: mpsc::UnboundedReceiver<Registration>,
}

impl<S> BlockWatcher<S>
where
    S: BlockSource,
{
    pub fn new(source: Arc<S>, poll_interval: Duration, window: usize) -> (Self, BlockWatcherHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let watcher = Self {
            source,
            poll_interval,
            window: window.max(1),
            recent: VecDeque::new(),
            delivered_height: None,
            outpoints: HashMap::new(),
            heights: Vec::new(),
            registrations: receiver,
        };

        (watcher, BlockWatcherHandle {
            registrations: sender,
        })
    }

    /// Runs until every handle is dropped.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                registration = self.registrations.recv() => match registration {
                    Some(registration) => {
                        if let Err(e) = self.register(registration).await {
                            tracing::warn!("failed to rescan for new subscription: {:#}", e);
                        }
                    }
                    None => {
                        tracing::debug!("all block watcher handles dropped, stopping");
                        return;
                    }
                },
                _ = interval.tick() => {
                    if let Err(e) = self.sync().await {
                        tracing::warn!("failed to sync with block source: {:#}", e);
                    }
                }
            }
        }
    }

    async fn register(&mut self, registration: Registration) -> anyhow::Result<()> {
        match registration {
            Registration::Height { sender } => {
                if let Some(height) = self.delivered_height {
                    let _ = sender.send(height);
                }
                self.heights.push(sender);
            }
            Registration::Outpoint { outpoint, sender } => {
                self.rescan(outpoint, &sender).await?;
                self.outpoints.entry(outpoint).or_default().push(sender);
            }
        }

        Ok(())
    }

    /// Looks for spends of a newly watched outpoint in the remembered blocks.
    async fn rescan(
        &mut self,
        outpoint: OutPoint,
        sender: &mpsc::UnboundedSender<OutpointUpdate>,
    ) -> anyhow::Result<()> {
        let source = self.source.clone();
        let hashes = self
            .recent
            .iter()
            .map(|block| (block.height, block.hash))
            .collect::<Vec<_>>();

        for (height, hash) in hashes {
            let source = &*source;
            let block = retry(move || source.block_by_hash(hash)).await?;

            let spender = match block.txdata.into_iter().find(|transaction| {
                transaction
                    .input
                    .iter()
                    .any(|input| input.previous_output == outpoint)
            }) {
                Some(spender) => spender,
                None => continue,
            };

            tracing::debug!("rescan found {} spent in block {}", outpoint, height);
            if let Some(recent) = self.recent.iter_mut().find(|block| block.hash == hash) {
                let spend = (outpoint, spender.txid());
                if !recent.spends.contains(&spend) {
                    recent.spends.push(spend);
                }
            }
            let _ = sender.send(OutpointUpdate::Spent { spender, height });
        }

        Ok(())
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        let source = self.source.clone();
        let source = &*source;

        let (tip_hash, tip_height) = retry(move || source.best_block()).await?;
        if self.recent.back().map(|block| block.hash) == Some(tip_hash) {
            return Ok(());
        }

        let mut connected = Vec::new();
        let mut hash = tip_hash;
        let mut height = tip_height;

        let fork_height = loop {
            if let Some(known) = self.recent.iter().find(|block| block.hash == hash) {
                break Some(known.height);
            }

            let block = retry(move || source.block_by_hash(hash)).await?;
            let previous = block.header.prev_blockhash;
            connected.push((height, block));

            if self.recent.is_empty() || connected.len() >= self.window || height == 0 {
                break None;
            }
            hash = previous;
            height -= 1;
        };

        self.disconnect_above(fork_height);

        for (height, block) in connected.into_iter().rev() {
            self.connect(height, block);
        }

        Ok(())
    }

    fn disconnect_above(&mut self, fork_height: Option<u32>) {
        while let Some(block) = self.recent.back() {
            if matches!(fork_height, Some(fork_height) if block.height <= fork_height) {
                break;
            }

            if let Some(block) = self.recent.pop_back() {
                tracing::info!("block {} at height {} was disconnected", block.hash, block.height);

                for (outpoint, txid) in block.spends {
                    self.notify(outpoint, OutpointUpdate::Reorged { txid });
                }
            }
        }
    }

    fn connect(&mut self, height: u32, block: Block) {
        let hash = block.block_hash();
        let mut spends = Vec::new();

        for transaction in block.txdata {
            let watched = transaction
                .input
                .iter()
                .map(|input| input.previous_output)
                .filter(|outpoint| self.outpoints.contains_key(outpoint))
                .collect::<Vec<_>>();

            for outpoint in watched {
                spends.push((outpoint, transaction.txid()));
                self.notify(outpoint, OutpointUpdate::Spent {
                    spender: transaction.clone(),
                    height,
                });
            }
        }

        tracing::debug!("connected block {} at height {}", hash, height);
        self.recent.push_back(RecentBlock {
            height,
            hash,
            spends,
        });
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }

        if self.delivered_height.map_or(true, |delivered| height > delivered) {
            self.delivered_height = Some(height);
            self.heights.retain(|sender| sender.send(height).is_ok());
        }
    }

    fn notify(&mut self, outpoint: OutPoint, update: OutpointUpdate) {
        if let Some(senders) = self.outpoints.get_mut(&outpoint) {
            senders.retain(|sender| sender.send(update.clone()).is_ok());
        }
    }
}

/// Retries `fetch` until the block source answers.
async fn retry<T, F, Fut>(mut fetch: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let operation = || fetch().map_err(backoff::Error::Transient);
    let backoff = ExponentialBackoff {
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };

    operation
        .retry_notify(backoff, |e, _| {
            tracing::warn!("block source unavailable, retrying ...: {:#}", e)
        })
        .await
}
