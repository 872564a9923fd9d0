//! Everything the court needs to know about the blockchain.

mod bitcoind;
mod jsonrpc;
mod watcher;

pub use self::{
    bitcoind::{BitcoindBroadcaster, BitcoindConnector, ChainInfo},
    watcher::{BlockWatcher, BlockWatcherHandle},
};

use async_trait::async_trait;
use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use futures::stream::BoxStream;

#[derive(Clone, Debug, PartialEq)]
pub enum OutpointUpdate {
    Spent { spender: Transaction, height: u32 },
    /// The block containing the spend `txid` was disconnected.
    Reorged { txid: Txid },
}

/// Chain notifications for a set of outpoints.
///
/// Heights are delivered in increasing order. Spends may be delivered more
/// than once, consumers deduplicate by outpoint and txid.
pub trait ChainWatcher: Send + Sync + 'static {
    fn watch_outpoint(&self, outpoint: OutPoint) -> BoxStream<'static, OutpointUpdate>;

    fn watch_height(&self) -> BoxStream<'static, u32>;
}

#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, BroadcastError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("transaction does not pay enough fee to be relayed")]
    InsufficientFee,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Where blocks come from.
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    /// Hash and height of the tip of the best chain.
    async fn best_block(&self) -> anyhow::Result<(BlockHash, u32)>;

    async fn block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Block>;

    async fn block_hash_at(&self, height: u32) -> anyhow::Result<BlockHash>;
}
