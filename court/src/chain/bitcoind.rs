use crate::chain::{
    jsonrpc::{self, ConnectionFailed, JsonRpcError},
    BlockSource, BroadcastError, Broadcaster,
};
use anyhow::Context;
use async_trait::async_trait;
use backoff::{future::FutureOperation, ExponentialBackoff};
use bitcoin::{
    consensus::{deserialize, encode::serialize_hex},
    Block, BlockHash, Transaction, Txid,
};
use futures::TryFutureExt;
use reqwest::Client;
use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use url::Url;

const RPC_VERIFY_REJECTED: i64 = -26;
const RPC_VERIFY_ALREADY_IN_CHAIN: i64 = -27;

#[derive(Clone, Debug, Deserialize)]
pub struct ChainInfo {
    pub bestblockhash: BlockHash,
    pub blocks: u32,
}

/// Reads blocks from bitcoind's REST interface.
#[derive(Debug)]
pub struct BitcoindConnector {
    chaininfo_url: Url,
    raw_block_by_hash_url: Url,
    block_hash_by_height_url: Url,
    client: Client,
}

impl BitcoindConnector {
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        Ok(Self {
            chaininfo_url: base_url.join("rest/chaininfo.json")?,
            raw_block_by_hash_url: base_url.join("rest/block/")?,
            block_hash_by_height_url: base_url.join("rest/blockhashbyheight/")?,
            client: Client::new(),
        })
    }

    fn raw_block_by_hash_url(&self, block_hash: &BlockHash) -> anyhow::Result<Url> {
        Ok(self
            .raw_block_by_hash_url
            .join(&format!("{}.hex", block_hash))?)
    }

    fn block_hash_by_height_url(&self, height: u32) -> anyhow::Result<Url> {
        Ok(self
            .block_hash_by_height_url
            .join(&format!("{}.hex", height))?)
    }

    pub async fn chain_info(&self) -> anyhow::Result<ChainInfo> {
        let url = &self.chaininfo_url;
        let chain_info = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| GetRequestFailed(url.clone()))?
            .json::<ChainInfo>()
            .await
            .context("failed to deserialize JSON response as chaininfo")?;

        tracing::trace!("fetched chain info: {:?} from bitcoind", chain_info);

        Ok(chain_info)
    }

    async fn get_text(&self, url: Url) -> anyhow::Result<String> {
        let text = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| GetRequestFailed(url.clone()))?
            .error_for_status()
            .with_context(|| GetRequestFailed(url))?
            .text()
            .await?;

        Ok(text)
    }
}

#[async_trait]
impl BlockSource for BitcoindConnector {
    async fn best_block(&self) -> anyhow::Result<(BlockHash, u32)> {
        let chain_info = self.chain_info().await?;

        Ok((chain_info.bestblockhash, chain_info.blocks))
    }

    async fn block_by_hash(&self, block_hash: BlockHash) -> anyhow::Result<Block> {
        let url = self.raw_block_by_hash_url(&block_hash)?;
        let block = self
            .get_text(url)
            .map_ok(decode_response)
            .await??;

        tracing::trace!(
            "fetched block {} with {} transactions from bitcoind",
            block_hash,
            block.txdata.len()
        );

        Ok(block)
    }

    async fn block_hash_at(&self, height: u32) -> anyhow::Result<BlockHash> {
        let url = self.block_hash_by_height_url(height)?;
        let text = self.get_text(url).await?;
        let hash = BlockHash::from_str(text.trim())
            .with_context(|| format!("invalid hash of block at height {}", height))?;

        Ok(hash)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("GET request to {0} failed")]
pub struct GetRequestFailed(Url);

fn decode_response(response_text: String) -> anyhow::Result<Block> {
    let bytes = hex::decode(response_text.trim()).context("failed to decode hex")?;
    let block = deserialize(bytes.as_slice()).context("failed to deserialize bytes as block")?;

    Ok(block)
}

/// Broadcasts claims through bitcoind's `sendrawtransaction`.
#[derive(Clone, Debug)]
pub struct BitcoindBroadcaster {
    client: jsonrpc::Client,
}

impl BitcoindBroadcaster {
    /// `node_url` may carry the RPC credentials as user info.
    pub fn new(node_url: Url) -> Self {
        Self {
            client: jsonrpc::Client::new(node_url),
        }
    }
}

#[async_trait]
impl Broadcaster for BitcoindBroadcaster {
    async fn broadcast(&self, transaction: &Transaction) -> Result<Txid, BroadcastError> {
        let txid = transaction.txid();
        let hex = serialize_hex(transaction);

        let operation = || {
            let client = self.client.clone();
            let request = jsonrpc::Request::new("sendrawtransaction", vec![hex.clone()]);

            async move {
                client.send::<_, Txid>(request).await.map_err(|e| {
                    if e.downcast_ref::<ConnectionFailed>().is_some() {
                        backoff::Error::Transient(e)
                    } else {
                        backoff::Error::Permanent(e)
                    }
                })
            }
        };
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..ExponentialBackoff::default()
        };

        match operation
            .retry_notify(backoff, |e, _| {
                tracing::warn!("failed to reach bitcoind, retrying ...: {:#}", e)
            })
            .await
        {
            Ok(txid) => {
                tracing::info!("broadcast {}", txid);
                Ok(txid)
            }
            Err(e) => classify_rejection(e, txid),
        }
    }
}

fn classify_rejection(error: anyhow::Error, txid: Txid) -> Result<Txid, BroadcastError> {
    let rpc_error = match error.downcast_ref::<JsonRpcError>() {
        Some(rpc_error) => rpc_error,
        None => return Err(BroadcastError::Other(error)),
    };

    match rpc_error.code {
        RPC_VERIFY_ALREADY_IN_CHAIN => Ok(txid),
        RPC_VERIFY_REJECTED if rpc_error.message.contains("already") => Ok(txid),
        RPC_VERIFY_REJECTED if rpc_error.message.contains("fee") => {
            Err(BroadcastError::InsufficientFee)
        }
        _ => Err(BroadcastError::Other(error)),
    }
}
