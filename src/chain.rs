//! Chain reading: transaction receipts over JSON-RPC and ERC-20 `Transfer`
//! log decoding.

use crate::{
    error::{MarketError, Result},
    model::ChainConfig,
};
use alloy_primitives::{b256, Address, B256, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: B256 = b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    /// `0x1` on success, `0x0` on revert.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl TransactionReceipt {
    pub fn succeeded(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.trim_start_matches("0x"))
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            == Some(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Decodes a log as an ERC-20 `Transfer`, or `None` if it has another shape.
pub fn decode_transfer(log: &Log) -> Option<TransferEvent> {
    if log.topics.len() != 3 || log.topics[0] != TRANSFER_TOPIC {
        return None;
    }
    let data = hex::decode(log.data.trim_start_matches("0x")).ok()?;
    if data.len() != 32 {
        return None;
    }
    Some(TransferEvent {
        token: log.address,
        from: Address::from_word(log.topics[1]),
        to: Address::from_word(log.topics[2]),
        value: U256::from_be_slice(&data),
    })
}

/// All transfers in the receipt emitted by `token`.
pub fn decode_transfers(receipt: &TransactionReceipt, token: Address) -> Vec<TransferEvent> {
    receipt
        .logs
        .iter()
        .filter(|log| log.address == token)
        .filter_map(decode_transfer)
        .collect()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// `Ok(None)` when the node does not know the transaction (yet).
    async fn transaction_receipt(&self, chain: &ChainConfig, tx_hash: B256) -> Result<Option<TransactionReceipt>>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<R> {
    result: Option<R>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Ethereum JSON-RPC provider addressed through each chain's `rpc_url`.
pub struct JsonRpcProvider {
    client: Client,
    next_id: AtomicU64,
}

impl JsonRpcProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P, R>(&self, chain: &ChainConfig, method: &str, params: P) -> Result<Option<R>>
    where
        P: Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self.client.post(&chain.rpc_url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(MarketError::Provider(format!(
                "{} on chain {} returned {}",
                method,
                chain.chain_id,
                response.status()
            )));
        }

        let body: RpcResponse<R> = response.json().await?;
        if let Some(error) = body.error {
            return Err(MarketError::Provider(format!("{} failed ({}): {}", method, error.code, error.message)));
        }
        Ok(body.result)
    }
}

#[async_trait]
impl ChainProvider for JsonRpcProvider {
    async fn transaction_receipt(&self, chain: &ChainConfig, tx_hash: B256) -> Result<Option<TransactionReceipt>> {
        tracing::debug!(chain_id = chain.chain_id, %tx_hash, "Fetching transaction receipt");
        self.call(chain, "eth_getTransactionReceipt", [tx_hash]).await
    }
}
