//! Hot source: follows the chain tip over standard JSON-RPC 2.0.
//!
//! Uses `eth_blockNumber`, `eth_getBlockByNumber`, and `eth_getBlockReceipts`
//! (falling back to per-transaction `eth_getTransactionReceipt` on nodes that
//! lack the batch form). The node returns everything; filtering and field
//! projection happen client-side so hot blocks come out shaped exactly like
//! archive blocks.

use crate::fields::{apply_masks, FieldMasks};
use crate::mapper::{assemble_items, map_header, map_log, map_transaction};
use crate::plan::DataRequest;
use crate::source::HeadSource;
use crate::transport::{
    classify_request_error, classify_status, with_backoff, Attempt, RetryPolicy, HTTP_TIMEOUT,
};
use crate::types::{BlockHeader, FullBlockData, Log, Transaction};
use crate::wire::{parse_hex_u64, WireBlockTransactions, WireReceipt, WireRpcBlock};
use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::{eyre, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 client with bounded request concurrency.
#[derive(Debug, Clone)]
pub struct RpcClient {
    url: String,
    client: reqwest::Client,
    capacity: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl RpcClient {
    /// # Errors
    /// Returns error if the underlying HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .wrap_err("failed to build RPC HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
            capacity: Arc::new(Semaphore::new(DEFAULT_CAPACITY)),
            retry: RetryPolicy::default(),
        })
    }

    /// Caps the number of concurrently dispatched requests.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Arc::new(Semaphore::new(capacity.max(1)));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<R>> {
        let _permit = self
            .capacity
            .acquire()
            .await
            .wrap_err("RPC capacity semaphore closed")?;
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        with_backoff(method, &self.retry, || async {
            let response = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|e| classify_request_error(e, method))?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, text, method));
            }
            let envelope: RpcEnvelope<R> = response
                .json()
                .await
                .map_err(|e| Attempt::Fatal(eyre!("{method}: malformed response: {e}")))?;
            if let Some(error) = envelope.error {
                return Err(Attempt::Fatal(eyre!(
                    "{method}: RPC error {}: {}",
                    error.code,
                    error.message
                )));
            }
            Ok(envelope.result)
        })
        .await
    }

    pub async fn block_number(&self) -> Result<u64> {
        let result: String = self
            .call("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| eyre!("eth_blockNumber returned null"))?;
        parse_hex_u64(&result).wrap_err("eth_blockNumber")
    }

    pub async fn block_by_number(&self, height: u64, full: bool) -> Result<Option<WireRpcBlock>> {
        self.call(
            "eth_getBlockByNumber",
            serde_json::json!([format!("0x{height:x}"), full]),
        )
        .await
        .wrap_err_with(|| format!("eth_getBlockByNumber for block {height}"))
    }

    pub async fn block_receipts(&self, height: u64) -> Result<Option<Vec<WireReceipt>>> {
        self.call(
            "eth_getBlockReceipts",
            serde_json::json!([format!("0x{height:x}")]),
        )
        .await
        .wrap_err_with(|| format!("eth_getBlockReceipts for block {height}"))
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<WireReceipt>> {
        self.call("eth_getTransactionReceipt", serde_json::json!([hash]))
            .await
            .wrap_err_with(|| format!("eth_getTransactionReceipt for {hash}"))
    }
}

/// True when `header` does not extend the chain ending in `prev_hash`.
pub fn parent_mismatch(prev_hash: &B256, header: &BlockHeader) -> bool {
    header.parent_hash != *prev_hash
}

/// Applies the request's filters to a block's raw transactions and logs and
/// assembles the surviving items in canonical order.
///
/// When the log-to-transaction join is on, transactions referenced by
/// selected logs are pulled in even if no transaction filter asked for them,
/// so the log items' back-references resolve.
pub fn select_items(
    transactions: &[Transaction],
    logs: Vec<Log>,
    request: &DataRequest,
    masks: &FieldMasks,
) -> Vec<crate::types::BlockItem> {
    let kept_logs: Vec<Log> = logs
        .into_iter()
        .filter(|log| request.matches_log(log))
        .collect();
    let mut kept_txs: Vec<Transaction> = transactions
        .iter()
        .filter(|tx| request.matches_tx(tx))
        .cloned()
        .collect();

    if masks.log_transaction {
        for log in &kept_logs {
            if kept_txs.iter().all(|tx| tx.index != log.transaction_index) {
                if let Some(tx) = transactions
                    .iter()
                    .find(|tx| tx.index == log.transaction_index)
                {
                    kept_txs.push(tx.clone());
                }
            }
        }
    }

    assemble_items(kept_txs, kept_logs)
}

/// Head follower built on [`RpcClient`].
pub struct HotSource {
    rpc: RpcClient,
    /// Cleared the first time `eth_getBlockReceipts` comes back unsupported.
    batch_receipts: AtomicBool,
}

impl HotSource {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            batch_receipts: AtomicBool::new(true),
        }
    }

    async fn receipts_for(&self, height: u64, block: &WireRpcBlock) -> Result<Vec<WireReceipt>> {
        if self.batch_receipts.load(Ordering::Relaxed) {
            match self.rpc.block_receipts(height).await {
                Ok(Some(receipts)) => return Ok(receipts),
                Ok(None) => return Ok(Vec::new()),
                Err(error) => {
                    tracing::warn!(
                        height,
                        error = %error,
                        "eth_getBlockReceipts unavailable, falling back to per-transaction receipts"
                    );
                    self.batch_receipts.store(false, Ordering::Relaxed);
                }
            }
        }

        let hashes = block.transactions.hashes();
        let receipts = futures::future::try_join_all(
            hashes.iter().map(|hash| self.rpc.transaction_receipt(hash)),
        )
        .await?;
        receipts
            .into_iter()
            .zip(&hashes)
            .map(|(receipt, hash)| {
                receipt.ok_or_else(|| eyre!("missing receipt for transaction {hash}"))
            })
            .collect()
    }
}

#[async_trait]
impl HeadSource for HotSource {
    async fn chain_height(&self) -> Result<u64> {
        self.rpc.block_number().await
    }

    async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        let Some(block) = self.rpc.block_by_number(height, false).await? else {
            return Ok(None);
        };
        let header = map_header(&block.header)
            .wrap_err_with(|| format!("failed to map block header at height {height}"))?;
        Ok(Some(header.hash))
    }

    #[tracing::instrument(skip_all, fields(height))]
    async fn block(
        &self,
        height: u64,
        request: &DataRequest,
        masks: &FieldMasks,
    ) -> Result<Option<FullBlockData>> {
        // Full transaction objects are needed both for transaction items and
        // for the log-to-transaction join.
        let want_txs = request.wants_transactions() || masks.log_transaction;
        let Some(wire) = self.rpc.block_by_number(height, want_txs).await? else {
            return Ok(None);
        };

        let header = map_header(&wire.header)
            .wrap_err_with(|| format!("failed to map block {} {}", height, wire.header.hash))?;

        let transactions: Vec<Transaction> = match &wire.transactions {
            WireBlockTransactions::Full(txs) => txs
                .iter()
                .map(map_transaction)
                .collect::<Result<Vec<_>>>()
                .wrap_err_with(|| format!("failed to map block {} {}", height, header.hash))?,
            WireBlockTransactions::Hashes(_) => Vec::new(),
        };

        let logs: Vec<Log> = if request.wants_logs() {
            let receipts = self.receipts_for(height, &wire).await?;
            receipts
                .iter()
                .flat_map(|receipt| receipt.logs.iter())
                .map(map_log)
                .collect::<Result<Vec<_>>>()
                .wrap_err_with(|| format!("failed to map block {} {}", height, header.hash))?
        } else {
            Vec::new()
        };

        let mut block = FullBlockData {
            header,
            items: select_items(&transactions, logs, request, masks),
        };
        apply_masks(&mut block, masks);
        Ok(Some(block))
    }
}
