//! Upstream wire objects and hex parsing helpers.
//!
//! Both the archive's `/query` payload and the node RPC's
//! `eth_getBlockByNumber` / receipt responses deserialize into these structs:
//! quantities arrive as `0x`-prefixed hex strings, indexes as either JSON
//! numbers (archive) or hex strings (RPC). Hex is parsed exactly once, at the
//! mapper boundary.

use alloy::primitives::U256;
use eyre::{eyre, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Parses a `0x`-prefixed hex quantity, falling back to decimal.
pub fn parse_hex_u64(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    if let Some(hex) = trimmed.strip_prefix("0x") {
        if hex.is_empty() {
            return Ok(0);
        }
        return u64::from_str_radix(hex, 16)
            .map_err(|e| eyre!("malformed hex quantity {trimmed:?}: {e}"));
    }
    trimmed
        .parse::<u64>()
        .map_err(|e| eyre!("malformed decimal quantity {trimmed:?}: {e}"))
}

/// Parses a `0x`-prefixed hex quantity into a u256, falling back to decimal.
pub fn parse_hex_u256(value: &str) -> Result<U256> {
    let trimmed = value.trim();
    if let Some(hex) = trimmed.strip_prefix("0x") {
        if hex.is_empty() {
            return Ok(U256::ZERO);
        }
        return U256::from_str_radix(hex, 16)
            .map_err(|e| eyre!("malformed hex quantity {trimmed:?}: {e}"));
    }
    U256::from_str_radix(trimmed, 10)
        .map_err(|e| eyre!("malformed decimal quantity {trimmed:?}: {e}"))
}

fn u64_from_value(value: &serde_json::Value) -> Result<u64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| eyre!("numeric index out of range: {n}")),
        serde_json::Value::String(s) => parse_hex_u64(s),
        other => Err(eyre!("expected number or hex string, got {other}")),
    }
}

/// Deserializes a u64 that may arrive as a JSON number or a hex string.
pub fn hex_or_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    u64_from_value(&value).map_err(serde::de::Error::custom)
}

/// Optional variant of [`hex_or_u64`].
pub fn opt_hex_or_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => u64_from_value(&v).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Block header as returned by either upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireBlockHeader {
    #[serde(deserialize_with = "hex_or_u64")]
    pub number: u64,
    pub hash: String,
    pub parent_hash: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub difficulty: Option<String>,
    pub total_difficulty: Option<String>,
    pub size: Option<String>,
    pub gas_used: Option<String>,
    pub gas_limit: Option<String>,
    pub base_fee_per_gas: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Transaction as returned by either upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireTransaction {
    #[serde(deserialize_with = "hex_or_u64")]
    pub transaction_index: u64,
    pub hash: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub input: Option<String>,
    pub value: Option<String>,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    #[serde(deserialize_with = "opt_hex_or_u64")]
    pub nonce: Option<u64>,
    pub v: Option<String>,
    pub r: Option<String>,
    pub s: Option<String>,
    #[serde(deserialize_with = "opt_hex_or_u64")]
    pub chain_id: Option<u64>,
    #[serde(deserialize_with = "opt_hex_or_u64")]
    pub y_parity: Option<u64>,
    pub max_fee_per_gas: Option<String>,
    pub max_priority_fee_per_gas: Option<String>,
}

/// Event log as returned by either upstream. The archive calls the in-block
/// position `index`; the RPC calls it `logIndex`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireLog {
    #[serde(alias = "logIndex", deserialize_with = "hex_or_u64")]
    pub index: u64,
    #[serde(deserialize_with = "hex_or_u64")]
    pub transaction_index: u64,
    pub transaction_hash: Option<String>,
    pub address: Option<String>,
    pub topics: Option<Vec<String>>,
    pub data: Option<String>,
}

/// One block's worth of archive data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireBlockData {
    pub block: WireBlockHeader,
    pub transactions: Vec<WireTransaction>,
    pub logs: Vec<WireLog>,
}

/// `POST /query` response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResponse {
    #[serde(default)]
    pub data: Vec<Vec<WireBlockData>>,
    pub next_block: u64,
    pub archive_height: u64,
}

/// `GET /height` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeightResponse {
    pub height: u64,
}

/// `eth_getBlockByNumber` result: header fields plus either transaction
/// hashes or full transaction objects.
#[derive(Debug, Clone, Deserialize)]
pub struct WireRpcBlock {
    #[serde(flatten)]
    pub header: WireBlockHeader,
    #[serde(default)]
    pub transactions: WireBlockTransactions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireBlockTransactions {
    Hashes(Vec<String>),
    Full(Vec<WireTransaction>),
}

impl Default for WireBlockTransactions {
    fn default() -> Self {
        WireBlockTransactions::Hashes(Vec::new())
    }
}

impl WireBlockTransactions {
    pub fn hashes(&self) -> Vec<String> {
        match self {
            WireBlockTransactions::Hashes(hashes) => hashes.clone(),
            WireBlockTransactions::Full(txs) => {
                txs.iter().filter_map(|tx| tx.hash.clone()).collect()
            }
        }
    }
}

/// Transaction receipt, reduced to what the pipeline consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireReceipt {
    pub transaction_hash: Option<String>,
    #[serde(deserialize_with = "hex_or_u64")]
    pub transaction_index: u64,
    pub logs: Vec<WireLog>,
}
