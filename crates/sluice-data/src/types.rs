//! Canonical block, transaction, and log records delivered to batch handlers.
//!
//! Both upstream sources (archive and node RPC) are mapped into these types,
//! so handlers see a single shape regardless of where a block came from.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Block header with identity fields plus optionally projected extras.
///
/// `height`, `hash`, `parent_hash`, and `timestamp` are always populated
/// (deselected fields fall back to zero values). The remaining quantities are
/// present only when selected by the field projection. Header fields the
/// mapper does not recognize are preserved verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub height: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_difficulty: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    /// Unrecognized upstream header fields, passed through untouched.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BlockHeader {
    /// Stable handler-facing identifier for this block.
    pub fn id(&self) -> String {
        format_id(self.height, &self.hash)
    }
}

/// Transaction record. `index` and `hash` are identity fields; everything
/// else is governed by the field projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Position within the block.
    pub index: u32,
    pub hash: B256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub v: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y_parity: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
}

impl Transaction {
    /// First four bytes of the call data, when input was selected.
    pub fn sighash(&self) -> Option<[u8; 4]> {
        let input = self.input.as_ref()?;
        if input.len() < 4 {
            return None;
        }
        Some([input[0], input[1], input[2], input[3]])
    }
}

/// Event log record. `index` and `transaction_index` are identity fields;
/// deselected payload fields fall back to zero values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Position within the block.
    pub index: u32,
    pub address: Address,
    /// Up to four topics, topic0 first.
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub transaction_index: u32,
    pub transaction_hash: B256,
}

/// A log together with an optional back-reference to its transaction.
///
/// `tx` is the position of the matching transaction item *earlier* in the
/// same block's items, or `None` when the transaction was not selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    pub log: Log,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<usize>,
}

/// One entry in a block's ordered item sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlockItem {
    Transaction(Transaction),
    Log(LogItem),
}

impl BlockItem {
    /// Sort key implementing the item ordering: transaction index ascending,
    /// then transactions before their logs, then log index ascending.
    pub fn order_key(&self) -> (u32, u8, u32) {
        match self {
            BlockItem::Transaction(tx) => (tx.index, 0, 0),
            BlockItem::Log(item) => (item.log.transaction_index, 1, item.log.index),
        }
    }
}

/// A fully assembled block: header plus ordered items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullBlockData {
    pub header: BlockHeader,
    pub items: Vec<BlockItem>,
}

impl FullBlockData {
    /// Resolves a log item's transaction back-reference.
    pub fn transaction_of(&self, item: &LogItem) -> Option<&Transaction> {
        match self.items.get(item.tx?) {
            Some(BlockItem::Transaction(tx)) => Some(tx),
            _ => None,
        }
    }

    /// True when `items` obey the canonical ordering and every log
    /// back-reference points at an earlier transaction item.
    pub fn items_are_ordered(&self) -> bool {
        let keys: Vec<_> = self.items.iter().map(BlockItem::order_key).collect();
        if !keys.windows(2).all(|w| w[0] < w[1]) {
            return false;
        }
        self.items.iter().enumerate().all(|(pos, item)| match item {
            BlockItem::Log(LogItem { tx: Some(at), .. }) => {
                *at < pos && matches!(self.items.get(*at), Some(BlockItem::Transaction(_)))
            }
            _ => true,
        })
    }
}

/// Inclusive height range with both bounds fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedRange {
    pub from: u64,
    pub to: u64,
}

/// One batch of mapped blocks returned by a source.
///
/// Invariant: `blocks` are sorted by height ascending and
/// `blocks.last().header.height == range.to` (sources backfill a stub header
/// when the upstream returned no data for the trailing block).
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub range: ClosedRange,
    pub blocks: Vec<FullBlockData>,
    /// Upstream's view of the chain head at response time.
    pub chain_height: u64,
}

fn short_hash(hash: &B256) -> String {
    format!("{hash:x}")[..5].to_string()
}

/// Stable block identifier: zero-padded height joined with a hash prefix.
pub fn format_id(height: u64, hash: &B256) -> String {
    format!("{:010}-{}", height, short_hash(hash))
}

/// Stable item identifier: block id plus a zero-padded item index.
pub fn format_item_id(height: u64, hash: &B256, index: u32) -> String {
    format!("{:010}-{}-{:06}", height, short_hash(hash), index)
}
