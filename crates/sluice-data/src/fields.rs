//! Field projection: merges user field selections with defaults and forces
//! the always-on identity fields.
//!
//! Field names follow the upstream wire spelling (`parentHash`, `gasPrice`,
//! `transactionIndex`), since resolved masks are serialized directly into
//! archive queries.

use crate::types::{BlockHeader, BlockItem, FullBlockData, Log, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Default projection when the user selects nothing.
pub const DEFAULT_BLOCK_FIELDS: &[&str] = &["number", "hash", "parentHash", "timestamp"];
pub const DEFAULT_TX_FIELDS: &[&str] = &["hash", "from", "to", "input"];
pub const DEFAULT_LOG_FIELDS: &[&str] = &["address", "topics", "data", "transactionHash"];

/// Identity fields forced on regardless of user choice.
pub const ALWAYS_BLOCK_FIELDS: &[&str] = &["number", "hash"];
pub const ALWAYS_TX_FIELDS: &[&str] = &["transactionIndex"];
pub const ALWAYS_LOG_FIELDS: &[&str] = &["index", "transactionIndex"];

/// Pseudo-field on the log entity requesting the transaction join.
pub const LOG_TX_FIELD: &str = "transaction";

/// Per-entity field toggles as supplied by the user. `true` enables a field
/// on top of the defaults, `false` removes a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelection {
    pub block: BTreeMap<String, bool>,
    pub transaction: BTreeMap<String, bool>,
    pub log: BTreeMap<String, bool>,
}

/// Resolved upstream field masks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMasks {
    pub block: BTreeSet<String>,
    pub transaction: BTreeSet<String>,
    pub log: BTreeSet<String>,
    /// When true, log sub-queries carry the full transaction projection and
    /// matching transactions are joined onto log items.
    pub log_transaction: bool,
}

fn resolve_entity(
    user: &BTreeMap<String, bool>,
    defaults: &[&str],
    always: &[&str],
) -> BTreeSet<String> {
    let mut fields: BTreeSet<String> = defaults.iter().map(|f| f.to_string()).collect();
    for (name, enabled) in user {
        if *enabled {
            fields.insert(name.clone());
        } else {
            fields.remove(name);
        }
    }
    for name in always {
        fields.insert(name.to_string());
    }
    fields
}

/// Resolves a user selection into upstream masks.
pub fn resolve(user: &FieldSelection) -> FieldMasks {
    let mut log = user.log.clone();
    let log_transaction = log.remove(LOG_TX_FIELD).unwrap_or(false);
    FieldMasks {
        block: resolve_entity(&user.block, DEFAULT_BLOCK_FIELDS, ALWAYS_BLOCK_FIELDS),
        transaction: resolve_entity(&user.transaction, DEFAULT_TX_FIELDS, ALWAYS_TX_FIELDS),
        log: resolve_entity(&log, DEFAULT_LOG_FIELDS, ALWAYS_LOG_FIELDS),
        log_transaction,
    }
}

/// Normalizes a selection into its canonical form: every selected field is an
/// explicit `true`, every disabled default an explicit `false`. Normalizing a
/// normalized selection is a no-op, and both forms resolve to the same masks.
pub fn normalize(user: &FieldSelection) -> FieldSelection {
    let masks = resolve(user);
    let entity = |mask: &BTreeSet<String>, defaults: &[&str]| -> BTreeMap<String, bool> {
        let mut out: BTreeMap<String, bool> =
            mask.iter().map(|f| (f.clone(), true)).collect();
        for name in defaults {
            if !mask.contains(*name) {
                out.insert(name.to_string(), false);
            }
        }
        out
    };
    let mut log = entity(&masks.log, DEFAULT_LOG_FIELDS);
    if masks.log_transaction {
        log.insert(LOG_TX_FIELD.to_string(), true);
    }
    FieldSelection {
        block: entity(&masks.block, DEFAULT_BLOCK_FIELDS),
        transaction: entity(&masks.transaction, DEFAULT_TX_FIELDS),
        log,
    }
}

fn project_header(header: &mut BlockHeader, mask: &BTreeSet<String>) {
    // Identity and linkage fields (number, hash, parentHash, timestamp) stay
    // populated regardless of the mask; only the optional quantities are
    // subject to projection.
    if !mask.contains("nonce") {
        header.nonce = None;
    }
    if !mask.contains("difficulty") {
        header.difficulty = None;
    }
    if !mask.contains("totalDifficulty") {
        header.total_difficulty = None;
    }
    if !mask.contains("size") {
        header.size = None;
    }
    if !mask.contains("gasUsed") {
        header.gas_used = None;
    }
    if !mask.contains("gasLimit") {
        header.gas_limit = None;
    }
    if !mask.contains("baseFeePerGas") {
        header.base_fee_per_gas = None;
    }
}

fn project_transaction(tx: &mut Transaction, mask: &BTreeSet<String>) {
    if !mask.contains("from") {
        tx.from = None;
    }
    if !mask.contains("to") {
        tx.to = None;
    }
    if !mask.contains("input") {
        tx.input = None;
    }
    if !mask.contains("value") {
        tx.value = None;
    }
    if !mask.contains("gas") {
        tx.gas = None;
    }
    if !mask.contains("gasPrice") {
        tx.gas_price = None;
    }
    if !mask.contains("nonce") {
        tx.nonce = None;
    }
    if !mask.contains("v") {
        tx.v = None;
    }
    if !mask.contains("r") {
        tx.r = None;
    }
    if !mask.contains("s") {
        tx.s = None;
    }
    if !mask.contains("chainId") {
        tx.chain_id = None;
    }
    if !mask.contains("yParity") {
        tx.y_parity = None;
    }
    if !mask.contains("maxFeePerGas") {
        tx.max_fee_per_gas = None;
    }
    if !mask.contains("maxPriorityFeePerGas") {
        tx.max_priority_fee_per_gas = None;
    }
}

fn project_log(log: &mut Log, mask: &BTreeSet<String>) {
    if !mask.contains("address") {
        log.address = Default::default();
    }
    if !mask.contains("topics") {
        log.topics.clear();
    }
    if !mask.contains("data") {
        log.data = Default::default();
    }
    if !mask.contains("transactionHash") {
        log.transaction_hash = Default::default();
    }
}

/// Projects a mapped block down to the resolved masks. The archive applies
/// the projection server-side; the hot source fetches full objects and
/// projects here, so handlers see the same shape from both.
pub fn apply_masks(block: &mut FullBlockData, masks: &FieldMasks) {
    project_header(&mut block.header, &masks.block);
    for item in &mut block.items {
        match item {
            BlockItem::Transaction(tx) => project_transaction(tx, &masks.transaction),
            BlockItem::Log(log_item) => project_log(&mut log_item.log, &masks.log),
        }
    }
}
