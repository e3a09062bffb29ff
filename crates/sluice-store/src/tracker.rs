//! Row-level change records captured while the handler runs on unfinalized
//! blocks.
//!
//! Every mutation performed through the store's row-ops interface during a
//! hot batch is recorded here with enough pre-image to undo it. Records are
//! JSON-serialized into the `{schema}_hot_change_log` side table, keyed by
//! `(block_height, idx)` with `idx` monotonically increasing per block.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Column values of one row, keyed by column name. `id` is carried
/// separately and never appears here.
pub type RowValues = BTreeMap<String, serde_json::Value>;

/// One recorded mutation. `prior` holds the full pre-image of the tracked
/// columns, sufficient to restore the row exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangeRecord {
    Insert {
        table: String,
        id: String,
    },
    Update {
        table: String,
        id: String,
        #[serde(rename = "priorFields")]
        prior: RowValues,
    },
    Delete {
        table: String,
        id: String,
        #[serde(rename = "priorFields")]
        prior: RowValues,
    },
}

impl ChangeRecord {
    pub fn table(&self) -> &str {
        match self {
            ChangeRecord::Insert { table, .. }
            | ChangeRecord::Update { table, .. }
            | ChangeRecord::Delete { table, .. } => table,
        }
    }
}

/// Allocates change-log indexes for one block. One tracker exists per hot
/// block; finalized batches run without one.
#[derive(Debug)]
pub struct ChangeTracker {
    block_height: u64,
    next_index: u64,
}

impl ChangeTracker {
    pub fn new(block_height: u64) -> Self {
        Self {
            block_height,
            next_index: 0,
        }
    }

    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    /// Next change-log index, monotonically increasing.
    pub fn next_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_serialize_with_kind_tag_and_prior_fields() {
        let record = ChangeRecord::Update {
            table: "balances".to_string(),
            id: "0xabc".to_string(),
            prior: [("amount".to_string(), serde_json::json!(5))]
                .into_iter()
                .collect(),
        };
        let json = serde_json::to_value(&record).expect("serializable");
        assert_eq!(json["kind"], serde_json::json!("update"));
        assert_eq!(json["table"], serde_json::json!("balances"));
        assert_eq!(json["priorFields"]["amount"], serde_json::json!(5));

        let back: ChangeRecord = serde_json::from_value(json).expect("round trip");
        assert_eq!(back, record);
    }

    #[test]
    fn indexes_are_monotonic_per_block() {
        let mut tracker = ChangeTracker::new(42);
        assert_eq!(tracker.block_height(), 42);
        assert_eq!(tracker.next_index(), 0);
        assert_eq!(tracker.next_index(), 1);
        assert_eq!(tracker.next_index(), 2);
    }
}
