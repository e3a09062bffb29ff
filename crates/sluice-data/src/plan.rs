//! Request planning: user-declared filters, range clamping, and merging of
//! overlapping sub-requests into disjoint range-bounded plans.

use crate::types::{Log, Transaction};
use alloy::primitives::{Address, FixedBytes, B256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Four-byte function selector.
pub type Sighash = FixedBytes<4>;

/// Log filter. Empty lists mean "match any"; `topics[i]` constrains the
/// i-th topic position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCriterion {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Vec<B256>>,
}

impl LogCriterion {
    pub fn matches(&self, log: &Log) -> bool {
        if !self.address.is_empty() && !self.address.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(position, allowed)| {
            allowed.is_empty()
                || log
                    .topics
                    .get(position)
                    .is_some_and(|topic| allowed.contains(topic))
        })
    }
}

/// Transaction filter. Empty lists mean "match any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TxCriterion {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sighash: Vec<Sighash>,
}

impl TxCriterion {
    pub fn matches(&self, tx: &Transaction) -> bool {
        if !self.to.is_empty() && !tx.to.is_some_and(|to| self.to.contains(&to)) {
            return false;
        }
        if !self.from.is_empty() && !tx.from.is_some_and(|from| self.from.contains(&from)) {
            return false;
        }
        if !self.sighash.is_empty() {
            let Some(sighash) = tx.sighash() else {
                return false;
            };
            if !self.sighash.contains(&Sighash::from(sighash)) {
                return false;
            }
        }
        true
    }
}

/// Union of filters requested for some height range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DataRequest {
    pub include_all_blocks: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogCriterion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<TxCriterion>,
}

impl DataRequest {
    /// True when the hot source must fetch full transaction objects.
    pub fn wants_transactions(&self) -> bool {
        !self.transactions.is_empty()
    }

    /// True when the hot source must fetch receipts for logs.
    pub fn wants_logs(&self) -> bool {
        !self.logs.is_empty()
    }

    pub fn matches_tx(&self, tx: &Transaction) -> bool {
        self.transactions.iter().any(|criterion| criterion.matches(tx))
    }

    pub fn matches_log(&self, log: &Log) -> bool {
        self.logs.iter().any(|criterion| criterion.matches(log))
    }

    /// Unions another request into this one: filter lists concatenate,
    /// `include_all_blocks` ORs.
    pub fn merge(&mut self, other: &DataRequest) {
        self.include_all_blocks |= other.include_all_blocks;
        self.logs.extend(other.logs.iter().cloned());
        self.transactions.extend(other.transactions.iter().cloned());
    }
}

/// Inclusive height range; `to == None` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to: Option<u64>,
}

impl BlockRange {
    pub fn new(from: u64, to: Option<u64>) -> Self {
        Self { from, to }
    }

    /// The full chain.
    pub fn all() -> Self {
        Self { from: 0, to: None }
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.from && self.to.map_or(true, |to| height <= to)
    }

    /// Intersection with `clamp`, or `None` when disjoint or `clamp` itself
    /// is empty (`from > to`).
    pub fn clip(&self, clamp: &BlockRange) -> Option<BlockRange> {
        let from = self.from.max(clamp.from);
        let to = match (self.to, clamp.to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        match to {
            Some(to) if from > to => None,
            _ => Some(BlockRange { from, to }),
        }
    }
}

/// A range-bounded request, the unit the runner dispatches to sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub range: BlockRange,
    pub request: DataRequest,
}

/// Merges a list of possibly-overlapping batch requests into an equivalent
/// list with disjoint, ascending ranges whose per-range filters are the
/// union of all inputs covering that range. `clamp` drops sub-requests
/// wholly outside the global range and truncates partial overlaps.
///
/// Field projection is intentionally absent here: it is a processor-wide
/// setting applied after merging.
pub fn merge_requests(
    requests: Vec<BatchRequest>,
    clamp: Option<&BlockRange>,
) -> Vec<BatchRequest> {
    let clamped: Vec<BatchRequest> = requests
        .into_iter()
        .filter_map(|entry| {
            let range = match clamp {
                Some(clamp) => entry.range.clip(clamp)?,
                None => entry.range,
            };
            Some(BatchRequest {
                range,
                request: entry.request,
            })
        })
        .collect();

    if clamped.is_empty() {
        return Vec::new();
    }

    // Split at every range boundary so each segment has a constant set of
    // covering requests.
    let mut points: BTreeSet<u64> = BTreeSet::new();
    let mut open_ended = false;
    for entry in &clamped {
        points.insert(entry.range.from);
        match entry.range.to.and_then(|to| to.checked_add(1)) {
            Some(after) => {
                points.insert(after);
            }
            // Open-ended, or closed at the top of the height space.
            None => open_ended = true,
        }
    }

    let points: Vec<u64> = points.into_iter().collect();
    let mut merged: Vec<BatchRequest> = Vec::new();
    for (position, &start) in points.iter().enumerate() {
        let end = match points.get(position + 1) {
            Some(&next) => Some(next - 1),
            None if open_ended => None,
            None => continue,
        };

        let mut request: Option<DataRequest> = None;
        for entry in &clamped {
            if entry.range.from <= start && entry.range.to.map_or(true, |to| to >= start) {
                request
                    .get_or_insert_with(DataRequest::default)
                    .merge(&entry.request);
            }
        }
        let Some(request) = request else {
            continue;
        };

        // Coalesce with the previous segment when contiguous and identical.
        if let Some(last) = merged.last_mut() {
            if last.request == request && last.range.to == Some(start.saturating_sub(1)) {
                last.range.to = end;
                continue;
            }
        }
        merged.push(BatchRequest {
            range: BlockRange { from: start, to: end },
            request,
        });
    }
    merged
}
