//! Source traits consumed by the runner.
//!
//! The archive client and the RPC hot source are the production
//! implementations; tests substitute scripted fakes.

use crate::fields::FieldMasks;
use crate::plan::DataRequest;
use crate::types::{BatchResponse, FullBlockData};
use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;

/// Bulk source of finalized history.
#[async_trait]
pub trait FinalizedSource: Send + Sync {
    /// Highest finalized height the source can serve.
    async fn finalized_height(&self) -> Result<u64>;

    /// Fetches one batch starting at `from`. The source decides the actual
    /// range end; the returned batch always closes at `range.to`.
    async fn finalized_batch(
        &self,
        from: u64,
        to: Option<u64>,
        request: &DataRequest,
        masks: &FieldMasks,
    ) -> Result<BatchResponse>;
}

/// Latency-sensitive source following the unfinalized head.
#[async_trait]
pub trait HeadSource: Send + Sync {
    /// Current chain head height.
    async fn chain_height(&self) -> Result<u64>;

    /// Hash of the canonical block at `height`, if one exists yet. Used to
    /// locate the surviving ancestor during a reorg.
    async fn block_hash(&self, height: u64) -> Result<Option<B256>>;

    /// Fetches, maps, filters, and projects the block at `height`.
    /// `None` when the chain has not produced it yet.
    async fn block(
        &self,
        height: u64,
        request: &DataRequest,
        masks: &FieldMasks,
    ) -> Result<Option<FullBlockData>>;
}
