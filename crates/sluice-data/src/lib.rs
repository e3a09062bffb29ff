//! sluice-data: canonical EVM data model, request planning, and the two
//! upstream sources (archive HTTP and node RPC) of the sluice pipeline.

pub mod archive;
pub mod fields;
pub mod mapper;
pub mod plan;
pub mod rpc;
pub mod source;
pub mod transport;
pub mod types;
pub mod wire;

pub use archive::ArchiveClient;
pub use fields::{apply_masks, normalize, resolve, FieldMasks, FieldSelection};
pub use plan::{
    merge_requests, BatchRequest, BlockRange, DataRequest, LogCriterion, Sighash, TxCriterion,
};
pub use rpc::{parent_mismatch, select_items, HotSource, RpcClient};
pub use source::{FinalizedSource, HeadSource};
pub use types::{
    format_id, format_item_id, BatchResponse, BlockHeader, BlockItem, ClosedRange, FullBlockData,
    Log, LogItem, Transaction,
};
