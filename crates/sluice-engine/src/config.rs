//! Pipeline configuration surface.
//!
//! A [`Pipeline`] collects the user's filters, field selection, and data
//! sources, then plans and drives the run. Addresses, topics, and selectors
//! are typed alloy primitives, so user input is normalized to lowercase hex
//! at the parse boundary before anything reaches an upstream.

use crate::runner::{run_pipeline, BatchHandler, RunnerSettings};
use alloy::primitives::{Address, B256};
use eyre::{ensure, eyre, Context, Result};
use sluice_data::plan::{BatchRequest, BlockRange, DataRequest, LogCriterion, Sighash, TxCriterion};
use sluice_data::source::{FinalizedSource, HeadSource};
use sluice_data::transport::RetryPolicy;
use sluice_data::{fields, ArchiveClient, FieldSelection, HotSource, RpcClient};
use sluice_store::Database;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_SAFETY_DEPTH: u64 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_HANDLER_RETRIES: u32 = 1;
const DEFAULT_RPC_CAPACITY: usize = 10;

/// Upstream endpoints. At least one of the two is required.
#[derive(Debug, Clone, Default)]
pub struct DataSourceSettings {
    /// Archive service base URL.
    pub archive: Option<String>,
    /// Node JSON-RPC URL.
    pub chain: Option<String>,
}

/// One log subscription.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub address: Vec<Address>,
    /// Positional topic filter: `filter[i]` constrains topic i.
    pub filter: Vec<Vec<B256>>,
    pub range: Option<BlockRange>,
}

/// One transaction subscription.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub to: Vec<Address>,
    pub from: Vec<Address>,
    pub sighash: Vec<Sighash>,
    pub range: Option<BlockRange>,
}

/// Builder for one indexing run.
pub struct Pipeline {
    fields: FieldSelection,
    requests: Vec<BatchRequest>,
    block_range: Option<BlockRange>,
    data_source: Option<DataSourceSettings>,
    prometheus_port: Option<u16>,
    retry: RetryPolicy,
    safety_depth: u64,
    poll_interval: Duration,
    handler_retries: u32,
    rpc_capacity: usize,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            fields: FieldSelection::default(),
            requests: Vec::new(),
            block_range: None,
            data_source: None,
            prometheus_port: None,
            retry: RetryPolicy::default(),
            safety_depth: DEFAULT_SAFETY_DEPTH,
            poll_interval: DEFAULT_POLL_INTERVAL,
            handler_retries: DEFAULT_HANDLER_RETRIES,
            rpc_capacity: DEFAULT_RPC_CAPACITY,
            shutdown: None,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processor-wide field projection, applied to every merged request.
    pub fn set_fields(mut self, fields: FieldSelection) -> Self {
        self.fields = fields;
        self
    }

    pub fn add_log(mut self, options: LogOptions) -> Self {
        self.requests.push(BatchRequest {
            range: options.range.unwrap_or_else(BlockRange::all),
            request: DataRequest {
                logs: vec![LogCriterion {
                    address: options.address,
                    topics: options.filter,
                }],
                ..Default::default()
            },
        });
        self
    }

    pub fn add_transaction(mut self, options: TxOptions) -> Self {
        self.requests.push(BatchRequest {
            range: options.range.unwrap_or_else(BlockRange::all),
            request: DataRequest {
                transactions: vec![TxCriterion {
                    to: options.to,
                    from: options.from,
                    sighash: options.sighash,
                }],
                ..Default::default()
            },
        });
        self
    }

    /// Forces non-matching blocks into the delivered batches for `range`
    /// (the whole chain when `None`).
    pub fn include_all_blocks(mut self, range: Option<BlockRange>) -> Self {
        self.requests.push(BatchRequest {
            range: range.unwrap_or_else(BlockRange::all),
            request: DataRequest {
                include_all_blocks: true,
                ..Default::default()
            },
        });
        self
    }

    /// Global clamp. A closed upper bound makes the run exit gracefully once
    /// reached; an empty range (`from > to`) exits without doing anything.
    pub fn set_block_range(mut self, range: Option<BlockRange>) -> Self {
        self.block_range = range;
        self
    }

    pub fn set_data_source(mut self, source: DataSourceSettings) -> Self {
        self.data_source = Some(source);
        self
    }

    /// Port for the metrics exporter. The exporter itself lives outside the
    /// pipeline; the port is recorded and reported at startup.
    pub fn set_prometheus_port(mut self, port: u16) -> Self {
        self.prometheus_port = Some(port);
        self
    }

    /// Blocks below `archive height - depth` are treated as finalized.
    pub fn set_safety_depth(mut self, depth: u64) -> Self {
        self.safety_depth = depth;
        self
    }

    pub fn set_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How many times a failed handler batch is retried before the run
    /// fails.
    pub fn set_handler_retries(mut self, retries: u32) -> Self {
        self.handler_retries = retries;
        self
    }

    /// Concurrent request cap for the node RPC client.
    pub fn set_rpc_capacity(mut self, capacity: usize) -> Self {
        self.rpc_capacity = capacity;
        self
    }

    /// Transport retry budget (unbounded by default).
    pub fn set_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Termination flag, observed between batches.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Runs against the configured data sources.
    ///
    /// # Errors
    /// Returns error on invalid configuration or any fatal pipeline error;
    /// reaching a closed block range is success.
    pub async fn run<H: BatchHandler>(self, db: &Database, handler: H) -> Result<()> {
        let source = self
            .data_source
            .clone()
            .ok_or_else(|| eyre!("set_data_source was not called"))?;
        ensure!(
            source.archive.is_some() || source.chain.is_some(),
            "set_data_source requires at least one of archive or chain"
        );
        // Sources are constructed lazily here, not at configuration time.
        let archive = source
            .archive
            .as_deref()
            .map(|url| Ok::<_, eyre::Report>(ArchiveClient::new(url)?.with_retry(self.retry)))
            .transpose()
            .wrap_err("failed to set up archive source")?;
        let head = source
            .chain
            .as_deref()
            .map(|url| {
                Ok::<_, eyre::Report>(HotSource::new(
                    RpcClient::new(url)?
                        .with_capacity(self.rpc_capacity)
                        .with_retry(self.retry),
                ))
            })
            .transpose()
            .wrap_err("failed to set up chain RPC source")?;
        self.run_with_sources(db, handler, archive, head).await
    }

    /// Runs against caller-supplied sources; the seam tests use to inject
    /// scripted chains.
    pub async fn run_with_sources<F, S, H>(
        self,
        db: &Database,
        handler: H,
        archive: Option<F>,
        head: Option<S>,
    ) -> Result<()>
    where
        F: FinalizedSource + Clone + Send + Sync + 'static,
        S: HeadSource,
        H: BatchHandler,
    {
        ensure!(
            archive.is_some() || head.is_some(),
            "at least one data source is required"
        );
        if let Some(port) = self.prometheus_port {
            tracing::info!(port, "prometheus metrics port configured");
        }
        let masks = fields::resolve(&self.fields);
        let plans = sluice_data::merge_requests(self.requests, self.block_range.as_ref());
        let settings = RunnerSettings {
            safety_depth: self.safety_depth,
            poll_interval: self.poll_interval,
            handler_retries: self.handler_retries,
            shutdown: self.shutdown,
        };
        run_pipeline(db, plans, masks, archive, head, handler, settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_become_range_bounded_requests() {
        let pipeline = Pipeline::new()
            .add_log(LogOptions {
                address: vec![Address::repeat_byte(0xaa)],
                range: Some(BlockRange::new(5, Some(10))),
                ..Default::default()
            })
            .add_transaction(TxOptions {
                sighash: vec!["0xA9059CBB".parse().expect("valid selector")],
                ..Default::default()
            })
            .include_all_blocks(None);

        assert_eq!(pipeline.requests.len(), 3);
        assert_eq!(pipeline.requests[0].range, BlockRange::new(5, Some(10)));
        assert_eq!(
            pipeline.requests[1].request.transactions[0].sighash[0].to_string(),
            "0xa9059cbb"
        );
        assert!(pipeline.requests[2].request.include_all_blocks);
    }
}
