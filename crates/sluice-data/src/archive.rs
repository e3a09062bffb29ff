//! Finalized-range source: a paginated HTTP client for the archive service.
//!
//! The archive answers `POST /query` with as many consecutive blocks as it
//! chooses (`nextBlock` marks where it stopped) and `GET /height` with its
//! indexed head. Responses are mapped into canonical batches; a missing
//! trailing block is closed out with a header-only follow-up query so every
//! batch ends exactly at its reported range end.

use crate::fields::FieldMasks;
use crate::mapper::map_block_data;
use crate::plan::{DataRequest, LogCriterion, TxCriterion};
use crate::source::FinalizedSource;
use crate::transport::{
    classify_request_error, classify_status, with_backoff, Attempt, RetryPolicy, HTTP_TIMEOUT,
};
use crate::types::{BatchResponse, ClosedRange, FullBlockData};
use crate::wire::{ArchiveResponse, HeightResponse};
use async_trait::async_trait;
use eyre::{ensure, eyre, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-entity projection attached to archive sub-queries, serialized as
/// `{field: true}` maps.
#[derive(Debug, Clone, Default, Serialize)]
struct WireFieldSelection {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    block: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    transaction: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    log: BTreeMap<String, bool>,
}

fn mask_map(mask: &std::collections::BTreeSet<String>) -> BTreeMap<String, bool> {
    mask.iter().map(|field| (field.clone(), true)).collect()
}

#[derive(Debug, Clone, Serialize)]
struct TxSubQuery {
    #[serde(flatten)]
    criterion: TxCriterion,
    #[serde(rename = "fieldSelection")]
    field_selection: WireFieldSelection,
}

#[derive(Debug, Clone, Serialize)]
struct LogSubQuery {
    #[serde(flatten)]
    criterion: LogCriterion,
    #[serde(rename = "fieldSelection")]
    field_selection: WireFieldSelection,
}

/// `POST /query` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveQuery {
    from_block: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_block: Option<u64>,
    include_all_blocks: bool,
    /// Block projection for rows matched only by `include_all_blocks`.
    #[serde(skip_serializing_if = "Option::is_none")]
    field_selection: Option<WireFieldSelection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transactions: Vec<TxSubQuery>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    logs: Vec<LogSubQuery>,
}

fn build_query(
    from: u64,
    to: Option<u64>,
    request: &DataRequest,
    masks: &FieldMasks,
) -> ArchiveQuery {
    let block_selection = WireFieldSelection {
        block: mask_map(&masks.block),
        ..Default::default()
    };
    let tx_selection = WireFieldSelection {
        block: mask_map(&masks.block),
        transaction: mask_map(&masks.transaction),
        ..Default::default()
    };
    // The transaction projection rides along on log sub-queries only when
    // the log-to-transaction join was requested.
    let log_selection = WireFieldSelection {
        block: mask_map(&masks.block),
        log: mask_map(&masks.log),
        transaction: if masks.log_transaction {
            mask_map(&masks.transaction)
        } else {
            BTreeMap::new()
        },
    };

    ArchiveQuery {
        from_block: from,
        to_block: to,
        include_all_blocks: request.include_all_blocks,
        field_selection: request.include_all_blocks.then_some(block_selection),
        transactions: request
            .transactions
            .iter()
            .map(|criterion| TxSubQuery {
                criterion: criterion.clone(),
                field_selection: tx_selection.clone(),
            })
            .collect(),
        logs: request
            .logs
            .iter()
            .map(|criterion| LogSubQuery {
                criterion: criterion.clone(),
                field_selection: log_selection.clone(),
            })
            .collect(),
    }
}

/// A header-only query for one height, used to close out a batch whose
/// trailing block carried no matching data.
fn header_query(height: u64, masks: &FieldMasks) -> ArchiveQuery {
    ArchiveQuery {
        from_block: height,
        to_block: Some(height),
        include_all_blocks: true,
        field_selection: Some(WireFieldSelection {
            block: mask_map(&masks.block),
            ..Default::default()
        }),
        transactions: Vec::new(),
        logs: Vec::new(),
    }
}

/// HTTP client for the archive service.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl ArchiveClient {
    /// # Errors
    /// Returns error if the underlying HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .wrap_err("failed to build archive HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        with_backoff(path, &self.retry, || async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| classify_request_error(e, path))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, body, path));
            }
            response
                .json::<R>()
                .await
                .map_err(|e| Attempt::Fatal(eyre!("{path}: malformed response: {e}")))
        })
        .await
    }

    async fn post_query(&self, query: &ArchiveQuery) -> Result<ArchiveResponse> {
        let url = format!("{}/query", self.base_url);
        with_backoff("archive query", &self.retry, || async {
            let response = self
                .client
                .post(&url)
                .json(query)
                .send()
                .await
                .map_err(|e| classify_request_error(e, "archive query"))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, body, "archive query"));
            }
            response
                .json::<ArchiveResponse>()
                .await
                .map_err(|e| Attempt::Fatal(eyre!("archive query: malformed response: {e}")))
        })
        .await
        .wrap_err_with(|| format!("archive query from block {}", query.from_block))
    }

    fn map_response(&self, from: u64, response: &ArchiveResponse) -> Result<Vec<FullBlockData>> {
        let mut blocks = response
            .data
            .iter()
            .flatten()
            .map(map_block_data)
            .collect::<Result<Vec<_>>>()?;
        blocks.sort_by_key(|block| block.header.height);
        if let Some(first) = blocks.first() {
            ensure!(
                first.header.height >= from,
                "archive returned block {} below requested start {from}",
                first.header.height
            );
        }
        Ok(blocks)
    }
}

#[async_trait]
impl FinalizedSource for ArchiveClient {
    #[tracing::instrument(skip_all)]
    async fn finalized_height(&self) -> Result<u64> {
        let response: HeightResponse = self.get_json("/height").await?;
        Ok(response.height)
    }

    #[tracing::instrument(skip_all, fields(from, to))]
    async fn finalized_batch(
        &self,
        from: u64,
        to: Option<u64>,
        request: &DataRequest,
        masks: &FieldMasks,
    ) -> Result<BatchResponse> {
        let query = build_query(from, to, request, masks);
        let response = self.post_query(&query).await?;

        ensure!(
            response.next_block > from,
            "archive made no progress: nextBlock {} <= fromBlock {from}",
            response.next_block
        );
        let range_to = response.next_block - 1;
        let mut blocks = self.map_response(from, &response)?;

        // The archive reports where it stopped, not what it returned: when
        // no block at `range_to` matched the filters, fetch its bare header
        // so the batch still closes at the promised height.
        if blocks.last().map(|b| b.header.height) != Some(range_to) {
            let closing = self.post_query(&header_query(range_to, masks)).await?;
            let header_block = self
                .map_response(range_to, &closing)?
                .into_iter()
                .find(|block| block.header.height == range_to)
                .ok_or_else(|| {
                    eyre!("archive returned no header for trailing block {range_to}")
                })?;
            blocks.push(FullBlockData {
                header: header_block.header,
                items: Vec::new(),
            });
        }

        tracing::debug!(
            from,
            to = range_to,
            blocks = blocks.len(),
            archive_height = response.archive_height,
            "archive batch mapped"
        );

        Ok(BatchResponse {
            range: ClosedRange { from, to: range_to },
            blocks,
            chain_height: response.archive_height,
        })
    }
}
