//! Range planner and dispatcher.
//!
//! Drives the merged request plans through two phases: bulk ingestion from
//! the archive up to the finalized boundary, then block-by-block following
//! of the chain head with change tracking and reorg recovery. The handler
//! always runs inside one store transaction per batch, and the committed
//! position advances in that same transaction.

use alloy::primitives::B256;
use eyre::{ensure, eyre, Context, Result};
use sluice_data::fields::FieldMasks;
use sluice_data::plan::{BatchRequest, DataRequest};
use sluice_data::rpc::parent_mismatch;
use sluice_data::source::{FinalizedSource, HeadSource};
use sluice_data::types::{BatchResponse, ClosedRange, FullBlockData};
use sluice_store::{
    commit_position, insert_hot_block, rollback_block, BatchStore, ChangeTracker, Database,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything a handler sees for one batch.
pub struct BatchContext<'a, 't> {
    /// Blocks in ascending height order, items in canonical order.
    pub blocks: &'a [FullBlockData],
    /// True when the batch ends at the current chain head.
    pub is_head: bool,
    /// Row operations bound to this batch's transaction. Mutations on
    /// unfinalized batches are change-tracked automatically.
    pub store: &'a mut BatchStore<'t>,
}

/// User-supplied batch processor. The runner invokes it with at most one
/// batch in flight; a returned error aborts the batch transaction.
pub trait BatchHandler {
    fn process(&mut self, ctx: &mut BatchContext<'_, '_>) -> Result<()>;
}

impl<F> BatchHandler for F
where
    F: FnMut(&mut BatchContext<'_, '_>) -> Result<()>,
{
    fn process(&mut self, ctx: &mut BatchContext<'_, '_>) -> Result<()> {
        self(ctx)
    }
}

pub(crate) struct RunnerSettings {
    pub safety_depth: u64,
    pub poll_interval: Duration,
    pub handler_retries: u32,
    pub shutdown: Option<Arc<AtomicBool>>,
}

pub(crate) async fn run_pipeline<F, S, H>(
    db: &Database,
    plans: Vec<BatchRequest>,
    masks: FieldMasks,
    archive: Option<F>,
    head: Option<S>,
    handler: H,
    settings: RunnerSettings,
) -> Result<()>
where
    F: FinalizedSource + Clone + Send + Sync + 'static,
    S: HeadSource,
    H: BatchHandler,
{
    Runner {
        db,
        plans,
        masks,
        archive,
        head: head.map(Arc::new),
        handler,
        settings,
        last: None,
    }
    .run()
    .await
}

struct Runner<'d, F, S, H> {
    db: &'d Database,
    plans: Vec<BatchRequest>,
    masks: FieldMasks,
    archive: Option<F>,
    head: Option<Arc<S>>,
    handler: H,
    settings: RunnerSettings,
    /// Height and hash of the last committed block.
    last: Option<(u64, B256)>,
}

impl<F, S, H> Runner<'_, F, S, H>
where
    F: FinalizedSource + Clone + Send + Sync + 'static,
    S: HeadSource,
    H: BatchHandler,
{
    fn shutdown_requested(&self) -> bool {
        self.settings
            .shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn next_height(&self) -> u64 {
        match self.last {
            Some((height, _)) => height + 1,
            None => self.plans.first().map_or(0, |plan| plan.range.from),
        }
    }

    async fn run(mut self) -> Result<()> {
        if let Some((height, hash_hex)) = self.db.last_committed()? {
            let hash: B256 = hash_hex
                .parse()
                .wrap_err_with(|| format!("corrupt committed hash {hash_hex:?}"))?;
            self.last = Some((height, hash));
            info!(height, "resuming from committed position");
        }

        if self.plans.is_empty() {
            info!("no blocks requested, nothing to do");
            return Ok(());
        }

        let mut archive_done = self.archive.is_none();
        loop {
            if self.shutdown_requested() {
                info!("termination requested, stopping between batches");
                return Ok(());
            }

            let next = self.next_height();
            let Some(plan) = self
                .plans
                .iter()
                .find(|plan| plan.range.to.map_or(true, |to| next <= to))
                .cloned()
            else {
                info!(
                    height = self.last.map(|(h, _)| h),
                    "reached the end of the configured block range"
                );
                return Ok(());
            };
            let from = next.max(plan.range.from);

            if !archive_done {
                let archive = self.archive.clone().expect("archive phase without archive");
                let archive_height = archive.finalized_height().await?;
                let finalized_tip = archive_height.saturating_sub(self.settings.safety_depth);
                if from > finalized_tip {
                    if self.head.is_some() {
                        info!(archive_height, "archive exhausted, following the chain head");
                        archive_done = true;
                    } else {
                        // Archive-only setup: wait for the archive to grow.
                        tokio::time::sleep(self.settings.poll_interval).await;
                    }
                    continue;
                }
                let to = plan.range.to.map_or(finalized_tip, |t| t.min(finalized_tip));
                self.run_archive_span(&archive, &plan.request, from, to)
                    .await?;
                continue;
            }

            let head = self
                .head
                .clone()
                .ok_or_else(|| eyre!("a chain RPC source is required to reach unfinalized blocks"))?;
            self.step_hot(&head, &plan.request, from).await?;
        }
    }

    /// Ingests `[from, to]` from the archive, prefetching each next batch
    /// while the current one is in the handler. That overlap is the only
    /// concurrency on the hot path.
    async fn run_archive_span(
        &mut self,
        archive: &F,
        request: &DataRequest,
        mut from: u64,
        to: u64,
    ) -> Result<()> {
        let mut pending: Option<tokio::task::JoinHandle<Result<BatchResponse>>> = None;
        while from <= to {
            if self.shutdown_requested() {
                break;
            }
            let batch = match pending.take() {
                Some(handle) => handle
                    .await
                    .map_err(|e| eyre!("archive prefetch task failed: {e}"))??,
                None => {
                    archive
                        .finalized_batch(from, Some(to), request, &self.masks)
                        .await?
                }
            };
            ensure!(
                batch.range.from == from && batch.range.to >= from && batch.range.to <= to,
                "archive batch {}..{} does not line up with requested {from}..{to}",
                batch.range.from,
                batch.range.to,
            );

            let resume = batch.range.to + 1;
            if resume <= to {
                let archive = archive.clone();
                let request = request.clone();
                let masks = self.masks.clone();
                pending = Some(tokio::task::spawn(async move {
                    archive
                        .finalized_batch(resume, Some(to), &request, &masks)
                        .await
                }));
            }

            let applied = self
                .apply_batch(&batch, false)
                .and_then(|()| self.db.finalize_up_to(batch.range.to).map(|_| ()));
            if let Err(error) = applied {
                if let Some(handle) = pending.take() {
                    handle.abort();
                }
                return Err(error);
            }
            from = resume;
        }
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        Ok(())
    }

    /// Advances the head by one block, or resolves a detected fork.
    async fn step_hot(&mut self, head: &Arc<S>, request: &DataRequest, from: u64) -> Result<()> {
        let chain_height = head.chain_height().await?;
        if from > chain_height {
            tokio::time::sleep(self.settings.poll_interval).await;
            return Ok(());
        }
        let Some(block) = head.block(from, request, &self.masks).await? else {
            tokio::time::sleep(self.settings.poll_interval).await;
            return Ok(());
        };
        ensure!(
            block.header.height == from,
            "chain returned block {} for height {from}",
            block.header.height
        );

        if let Some((committed, committed_hash)) = self.last {
            if from == committed + 1 && parent_mismatch(&committed_hash, &block.header) {
                warn!(
                    height = from,
                    parent = %block.header.parent_hash,
                    "parent hash mismatch, resolving chain reorganization"
                );
                return self.resolve_reorg(head).await;
            }
        }

        let batch = BatchResponse {
            range: ClosedRange { from, to: from },
            blocks: vec![block],
            chain_height,
        };
        self.apply_batch(&batch, true)?;

        // Blocks that sank below the safety depth are final: purge their
        // change records in bulk.
        self.db
            .finalize_up_to(chain_height.saturating_sub(self.settings.safety_depth))?;
        Ok(())
    }

    /// Walks the hot-block table from the top, undoing each block the chain
    /// no longer contains, until a stored hash matches the canonical chain.
    /// Each undo steps the committed position down in the same transaction.
    async fn resolve_reorg(&mut self, head: &Arc<S>) -> Result<()> {
        let hot_blocks = self.db.hot_blocks_desc()?;
        ensure!(
            !hot_blocks.is_empty(),
            "fork detected below the finalized boundary; store is corrupt"
        );

        let parse = |hex: &str| -> Result<B256> {
            hex.parse()
                .wrap_err_with(|| format!("corrupt hot block hash {hex:?}"))
        };

        for (position, (height, stored_hex)) in hot_blocks.iter().enumerate() {
            let stored = parse(stored_hex)?;
            if head.block_hash(*height).await? == Some(stored) {
                self.last = Some((*height, stored));
                info!(height, "reorg resolved, resuming from surviving ancestor");
                return Ok(());
            }

            let resume_at = match hot_blocks.get(position + 1) {
                Some((parent_height, parent_hex)) => (*parent_height, parse(parent_hex)?),
                None => {
                    // Deepest unfinalized block: everything below it is
                    // final, so the chain's view there is authoritative.
                    let base = height
                        .checked_sub(1)
                        .ok_or_else(|| eyre!("cannot roll back below height 0"))?;
                    let hash = head.block_hash(base).await?.ok_or_else(|| {
                        eyre!("chain has no block at finalized height {base}")
                    })?;
                    (base, hash)
                }
            };

            let schema = self.db.schema().to_string();
            self.db.with_transaction(|tx| {
                rollback_block(tx, &schema, *height)?;
                commit_position(tx, &schema, resume_at.0, &format!("{:#x}", resume_at.1))
            })?;
            self.last = Some(resume_at);
        }

        warn!("reorg invalidated every unfinalized block, resuming from the finalized boundary");
        Ok(())
    }

    /// Validates, processes, and commits one batch atomically. Handler
    /// failures retry per configuration before becoming fatal.
    fn apply_batch(&mut self, batch: &BatchResponse, hot: bool) -> Result<()> {
        ensure!(
            !batch.blocks.is_empty(),
            "batch {}..{} carries no blocks",
            batch.range.from,
            batch.range.to
        );
        if hot {
            // The change tracker scopes records to a single block height.
            ensure!(
                batch.blocks.len() == 1,
                "unfinalized batches must carry exactly one block"
            );
        }
        let mut previous = self.last.map(|(height, _)| height);
        for block in &batch.blocks {
            let height = block.header.height;
            ensure!(
                previous.map_or(true, |p| height > p),
                "delivery would regress or repeat height {height} (last {previous:?})"
            );
            ensure!(
                height >= batch.range.from && height <= batch.range.to,
                "block {height} outside batch range {}..{}",
                batch.range.from,
                batch.range.to
            );
            ensure!(
                block.items_are_ordered(),
                "items out of order in block {height}"
            );
            previous = Some(height);
        }
        let tip = batch.blocks.last().expect("batch is non-empty");
        ensure!(
            tip.header.height == batch.range.to,
            "batch does not close its range: last block {} vs range end {}",
            tip.header.height,
            batch.range.to
        );

        let is_head = batch.range.to == batch.chain_height;
        let tip_hash = tip.header.hash;
        let tip_hash_hex = format!("{tip_hash:#x}");
        let db = self.db;
        let schema = db.schema().to_string();
        let handler = &mut self.handler;

        let mut attempt: u32 = 0;
        loop {
            let span = tracing::info_span!(
                "batch",
                from = batch.range.from,
                to = batch.range.to,
                hot
            );
            let _guard = span.enter();
            let outcome = db.with_transaction(|tx| {
                let tracker = hot.then(|| ChangeTracker::new(batch.range.to));
                let mut store = BatchStore::new(tx, schema.as_str(), tracker);
                let mut ctx = BatchContext {
                    blocks: &batch.blocks,
                    is_head,
                    store: &mut store,
                };
                handler.process(&mut ctx)?;
                commit_position(tx, &schema, batch.range.to, &tip_hash_hex)?;
                if hot {
                    insert_hot_block(tx, &schema, batch.range.to, &tip_hash_hex)?;
                }
                Ok(())
            });
            match outcome {
                Ok(()) => break,
                Err(error) if attempt < self.settings.handler_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        error = %error,
                        "batch failed, transaction rolled back, retrying"
                    );
                }
                Err(error) => {
                    return Err(error.wrap_err(format!(
                        "batch {}..{} failed",
                        batch.range.from, batch.range.to
                    )));
                }
            }
        }

        self.last = Some((batch.range.to, tip_hash));
        info!(
            height = batch.range.to,
            blocks = batch.blocks.len(),
            chain_height = batch.chain_height,
            is_head,
            "committed batch"
        );
        Ok(())
    }
}
