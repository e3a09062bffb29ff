//! Shared fakes and helpers for pipeline tests: a scripted archive, a
//! scripted chain that can fork mid-run, and a recording handler.

#![allow(dead_code)]

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;
use sluice_data::fields::FieldMasks;
use sluice_data::plan::DataRequest;
use sluice_data::source::{FinalizedSource, HeadSource};
use sluice_data::types::{BatchResponse, BlockHeader, ClosedRange, FullBlockData};
use sluice_engine::{BatchContext, BatchHandler};
use sluice_store::{Database, Row};
use std::sync::{Arc, Mutex};

/// In-memory store with the handler's `entries` table in place.
pub fn test_db() -> Database {
    let db = Database::new(":memory:", "sluice").expect("in-memory store should always open");
    db.execute_batch("CREATE TABLE IF NOT EXISTS entries (id TEXT PRIMARY KEY, height INTEGER);")
        .expect("entries migration");
    db
}

/// Deterministic block hash: the fork tag leads so id prefixes differ across
/// branches, the height follows so hashes differ across heights.
pub fn hash_for(height: u64, fork: u8) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = fork;
    bytes[1..9].copy_from_slice(&height.to_be_bytes());
    B256::from(bytes)
}

pub fn header(height: u64, fork: u8, parent: B256) -> BlockHeader {
    BlockHeader {
        height,
        hash: hash_for(height, fork),
        parent_hash: parent,
        timestamp: 1_700_000_000 + height * 12,
        ..Default::default()
    }
}

fn linear_header(height: u64, fork: u8) -> BlockHeader {
    let parent = if height == 0 {
        B256::ZERO
    } else {
        hash_for(height - 1, fork)
    };
    header(height, fork, parent)
}

#[derive(Debug, Clone, Copy)]
pub struct ChainBlock {
    pub height: u64,
    pub hash: B256,
    pub parent: B256,
}

/// Canonical chain `0..=to` on fork 0.
pub fn linear_chain(to: u64) -> Vec<ChainBlock> {
    (0..=to)
        .map(|height| {
            let h = linear_header(height, 0);
            ChainBlock {
                height,
                hash: h.hash,
                parent: h.parent_hash,
            }
        })
        .collect()
}

/// Chain that follows fork 0 through `common_to`, then continues on `fork`
/// up to `to`.
pub fn forked_chain(common_to: u64, fork: u8, to: u64) -> Vec<ChainBlock> {
    let mut blocks = linear_chain(common_to);
    let mut parent = hash_for(common_to, 0);
    for height in common_to + 1..=to {
        let hash = hash_for(height, fork);
        blocks.push(ChainBlock {
            height,
            hash,
            parent,
        });
        parent = hash;
    }
    blocks
}

/// Finalized source serving the fork-0 chain in fixed-size chunks.
#[derive(Clone)]
pub struct FakeArchive {
    pub height: u64,
    pub chunk: u64,
}

#[async_trait]
impl FinalizedSource for FakeArchive {
    async fn finalized_height(&self) -> Result<u64> {
        Ok(self.height)
    }

    async fn finalized_batch(
        &self,
        from: u64,
        to: Option<u64>,
        _request: &DataRequest,
        _masks: &FieldMasks,
    ) -> Result<BatchResponse> {
        let to = to.unwrap_or(self.height).min(self.height);
        let span_to = to.min(from + self.chunk - 1);
        let blocks = (from..=span_to)
            .map(|height| FullBlockData {
                header: linear_header(height, 0),
                items: Vec::new(),
            })
            .collect();
        Ok(BatchResponse {
            range: ClosedRange { from, to: span_to },
            blocks,
            chain_height: self.height,
        })
    }
}

/// Head source over a scripted chain. An optional flip swaps in a new
/// canonical chain once the block just below the trigger height has been
/// served, simulating a reorg landing between two polls.
#[derive(Clone)]
pub struct FakeChain {
    blocks: Arc<Mutex<Vec<ChainBlock>>>,
    flip: Arc<Mutex<Option<(u64, Vec<ChainBlock>)>>>,
}

impl FakeChain {
    pub fn new(blocks: Vec<ChainBlock>) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(blocks)),
            flip: Arc::new(Mutex::new(None)),
        }
    }

    /// After the block at `trigger - 1` is served, the canonical chain
    /// becomes `new_chain`.
    pub fn flip_at(self, trigger: u64, new_chain: Vec<ChainBlock>) -> Self {
        *self.flip.lock().unwrap() = Some((trigger, new_chain));
        self
    }

    fn maybe_flip(&self, served: u64) {
        let mut flip = self.flip.lock().unwrap();
        let triggered = matches!(flip.as_ref(), Some((trigger, _)) if served + 1 == *trigger);
        if triggered {
            let (_, new_chain) = flip.take().expect("flip present");
            *self.blocks.lock().unwrap() = new_chain;
        }
    }

    fn lookup(&self, height: u64) -> Option<ChainBlock> {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .find(|block| block.height == height)
            .copied()
    }
}

#[async_trait]
impl HeadSource for FakeChain {
    async fn chain_height(&self) -> Result<u64> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .last()
            .map(|block| block.height)
            .unwrap_or(0))
    }

    async fn block_hash(&self, height: u64) -> Result<Option<B256>> {
        Ok(self.lookup(height).map(|block| block.hash))
    }

    async fn block(
        &self,
        height: u64,
        _request: &DataRequest,
        _masks: &FieldMasks,
    ) -> Result<Option<FullBlockData>> {
        let found = self.lookup(height);
        if found.is_some() {
            self.maybe_flip(height);
        }
        Ok(found.map(|block| FullBlockData {
            header: BlockHeader {
                height,
                hash: block.hash,
                parent_hash: block.parent,
                timestamp: 1_700_000_000 + height * 12,
                ..Default::default()
            },
            items: Vec::new(),
        }))
    }
}

/// Handler that records delivered heights and persists one row per block
/// through the tracked store interface.
#[derive(Clone)]
pub struct RecordingHandler {
    pub heights: Arc<Mutex<Vec<u64>>>,
    pub saw_head: Arc<Mutex<bool>>,
    pub write_rows: bool,
}

impl RecordingHandler {
    pub fn new(write_rows: bool) -> Self {
        Self {
            heights: Arc::new(Mutex::new(Vec::new())),
            saw_head: Arc::new(Mutex::new(false)),
            write_rows,
        }
    }

    pub fn recorded(&self) -> Vec<u64> {
        self.heights.lock().unwrap().clone()
    }
}

impl BatchHandler for RecordingHandler {
    fn process(&mut self, ctx: &mut BatchContext<'_, '_>) -> Result<()> {
        if ctx.is_head {
            *self.saw_head.lock().unwrap() = true;
        }
        for block in ctx.blocks {
            self.heights.lock().unwrap().push(block.header.height);
            if self.write_rows {
                ctx.store.insert(
                    "entries",
                    &[Row::new(block.header.id())
                        .set("height", serde_json::json!(block.header.height))],
                )?;
            }
        }
        Ok(())
    }
}

/// All ids currently in the handler's `entries` table, sorted.
pub fn entry_ids(db: &Database) -> Vec<String> {
    db.with_transaction(|tx| {
        let mut stmt = tx.prepare("SELECT id FROM entries ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    })
    .expect("entries query")
}
