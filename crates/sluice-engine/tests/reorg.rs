//! Reorg recovery: rollback of invalidated hot blocks and convergence on
//! the new canonical branch.

mod common;

use common::{
    entry_ids, forked_chain, hash_for, linear_chain, test_db, FakeArchive, FakeChain,
    RecordingHandler,
};
use sluice_data::plan::BlockRange;
use sluice_data::types::format_id;
use sluice_engine::Pipeline;
use std::time::Duration;

fn hot_only(range: BlockRange) -> Pipeline {
    Pipeline::new()
        .include_all_blocks(None)
        .set_block_range(Some(range))
        .set_poll_interval(Duration::from_millis(1))
        .set_safety_depth(10)
}

fn id_for(height: u64, fork: u8) -> String {
    format_id(height, &hash_for(height, fork))
}

#[tokio::test]
async fn fork_at_the_tip_rolls_back_one_block_and_converges() {
    let db = test_db();
    let handler = RecordingHandler::new(true);

    // The chain serves 10 and 11 on the original branch; when the pipeline
    // asks for 12 the canonical chain flips to a branch that replaced 11.
    let chain = FakeChain::new(linear_chain(11)).flip_at(12, forked_chain(10, 1, 12));

    hot_only(BlockRange::new(10, Some(12)))
        .run_with_sources(&db, handler.clone(), Option::<FakeArchive>::None, Some(chain))
        .await
        .expect("closed range completes after the reorg");

    // Height 11 was delivered twice: once on each branch.
    assert_eq!(handler.recorded(), vec![10, 11, 11, 12]);

    // The store only reflects the canonical branch: the replaced block's
    // writes were undone by the rollback.
    assert_eq!(
        entry_ids(&db),
        vec![id_for(10, 0), id_for(11, 1), id_for(12, 1)]
    );
    assert_eq!(
        db.last_committed().unwrap(),
        Some((12, format!("{:#x}", hash_for(12, 1))))
    );

    // All three canonical blocks are still within the safety depth.
    let hot: Vec<u64> = db
        .hot_blocks_desc()
        .unwrap()
        .into_iter()
        .map(|(height, _)| height)
        .collect();
    assert_eq!(hot, vec![12, 11, 10]);
}

#[tokio::test]
async fn deep_fork_rolls_back_every_hot_block_and_resumes_from_the_base() {
    let db = test_db();
    let handler = RecordingHandler::new(true);

    // Both processed hot blocks (10 and 11) are replaced; the fork point is
    // at the finalized base below the hot region.
    let chain = FakeChain::new(linear_chain(11)).flip_at(12, forked_chain(9, 2, 12));

    hot_only(BlockRange::new(10, Some(12)))
        .run_with_sources(&db, handler.clone(), Option::<FakeArchive>::None, Some(chain))
        .await
        .expect("closed range completes after the deep reorg");

    assert_eq!(handler.recorded(), vec![10, 11, 10, 11, 12]);
    assert_eq!(
        entry_ids(&db),
        vec![id_for(10, 2), id_for(11, 2), id_for(12, 2)]
    );
    assert_eq!(
        db.last_committed().unwrap(),
        Some((12, format!("{:#x}", hash_for(12, 2))))
    );
    assert!(db.change_log_len().unwrap() > 0);
}
