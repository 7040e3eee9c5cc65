#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! The engine has no executor of its own: `pump` dispatches ready
//! operations and the embedding driver reports each finished execution
//! through `complete_execution`. The helpers here play that driver.

use std::sync::Arc;

use taskgrid::record::Stage;
use taskgrid::resource::ResourceTracker;
use taskgrid::types::{
    FieldId, FieldSpaceId, FutureValue, IndexSpaceId, LogicalRegion, OpId, RedopId, RedopRegistry,
    SumU64,
};
use taskgrid::TaskEngine;

pub use taskgrid::test_utils::init_test_logging;

/// The one field every integration scenario reads or writes.
pub const FIELD: FieldId = FieldId(1);

/// Stock reduction operator id registered by [`sum_registry`].
pub const SUM: RedopId = RedopId(1);

/// A region in tree 0 over the shared field space.
pub fn region(n: u32) -> LogicalRegion {
    LogicalRegion::new(0, IndexSpaceId(n), FieldSpaceId(1))
}

/// A registry holding [`SumU64`] under [`SUM`].
pub fn sum_registry() -> RedopRegistry {
    let mut redops = RedopRegistry::new();
    redops.register(SUM, Arc::new(SumU64));
    redops
}

/// Live single-execution operations currently dispatched on `engine`.
pub fn executing_ops(engine: &Arc<TaskEngine>) -> Vec<OpId> {
    engine
        .live_ops()
        .into_iter()
        .filter(|(_, kind, stage)| {
            *stage == Stage::Executing && matches!(*kind, "individual" | "point" | "shard")
        })
        .map(|(op, _, _)| op)
        .collect()
}

/// Pumps `engine` and completes every dispatched task through `result_for`
/// until the node quiesces. Returns the number of completions driven.
pub fn drive<F>(engine: &Arc<TaskEngine>, mut result_for: F) -> usize
where
    F: FnMut(&Arc<TaskEngine>, OpId) -> FutureValue,
{
    let mut completed = 0;
    loop {
        engine.pump().expect("engine pump failed");
        let executing = executing_ops(engine);
        if executing.is_empty() {
            return completed;
        }
        for op in executing {
            let value = result_for(engine, op);
            engine
                .complete_execution(op, value, ResourceTracker::new())
                .expect("completion callback failed");
            completed += 1;
        }
    }
}

/// [`drive`] across several nodes: rounds of pump-and-complete over every
/// engine until a full round makes no progress anywhere.
pub fn drive_cluster<F>(engines: &[Arc<TaskEngine>], mut result_for: F)
where
    F: FnMut(&Arc<TaskEngine>, OpId) -> FutureValue,
{
    loop {
        let mut progress = 0;
        for engine in engines {
            progress += engine.pump().expect("engine pump failed");
            for op in executing_ops(engine) {
                let value = result_for(engine, op);
                engine
                    .complete_execution(op, value, ResourceTracker::new())
                    .expect("completion callback failed");
                progress += 1;
            }
        }
        if progress == 0 {
            return;
        }
    }
}

/// Asserts every record on `engine` has committed and been reclaimed.
pub fn assert_quiescent(engine: &Arc<TaskEngine>) {
    let live = engine.live_ops();
    assert!(live.is_empty(), "records still live: {live:?}");
}
