//! Deterministic index reductions fold in lexicographic point order no
//! matter which slice reports first.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use proptest::prelude::*;
use taskgrid::context::RecordingContext;
use taskgrid::region_tree::MockRegionTree;
use taskgrid::resource::ResourceTracker;
use taskgrid::test_utils::{engine_with_redops, init_test_logging, ScriptedMapper};
use taskgrid::types::{
    FutureValue, IndexDomain, NodeId, OpId, ProcId, RedopRegistry, ReductionOp, TaskFuncId,
};
use taskgrid::{IndexLaunch, TaskDesc};

/// Byte-concatenating fold. Deliberately non-commutative so arrival order
/// shows up in the aggregate.
#[derive(Debug, Clone, Copy)]
struct Concat;

impl ReductionOp for Concat {
    fn identity(&self) -> FutureValue {
        FutureValue::empty()
    }

    fn fold(&self, acc: &mut FutureValue, rhs: &FutureValue) {
        let mut bytes = acc.bytes().to_vec();
        bytes.extend_from_slice(rhs.bytes());
        *acc = FutureValue::from_bytes(&bytes);
    }
}

fn concat_engine(deterministic: bool) -> (Arc<taskgrid::TaskEngine>, Arc<RecordingContext>) {
    init_test_logging();
    let mut mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    mapper.slice_parts = 2;
    let mut redops = RedopRegistry::new();
    redops.register(SUM, Arc::new(Concat));
    let engine = engine_with_redops(NodeId(0), mapper, MockRegionTree::new(), redops);
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(2), "concat", ctx.clone());
    engine
        .launch_index(
            desc,
            IndexLaunch::reduction(IndexDomain::d1(0, 7), SUM, deterministic),
        )
        .expect("launch");
    (engine, ctx)
}

/// Maps each dispatched point's coordinate to its operation id.
fn points_by_coord(engine: &Arc<taskgrid::TaskEngine>) -> HashMap<i64, OpId> {
    executing_ops(engine)
        .into_iter()
        .map(|op| (engine.point_of(op).expect("point task").coord(0), op))
        .collect()
}

fn complete_in_order(
    engine: &Arc<taskgrid::TaskEngine>,
    points: &HashMap<i64, OpId>,
    order: impl IntoIterator<Item = i64>,
) {
    for coord in order {
        engine
            .complete_execution(
                points[&coord],
                FutureValue::from_bytes(&[coord as u8]),
                ResourceTracker::new(),
            )
            .expect("completion callback failed");
    }
}

#[test]
fn deterministic_fold_runs_in_point_order() {
    let (engine, ctx) = concat_engine(true);
    engine.pump().expect("pump");
    let points = points_by_coord(&engine);

    // The high slice finishes first; the fold must still read 0..=7.
    complete_in_order(&engine, &points, (0..8).rev());
    engine.pump().expect("pump");

    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.bytes(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    assert_quiescent(&engine);
}

#[test]
fn eager_fold_reads_slices_in_arrival_order() {
    let (engine, ctx) = concat_engine(false);
    engine.pump().expect("pump");
    let points = points_by_coord(&engine);

    complete_in_order(&engine, &points, (0..8).rev());
    engine.pump().expect("pump");

    // Slice [4,7] reported first; each slice's own results arrive sorted.
    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.bytes(), &[4, 5, 6, 7, 0, 1, 2, 3]);
    assert_quiescent(&engine);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn deterministic_fold_ignores_completion_order(
        order in Just((0..8i64).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let (engine, ctx) = concat_engine(true);
        engine.pump().expect("pump");
        let points = points_by_coord(&engine);

        complete_in_order(&engine, &points, order);
        engine.pump().expect("pump");

        let futures = ctx.returned_futures();
        prop_assert_eq!(futures.len(), 1);
        prop_assert_eq!(futures[0].1.bytes(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
