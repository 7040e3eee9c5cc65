//! Tri-phase lifecycle of index launches: slicing, fraction accounting,
//! fan-in, and result delivery.

mod common;

use std::sync::Arc;

use common::*;
use taskgrid::context::RecordingContext;
use taskgrid::record::Stage;
use taskgrid::region_tree::MockRegionTree;
use taskgrid::test_utils::{engine_on, engine_with_redops, ScriptedMapper};
use taskgrid::types::{FutureValue, IndexDomain, NodeId, ProcId, TaskFuncId};
use taskgrid::{IndexLaunch, TaskDesc};

#[test]
fn index_reduction_runs_the_tri_phase_lifecycle() {
    init_test_logging();
    let mut mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    mapper.slice_parts = 2;
    let engine = engine_with_redops(NodeId(0), mapper, MockRegionTree::new(), sum_registry());
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(7), "stencil", ctx.clone());
    let op = engine
        .launch_index(desc, IndexLaunch::reduction(IndexDomain::d1(0, 7), SUM, false))
        .expect("launch");
    assert_eq!(ctx.outstanding(), 1);

    // One pump slices the domain, enumerates eight points, and maps them
    // all; the index maps once its fraction is whole.
    engine.pump().expect("pump");
    assert_eq!(engine.stage_of(op).expect("stage"), Stage::Mapped);
    assert!(engine.index_fraction(op).expect("fraction").is_whole());
    assert_eq!(engine.index_counters(op), Some((8, 8, 0, 0)));
    assert_eq!(executing_ops(&engine).len(), 8);

    let driven = drive(&engine, |engine, op| {
        let point = engine.point_of(op).expect("point task");
        FutureValue::from_u64(point.coord(0) as u64 + 1)
    });
    assert_eq!(driven, 8);

    // 1 + 2 + ... + 8, delivered exactly once.
    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.as_u64(), Some(36));
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn future_map_delivers_one_future_per_point_in_order() {
    init_test_logging();
    let engine = engine_on(NodeId(0));
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(7), "grid", ctx.clone());
    engine
        .launch_index(desc, IndexLaunch::future_map(IndexDomain::d2((0, 0), (1, 1))))
        .expect("launch");

    drive(&engine, |engine, op| {
        let point = engine.point_of(op).expect("point task");
        FutureValue::from_u64((point.coord(0) * 10 + point.coord(1)) as u64)
    });

    let values: Vec<Option<u64>> = ctx
        .returned_futures()
        .iter()
        .map(|(_, v)| v.as_u64())
        .collect();
    assert_eq!(
        values,
        vec![Some(0), Some(1), Some(10), Some(11)],
        "lexicographic point order"
    );
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn empty_domain_completes_with_the_reduction_identity() {
    init_test_logging();
    let mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    let engine = engine_with_redops(NodeId(0), mapper, MockRegionTree::new(), sum_registry());
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(7), "nothing", ctx.clone());
    engine
        .launch_index(desc, IndexLaunch::reduction(IndexDomain::d1(0, -1), SUM, true))
        .expect("launch");

    engine.pump().expect("pump");
    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.as_u64(), Some(0));
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn empty_domain_future_map_delivers_nothing() {
    init_test_logging();
    let engine = engine_on(NodeId(0));
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(7), "nothing", ctx.clone());
    engine
        .launch_index(desc, IndexLaunch::future_map(IndexDomain::d1(5, 4)))
        .expect("launch");

    engine.pump().expect("pump");
    assert!(ctx.returned_futures().is_empty());
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn individual_launch_returns_its_future() {
    init_test_logging();
    let engine = engine_on(NodeId(0));
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(3), "solo", ctx.clone());
    let op = engine.launch_individual(desc).expect("launch");

    let driven = drive(&engine, |_, _| FutureValue::from_u64(17));
    assert_eq!(driven, 1);
    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.as_u64(), Some(17));
    assert!(!engine.is_live(op));
    assert_eq!(ctx.outstanding(), 0);
}
