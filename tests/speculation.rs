//! Predicated launches: parking, speculative execution, and false-predicate
//! default substitution.

mod common;

use std::sync::Arc;

use common::*;
use taskgrid::context::RecordingContext;
use taskgrid::mapper::SpeculationOutput;
use taskgrid::record::Stage;
use taskgrid::region_tree::MockRegionTree;
use taskgrid::test_utils::{engine_on, engine_with, engine_with_redops, ScriptedMapper};
use taskgrid::types::{FutureValue, IndexDomain, NodeId, ProcId, TaskFuncId};
use taskgrid::{IndexLaunch, TaskDesc};

fn predicated_desc(ctx: Arc<RecordingContext>) -> TaskDesc {
    TaskDesc::new(TaskFuncId(4), "maybe", ctx).with_predicate(FutureValue::from_u64(99))
}

#[test]
fn unresolved_predicate_parks_until_resolved_true() {
    init_test_logging();
    let engine = engine_on(NodeId(0));
    let ctx = Arc::new(RecordingContext::new());
    let op = engine
        .launch_individual(predicated_desc(ctx.clone()))
        .expect("launch");

    engine.pump().expect("pump");
    assert!(executing_ops(&engine).is_empty(), "parked, not dispatched");
    assert_eq!(engine.stage_of(op).expect("stage"), Stage::Ready);

    engine.resolve_predicate(op, true).expect("resolve");
    let driven = drive(&engine, |_, _| FutureValue::from_u64(5));
    assert_eq!(driven, 1);
    assert_eq!(ctx.returned_futures()[0].1.as_u64(), Some(5));
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn false_predicate_substitutes_the_default_without_dispatch() {
    init_test_logging();
    let engine = engine_on(NodeId(0));
    let ctx = Arc::new(RecordingContext::new());
    let op = engine
        .launch_individual(predicated_desc(ctx.clone()))
        .expect("launch");

    engine.pump().expect("pump");
    engine.resolve_predicate(op, false).expect("resolve");

    assert_eq!(drive(&engine, |_, _| FutureValue::empty()), 0);
    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.as_u64(), Some(99));
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn speculated_true_discards_the_real_result_on_a_false_outcome() {
    init_test_logging();
    let mut mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    mapper.speculation = SpeculationOutput {
        speculate: true,
        predicted_value: true,
    };
    let engine = engine_with(NodeId(0), mapper, MockRegionTree::new());
    let ctx = Arc::new(RecordingContext::new());
    let op = engine
        .launch_individual(predicated_desc(ctx.clone()))
        .expect("launch");

    // Ran ahead of the predicate.
    engine.pump().expect("pump");
    assert_eq!(executing_ops(&engine), vec![op]);

    engine.resolve_predicate(op, false).expect("resolve");
    drive(&engine, |_, _| FutureValue::from_u64(5));

    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.as_u64(), Some(99), "default replaces the speculated result");
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}

#[test]
fn speculated_true_confirmed_keeps_the_real_result() {
    init_test_logging();
    let mut mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    mapper.speculation = SpeculationOutput {
        speculate: true,
        predicted_value: true,
    };
    let engine = engine_with(NodeId(0), mapper, MockRegionTree::new());
    let ctx = Arc::new(RecordingContext::new());
    let op = engine
        .launch_individual(predicated_desc(ctx.clone()))
        .expect("launch");

    engine.pump().expect("pump");
    engine.resolve_predicate(op, true).expect("resolve");
    drive(&engine, |_, _| FutureValue::from_u64(5));

    assert_eq!(ctx.returned_futures()[0].1.as_u64(), Some(5));
    assert_quiescent(&engine);
}

#[test]
fn false_predicate_index_launch_reports_the_default_aggregate() {
    init_test_logging();
    let mapper = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    let engine = engine_with_redops(NodeId(0), mapper, MockRegionTree::new(), sum_registry());
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(4), "maybe-index", ctx.clone())
        .with_predicate(FutureValue::from_u64(42));
    let op = engine
        .launch_index(desc, IndexLaunch::reduction(IndexDomain::d1(0, 7), SUM, true))
        .expect("launch");

    engine.pump().expect("pump");
    engine.resolve_predicate(op, false).expect("resolve");

    let futures = ctx.returned_futures();
    assert_eq!(futures.len(), 1);
    assert_eq!(futures[0].1.as_u64(), Some(42));
    assert_eq!(ctx.outstanding(), 0);
    assert_quiescent(&engine);
}
