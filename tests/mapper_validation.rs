//! The mapper is untrusted: every policy output is validated before use and
//! violations surface as structured fatal errors.

mod common;

use std::sync::Arc;

use common::*;
use taskgrid::analysis::NullAnalysis;
use taskgrid::context::RecordingContext;
use taskgrid::error::{ErrorKind, MapperViolation, Severity};
use taskgrid::mapper::{MapInput, MapOutput, Mapper, SliceOutput, TaskOptions, TaskProfile};
use taskgrid::region_tree::MockRegionTree;
use taskgrid::test_utils::{engine_with, init_test_logging, ScriptedMapper};
use taskgrid::types::{
    FutureValue, IndexDomain, MemoryId, NodeId, ProcId, RegionRequirement, TaskFuncId,
};
use taskgrid::{EngineConfig, TaskDesc, TaskEngine};

fn launch_ctx() -> Arc<RecordingContext> {
    RecordingContext::with_privileges(vec![RegionRequirement::write(
        region(1),
        region(1),
        &[FIELD],
    )])
}

fn read_desc(name: &str, ctx: Arc<RecordingContext>) -> TaskDesc {
    TaskDesc::new(TaskFuncId(5), name, ctx)
        .with_requirement(RegionRequirement::read(region(1), region(1), &[FIELD]))
}

#[test]
fn invisible_instance_is_a_fatal_mapper_violation() {
    init_test_logging();
    let tree = Arc::new(MockRegionTree::new().with_visibility(|_, _| false));
    tree.add_instance(region(1), MemoryId::new(NodeId(0), 0), &[FIELD], None);
    let engine = TaskEngine::new(
        EngineConfig::for_node(NodeId(0)),
        Arc::new(ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0))),
        tree.clone(),
        Arc::new(NullAnalysis),
    );
    let ctx = launch_ctx();
    engine
        .launch_individual(read_desc("gather", ctx))
        .expect("launch");

    let err = engine.pump().expect_err("mapping must fail");
    assert!(
        matches!(err.kind, ErrorKind::Mapper(MapperViolation::InstanceNotVisible { .. })),
        "{err}"
    );
    assert_eq!(err.severity(), Severity::Fatal);
    assert_eq!(err.diag.task.as_deref(), Some("gather"));
    assert_eq!(err.diag.requirement, Some(0));
    assert!(tree.registrations().is_empty(), "nothing registered");
}

#[test]
fn privilege_field_without_an_instance_is_rejected() {
    init_test_logging();
    // Valid set is empty, so the scripted mapper maps nothing for the
    // requirement.
    let engine = engine_with(
        NodeId(0),
        ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0)),
        MockRegionTree::new(),
    );
    engine
        .launch_individual(read_desc("starved", launch_ctx()))
        .expect("launch");

    let err = engine.pump().expect_err("mapping must fail");
    assert!(
        matches!(
            err.kind,
            ErrorKind::Mapper(MapperViolation::UnmappedField { field }) if field == FIELD
        ),
        "{err}"
    );
}

#[test]
fn collected_instance_fails_acquisition_fatally() {
    init_test_logging();
    let tree = Arc::new(MockRegionTree::new());
    let instance = tree.add_instance(region(1), MemoryId::new(NodeId(0), 0), &[FIELD], None);
    tree.collect_instance(instance.id);
    let engine = TaskEngine::new(
        EngineConfig::for_node(NodeId(0)),
        Arc::new(ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0))),
        tree,
        Arc::new(NullAnalysis),
    );
    engine
        .launch_individual(read_desc("doomed", launch_ctx()))
        .expect("launch");

    let err = engine.pump().expect_err("acquisition must fail");
    assert_eq!(err.kind, ErrorKind::InstanceCollected);
}

#[test]
fn transient_acquisition_race_retries_and_succeeds() {
    init_test_logging();
    let tree = Arc::new(MockRegionTree::new());
    let instance = tree.add_instance(region(1), MemoryId::new(NodeId(0), 0), &[FIELD], None);
    tree.race_instance_once(instance.id);
    let engine = TaskEngine::new(
        EngineConfig::for_node(NodeId(0)),
        Arc::new(ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0))),
        tree.clone(),
        Arc::new(NullAnalysis),
    );
    let ctx = launch_ctx();
    engine
        .launch_individual(read_desc("racer", ctx.clone()))
        .expect("launch");

    drive(&engine, |_, _| FutureValue::from_u64(1));
    assert_eq!(ctx.returned_futures().len(), 1);
    assert_eq!(tree.registrations().len(), 1);
    assert_quiescent(&engine);
}

/// Delegates to a scripted mapper but drops the upper half of every slice
/// set, violating domain coverage.
struct HalfSlicer(ScriptedMapper);

impl Mapper for HalfSlicer {
    fn select_task_options(&self, task: &TaskProfile) -> TaskOptions {
        self.0.select_task_options(task)
    }

    fn slice_domain(&self, task: &TaskProfile, domain: IndexDomain) -> SliceOutput {
        let mut output = self.0.slice_domain(task, domain);
        output.slices.truncate(1);
        output
    }

    fn map_task(&self, task: &TaskProfile, input: &MapInput) -> MapOutput {
        self.0.map_task(task, input)
    }
}

#[test]
fn slice_volumes_must_cover_the_whole_domain() {
    init_test_logging();
    let mut inner = ScriptedMapper::targeting(ProcId::cpu(NodeId(0), 0));
    inner.slice_parts = 2;
    let engine = TaskEngine::new(
        EngineConfig::for_node(NodeId(0)),
        Arc::new(HalfSlicer(inner)),
        Arc::new(MockRegionTree::new()),
        Arc::new(NullAnalysis),
    );
    let ctx = Arc::new(RecordingContext::new());
    let desc = TaskDesc::new(TaskFuncId(5), "short", ctx);
    engine
        .launch_index(
            desc,
            taskgrid::IndexLaunch::future_map(IndexDomain::d1(0, 7)),
        )
        .expect("launch");

    let err = engine.pump().expect_err("slicing must fail");
    assert_eq!(
        err.kind,
        ErrorKind::Mapper(MapperViolation::SliceVolumeMismatch {
            expected: 8,
            got: 4
        })
    );
    assert_eq!(err.diag.task.as_deref(), Some("short"));
}
