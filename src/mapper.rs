//! The scheduling-policy ("mapper") interface.
//!
//! The engine invokes the mapper at fixed points and treats every output as
//! untrusted: validation happens in the engine (`finalize_map_task_output`,
//! `slice_index_space`), never here. Mappers are shared across threads and
//! must synchronize their own state.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::region_tree::InstanceRef;
use crate::types::{
    DomainPoint, IndexDomain, MustEpochId, ProcId, RegionRequirement, TaskFuncId, UniqueId,
    VariantId,
};

/// Immutable view of a task handed to every mapper call.
#[derive(Clone, Debug)]
pub struct TaskProfile {
    /// Unique launch id.
    pub unique_id: UniqueId,
    /// Task function.
    pub func: TaskFuncId,
    /// Registered task name, for diagnostics.
    pub name: String,
    /// Processor the task currently sits on.
    pub current_proc: ProcId,
    /// Declared region accesses.
    pub requirements: Vec<RegionRequirement>,
    /// Launch domain for index tasks and slices.
    pub domain: Option<IndexDomain>,
    /// Concrete point for point tasks.
    pub point: Option<DomainPoint>,
    /// Must-epoch membership, if any.
    pub must_epoch: Option<MustEpochId>,
}

/// Output of `select_task_options`.
#[derive(Clone, Copy, Debug)]
pub struct TaskOptions {
    /// Processor (and therefore node) the task should first move to.
    pub initial_proc: ProcId,
    /// Eligible for stealing until mapped.
    pub stealable: bool,
    /// Map on the issuing node before any migration.
    pub origin_mapped: bool,
    /// Request a replicated mapping.
    pub replicate: bool,
}

/// Output of `premap_task`: instance choices made before full mapping,
/// keyed by requirement index.
#[derive(Clone, Debug, Default)]
pub struct PremapOutput {
    /// Premapped instances per requirement index.
    pub premapped: Vec<(u32, Vec<InstanceRef>)>,
}

/// One fragment of a sliced index domain.
#[derive(Clone, Debug)]
pub struct SliceDescriptor {
    /// Sub-domain this slice covers.
    pub domain: IndexDomain,
    /// Processor the slice should execute near.
    pub target: ProcId,
    /// Re-invoke slicing on the target instead of enumerating points.
    pub recurse: bool,
    /// Points of this slice are steal-eligible.
    pub stealable: bool,
}

/// Output of `slice_domain`.
#[derive(Clone, Debug, Default)]
pub struct SliceOutput {
    /// Ordered slice list; volumes must sum to the input domain.
    pub slices: Vec<SliceDescriptor>,
}

/// Input to `map_task`.
#[derive(Clone, Debug, Default)]
pub struct MapInput {
    /// Valid instance candidates per requirement.
    pub valid: Vec<Vec<InstanceRef>>,
    /// Already-chosen premapped instances per requirement.
    pub premapped: Vec<Option<Vec<InstanceRef>>>,
}

/// The mapper's choice for one requirement.
#[derive(Clone, Debug, Default)]
pub struct RequirementMapping {
    /// Chosen instances; ignored when `virtual_map` is set.
    pub instances: Vec<InstanceRef>,
    /// Defer materialization of this requirement.
    pub virtual_map: bool,
}

/// The task variant a mapping selected.
#[derive(Clone, Copy, Debug)]
pub struct VariantSpec {
    /// Variant identifier.
    pub id: VariantId,
    /// Leaf variants launch no sub-operations.
    pub leaf: bool,
    /// Inner variants only launch sub-operations and may start before
    /// their instances are ready.
    pub inner: bool,
    /// Variant may participate in control replication.
    pub replicable: bool,
}

impl Default for VariantSpec {
    fn default() -> Self {
        Self {
            id: VariantId(0),
            leaf: true,
            inner: false,
            replicable: false,
        }
    }
}

/// Output of `map_task` (one shard of a replicated mapping).
#[derive(Clone, Debug, Default)]
pub struct MapOutput {
    /// Target processors; must agree on kind and node.
    pub target_procs: Vec<ProcId>,
    /// Mapping per requirement, same order as the profile's requirements.
    pub mappings: Vec<RequirementMapping>,
    /// Chosen variant.
    pub variant: VariantSpec,
}

/// Output of `speculate`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpeculationOutput {
    /// Speculate past the unresolved predicate.
    pub speculate: bool,
    /// Predicted predicate value when speculating.
    pub predicted_value: bool,
}

/// Execution timing handed to `report_profiling`.
#[derive(Clone, Copy, Debug)]
pub struct ProfilingReport {
    /// The profiled launch.
    pub unique_id: UniqueId,
    /// Where it ran.
    pub proc: ProcId,
}

/// The scheduling policy, invoked at fixed points.
pub trait Mapper: Send + Sync {
    /// Chooses initial placement and flags for a new launch.
    fn select_task_options(&self, task: &TaskProfile) -> TaskOptions;

    /// Optionally chooses instances before dependence analysis completes.
    fn premap_task(&self, _task: &TaskProfile) -> PremapOutput {
        PremapOutput::default()
    }

    /// Splits an index domain into slices.
    fn slice_domain(&self, task: &TaskProfile, domain: IndexDomain) -> SliceOutput;

    /// Chooses instances and targets for one task execution.
    fn map_task(&self, task: &TaskProfile, input: &MapInput) -> MapOutput;

    /// Produces one output per shard for a replicated mapping. A single
    /// output collapses back to a non-replicated mapping.
    fn replicate_task(&self, task: &TaskProfile, input: &MapInput) -> Vec<MapOutput> {
        vec![self.map_task(task, input)]
    }

    /// Orders candidate source instances for a copy. Defaults to the given
    /// order.
    fn select_sources(
        &self,
        _task: &TaskProfile,
        _requirement: u32,
        candidates: Vec<InstanceRef>,
    ) -> Vec<InstanceRef> {
        candidates
    }

    /// Observes the mapping after execution; output-free hook.
    fn postmap_task(&self, _task: &TaskProfile) {}

    /// Decides whether to speculate past an unresolved predicate.
    fn speculate(&self, _task: &TaskProfile) -> SpeculationOutput {
        SpeculationOutput::default()
    }

    /// Receives profiling responses the mapper asked for.
    fn report_profiling(&self, _task: &TaskProfile, _report: &ProfilingReport) {}
}

/// Round-robin mapper: distributes launches over a fixed processor list,
/// slices an index domain into one non-recursive slice per processor, and
/// picks the first satisfying instance candidate per requirement.
#[derive(Debug)]
pub struct RoundRobinMapper {
    procs: Vec<ProcId>,
    next: AtomicUsize,
}

impl RoundRobinMapper {
    /// Builds a mapper over `procs`.
    ///
    /// # Panics
    ///
    /// Panics if `procs` is empty.
    #[must_use]
    pub fn new(procs: Vec<ProcId>) -> Self {
        assert!(!procs.is_empty(), "mapper needs at least one processor");
        Self {
            procs,
            next: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> ProcId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.procs[n % self.procs.len()]
    }
}

impl Mapper for RoundRobinMapper {
    fn select_task_options(&self, _task: &TaskProfile) -> TaskOptions {
        TaskOptions {
            initial_proc: self.pick(),
            stealable: false,
            origin_mapped: false,
            replicate: false,
        }
    }

    fn slice_domain(&self, _task: &TaskProfile, domain: IndexDomain) -> SliceOutput {
        let pieces = domain.split_even(self.procs.len() as u64);
        SliceOutput {
            slices: pieces
                .into_iter()
                .zip(self.procs.iter().cycle())
                .map(|(piece, &target)| SliceDescriptor {
                    domain: piece,
                    target,
                    recurse: false,
                    stealable: false,
                })
                .collect(),
        }
    }

    fn map_task(&self, task: &TaskProfile, input: &MapInput) -> MapOutput {
        let mappings = task
            .requirements
            .iter()
            .enumerate()
            .map(|(idx, req)| {
                let premapped = input.premapped.get(idx).and_then(Clone::clone);
                let instances = premapped.unwrap_or_else(|| {
                    input
                        .valid
                        .get(idx)
                        .into_iter()
                        .flatten()
                        .find(|inst| {
                            inst.covers_fields(&req.fields)
                                && inst.redop == req.redop
                        })
                        .cloned()
                        .into_iter()
                        .collect()
                });
                RequirementMapping {
                    instances,
                    virtual_map: false,
                }
            })
            .collect();
        MapOutput {
            target_procs: vec![task.current_proc],
            mappings,
            variant: VariantSpec::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    fn profile(proc: ProcId) -> TaskProfile {
        TaskProfile {
            unique_id: UniqueId(1),
            func: TaskFuncId(1),
            name: "test".into(),
            current_proc: proc,
            requirements: Vec::new(),
            domain: None,
            point: None,
            must_epoch: None,
        }
    }

    #[test]
    fn round_robin_cycles_processors() {
        let p0 = ProcId::cpu(NodeId(0), 0);
        let p1 = ProcId::cpu(NodeId(0), 1);
        let mapper = RoundRobinMapper::new(vec![p0, p1]);
        let task = profile(p0);
        assert_eq!(mapper.select_task_options(&task).initial_proc, p0);
        assert_eq!(mapper.select_task_options(&task).initial_proc, p1);
        assert_eq!(mapper.select_task_options(&task).initial_proc, p0);
    }

    #[test]
    fn slices_cover_the_domain() {
        let procs = vec![ProcId::cpu(NodeId(0), 0), ProcId::cpu(NodeId(1), 0)];
        let mapper = RoundRobinMapper::new(procs);
        let domain = IndexDomain::d1(0, 7);
        let out = mapper.slice_domain(&profile(ProcId::cpu(NodeId(0), 0)), domain);
        assert_eq!(out.slices.len(), 2);
        let total: u64 = out.slices.iter().map(|s| s.domain.volume()).sum();
        assert_eq!(total, domain.volume());
        assert!(out.slices.iter().all(|s| !s.recurse));
    }
}
