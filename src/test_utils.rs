//! Test utilities shared by unit and integration tests.
//!
//! Provides logging initialization, engine constructors over permissive
//! collaborator doubles, and [`ScriptedMapper`], a field-configurable mapper
//! for driving the engine into specific mapping outcomes.

use std::sync::{Arc, Once};

use crate::analysis::NullAnalysis;
use crate::config::EngineConfig;
use crate::engine::TaskEngine;
use crate::mapper::{
    MapInput, MapOutput, Mapper, RequirementMapping, SliceDescriptor, SliceOutput,
    SpeculationOutput, TaskOptions, TaskProfile, VariantSpec,
};
use crate::region_tree::MockRegionTree;
use crate::types::{IndexDomain, NodeId, ProcId, RedopRegistry};

static INIT_LOGGING: Once = Once::new();

/// Initializes tracing output for tests. The first call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// An engine on `node` over a permissive mock tree, null analysis, and a
/// scripted mapper targeting the node's CPU 0.
#[must_use]
pub fn engine_on(node: NodeId) -> Arc<TaskEngine> {
    engine_with(node, ScriptedMapper::targeting(ProcId::cpu(node, 0)), MockRegionTree::new())
}

/// An engine on `node` with an explicit mapper and region tree.
#[must_use]
pub fn engine_with(
    node: NodeId,
    mapper: ScriptedMapper,
    tree: MockRegionTree,
) -> Arc<TaskEngine> {
    TaskEngine::new(
        EngineConfig::for_node(node),
        Arc::new(mapper),
        Arc::new(tree),
        Arc::new(NullAnalysis),
    )
}

/// Like [`engine_with`], with reduction operators pre-registered.
#[must_use]
pub fn engine_with_redops(
    node: NodeId,
    mapper: ScriptedMapper,
    tree: MockRegionTree,
    redops: RedopRegistry,
) -> Arc<TaskEngine> {
    TaskEngine::with_redops(
        EngineConfig::for_node(node),
        Arc::new(mapper),
        Arc::new(tree),
        Arc::new(NullAnalysis),
        redops,
    )
}

/// A mapper whose every answer is a struct field. Tests set the fields they
/// care about and leave the rest at the defaults.
#[derive(Debug, Clone)]
pub struct ScriptedMapper {
    /// Initial placement for every launch.
    pub proc: ProcId,
    /// Flag handed back from `select_task_options`.
    pub stealable: bool,
    /// Flag handed back from `select_task_options`.
    pub origin_mapped: bool,
    /// Request replicated mapping for individual launches.
    pub replicate: bool,
    /// Shard count when `replicate` is set; each shard targets `proc`.
    pub shards: u32,
    /// Fragments to split index domains into.
    pub slice_parts: u64,
    /// Target one slice per processor in this list instead of `proc`.
    pub slice_targets: Vec<ProcId>,
    /// Slices are steal-eligible.
    pub slice_stealable: bool,
    /// Variant reported for every mapping.
    pub variant: VariantSpec,
    /// Requirement indices to map virtually.
    pub virtual_requirements: Vec<u32>,
    /// Target processors override; `proc` when empty.
    pub target_procs: Vec<ProcId>,
    /// Answer for `speculate`.
    pub speculation: SpeculationOutput,
}

impl ScriptedMapper {
    /// A mapper that places everything on `proc` and slices into one piece.
    #[must_use]
    pub fn targeting(proc: ProcId) -> Self {
        Self {
            proc,
            stealable: false,
            origin_mapped: false,
            replicate: false,
            shards: 2,
            slice_parts: 1,
            slice_targets: Vec::new(),
            slice_stealable: false,
            variant: VariantSpec::default(),
            virtual_requirements: Vec::new(),
            target_procs: Vec::new(),
            speculation: SpeculationOutput::default(),
        }
    }

    fn one_output(&self, task: &TaskProfile, input: &MapInput) -> MapOutput {
        let mappings = task
            .requirements
            .iter()
            .enumerate()
            .map(|(idx, req)| {
                if self.virtual_requirements.contains(&(idx as u32)) {
                    return RequirementMapping {
                        instances: Vec::new(),
                        virtual_map: true,
                    };
                }
                let premapped = input.premapped.get(idx).and_then(Clone::clone);
                let instances = premapped.unwrap_or_else(|| {
                    input
                        .valid
                        .get(idx)
                        .into_iter()
                        .flatten()
                        .find(|inst| inst.covers_fields(&req.fields) && inst.redop == req.redop)
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
        let target_procs = if self.target_procs.is_empty() {
            vec![self.proc]
        } else {
            self.target_procs.clone()
        };
        MapOutput {
            target_procs,
            mappings,
            variant: self.variant,
        }
    }
}

impl Mapper for ScriptedMapper {
    fn select_task_options(&self, _task: &TaskProfile) -> TaskOptions {
        TaskOptions {
            initial_proc: self.proc,
            stealable: self.stealable,
            origin_mapped: self.origin_mapped,
            replicate: self.replicate,
        }
    }

    fn slice_domain(&self, _task: &TaskProfile, domain: IndexDomain) -> SliceOutput {
        let pieces = domain.split_even(self.slice_parts);
        let targets: Vec<ProcId> = if self.slice_targets.is_empty() {
            vec![self.proc]
        } else {
            self.slice_targets.clone()
        };
        SliceOutput {
            slices: pieces
                .into_iter()
                .zip(targets.into_iter().cycle())
                .map(|(piece, target)| SliceDescriptor {
                    domain: piece,
                    target,
                    recurse: false,
                    stealable: self.slice_stealable,
                })
                .collect(),
        }
    }

    fn map_task(&self, task: &TaskProfile, input: &MapInput) -> MapOutput {
        self.one_output(task, input)
    }

    fn replicate_task(&self, task: &TaskProfile, input: &MapInput) -> Vec<MapOutput> {
        if !self.replicate {
            return vec![self.one_output(task, input)];
        }
        (0..self.shards).map(|_| self.one_output(task, input)).collect()
    }

    fn speculate(&self, _task: &TaskProfile) -> SpeculationOutput {
        self.speculation
    }
}
