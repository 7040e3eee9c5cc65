//! The task engine: launch, mapping, slicing, fan-in, distribution.
//!
//! One [`TaskEngine`] per node. Operation records live in a generational
//! arena behind a table `RwLock` held only for insert and remove; all other
//! access goes through each record's own mutex. Kind-specific behavior
//! dispatches over [`KindState`] variants, never through a type hierarchy.
//!
//! The engine is event-driven: scheduling-side progress registers
//! continuations against completion handles and a driver pumps the ready
//! queue. Lock order is strictly upward (point, then slice, then index);
//! no callback into a parent ever holds a child's lock.

mod distribute;
mod fanin;
mod launch;
mod single;
mod slicing;
mod speculation;

pub use distribute::{LoopbackRouter, Transport};
pub use launch::{IndexLaunch, TaskDesc};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::analysis::Analysis;
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::event::EventTable;
use crate::mapper::Mapper;
use crate::record::{KindState, OpCell, Stage};
use crate::region_tree::RegionTree;
use crate::types::{
    DomainPoint, FutureValue, LogicalRegion, MustEpochId, NodeId, OpId, ProjectionId,
    RedopRegistry, RegionSelection, UniqueId,
};
use crate::util::Arena;

/// A registered projection function: evaluates a projection requirement at
/// one domain point, yielding the concrete region that point accesses.
pub type ProjectionFn = dyn Fn(RegionSelection, DomainPoint) -> LogicalRegion + Send + Sync;

/// The per-node task-operation engine.
pub struct TaskEngine {
    pub(crate) config: EngineConfig,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) region_tree: RegionTree,
    pub(crate) analysis: Analysis,
    pub(crate) redops: RedopRegistry,
    pub(crate) projections: Mutex<HashMap<ProjectionId, Arc<ProjectionFn>>>,
    pub(crate) events: EventTable,
    ops: RwLock<Arena<Arc<OpCell>>>,
    by_unique: Mutex<HashMap<UniqueId, OpId>>,
    pub(crate) ready: SegQueue<OpId>,
    seq: AtomicU32,
    pub(crate) must_epochs: Mutex<HashMap<MustEpochId, Vec<OpId>>>,
    pub(crate) transport: Mutex<Option<Arc<dyn Transport>>>,
    /// First fatal error raised from a continuation; surfaced by `pump`.
    failure: Mutex<Option<Error>>,
}

impl TaskEngine {
    /// Builds an engine over the external collaborators.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        mapper: Arc<dyn Mapper>,
        region_tree: RegionTree,
        analysis: Analysis,
    ) -> Arc<Self> {
        Self::with_redops(config, mapper, region_tree, analysis, RedopRegistry::new())
    }

    /// Builds an engine with reduction operators pre-registered.
    #[must_use]
    pub fn with_redops(
        config: EngineConfig,
        mapper: Arc<dyn Mapper>,
        region_tree: RegionTree,
        analysis: Analysis,
        redops: RedopRegistry,
    ) -> Arc<Self> {
        let capacity = config.pool_capacity;
        Arc::new(Self {
            config,
            mapper,
            region_tree,
            analysis,
            redops,
            projections: Mutex::new(HashMap::new()),
            events: EventTable::new(),
            ops: RwLock::new(Arena::with_capacity(capacity)),
            by_unique: Mutex::new(HashMap::new()),
            ready: SegQueue::new(),
            seq: AtomicU32::new(1),
            must_epochs: Mutex::new(HashMap::new()),
            transport: Mutex::new(None),
            failure: Mutex::new(None),
        })
    }

    /// This node's id.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.config.node
    }

    /// The engine's completion-event table.
    #[must_use]
    pub fn events(&self) -> &EventTable {
        &self.events
    }

    /// Registers a projection function under `id`.
    pub fn register_projection(&self, id: ProjectionId, f: Arc<ProjectionFn>) {
        self.projections.lock().insert(id, f);
    }

    /// Attaches the node-to-node transport.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    pub(crate) fn next_unique(&self) -> UniqueId {
        UniqueId::pack(self.config.node, self.seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts a record built by `build`, which receives its final pool id
    /// and a freshly allocated unique id.
    pub(crate) fn insert_cell<F>(&self, build: F) -> OpId
    where
        F: FnOnce(OpId, UniqueId) -> OpCell,
    {
        self.insert_cell_with_unique(self.next_unique(), build)
    }

    /// Inserts a record carrying an already-assigned unique id (migrated
    /// tasks keep the id their origin node issued).
    pub(crate) fn insert_cell_with_unique<F>(&self, unique: UniqueId, build: F) -> OpId
    where
        F: FnOnce(OpId, UniqueId) -> OpCell,
    {
        let mut ops = self.ops.write();
        let index = ops.insert_with(|index| Arc::new(build(OpId::from_arena(index), unique)));
        drop(ops);
        let id = OpId::from_arena(index);
        self.by_unique.lock().insert(unique, id);
        id
    }

    /// The live record behind `op`.
    pub(crate) fn with_op(&self, op: OpId) -> Result<Arc<OpCell>> {
        self.ops
            .read()
            .get(op.arena_index())
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::StaleOperation))
    }

    pub(crate) fn lookup_unique(&self, unique: UniqueId) -> Option<OpId> {
        self.by_unique.lock().get(&unique).copied()
    }

    /// Returns the record to the pool after commit. The generation bump
    /// makes every outstanding id for this record stale.
    pub(crate) fn deactivate(&self, op: OpId) {
        let removed = self.ops.write().remove(op.arena_index());
        if let Some(cell) = removed {
            self.by_unique.lock().remove(&cell.unique);
            let state = cell.state.lock();
            if let Some((epoch, _)) = state.must_epoch {
                if let Some(members) = self.must_epochs.lock().get_mut(&epoch) {
                    members.retain(|m| *m != op);
                }
            }
            debug!(op = %cell.unique, kind = state.kind.kind_name(), "deactivated");
        }
    }

    pub(crate) fn enqueue_ready(&self, op: OpId) {
        self.ready.push(op);
    }

    pub(crate) fn record_failure(&self, err: Error) {
        tracing::error!(report = %err.to_report(), "fatal engine error");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }

    /// Pumps the engine until the ready queue and dispatch queue are both
    /// empty. Returns the number of operations dispatched.
    ///
    /// Fatal errors raised inside continuations surface here.
    pub fn pump(self: &Arc<Self>) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            self.events.drain();
            if let Some(err) = self.take_failure() {
                return Err(err);
            }
            let Some(op) = self.ready.pop() else {
                return Ok(dispatched);
            };
            self.dispatch_op(op)?;
            dispatched += 1;
        }
    }

    /// Dispatches one ready operation by kind.
    fn dispatch_op(self: &Arc<Self>, op: OpId) -> Result<()> {
        // Stolen or already-reclaimed entries fall out of the queue here.
        let Ok(cell) = self.with_op(op) else {
            return Ok(());
        };
        enum Step {
            MapAndLaunch,
            RunIndex,
            Reslice,
            Enumerate,
        }
        let step = {
            let state = cell.state.lock();
            match &state.kind {
                KindState::Index(_) => Step::RunIndex,
                KindState::Slice(s) if s.recurse => Step::Reslice,
                KindState::Slice(_) => Step::Enumerate,
                KindState::Individual(_) | KindState::Point(_) | KindState::Shard(_) => {
                    Step::MapAndLaunch
                }
            }
        };
        match step {
            Step::MapAndLaunch => self.map_and_launch(&cell),
            Step::RunIndex => self.run_index(&cell),
            Step::Reslice => self.reslice(&cell),
            Step::Enumerate => self.enumerate_points(&cell),
        }
    }

    /// Current stage of `op`.
    pub fn stage_of(&self, op: OpId) -> Result<Stage> {
        Ok(self.with_op(op)?.state.lock().lifecycle.stage())
    }

    /// True while `op` names a live (not yet reclaimed) record.
    #[must_use]
    pub fn is_live(&self, op: OpId) -> bool {
        self.ops.read().contains(op.arena_index())
    }

    /// Live operations with kind and stage, in pool order.
    #[must_use]
    pub fn live_ops(&self) -> Vec<(OpId, &'static str, Stage)> {
        self.ops
            .read()
            .iter()
            .map(|(index, cell)| {
                let state = cell.state.lock();
                (
                    OpId::from_arena(index),
                    state.kind.kind_name(),
                    state.lifecycle.stage(),
                )
            })
            .collect()
    }

    /// The terminal result of an individual launch or the folded reduction
    /// of an index launch, once available.
    #[must_use]
    pub fn result_of(&self, op: OpId) -> Option<FutureValue> {
        let cell = self.with_op(op).ok()?;
        let state = cell.state.lock();
        match &state.kind {
            KindState::Individual(s) => s.result.clone(),
            KindState::Index(s) => s.reduction.clone(),
            KindState::Point(s) => s.result.clone(),
            KindState::Slice(_) | KindState::Shard(_) => None,
        }
    }

    /// A serializable summary of the live operation table.
    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let live = self
            .ops
            .read()
            .iter()
            .map(|(_, cell)| {
                let state = cell.state.lock();
                let fraction = match &state.kind {
                    KindState::Index(s) => Some(s.fraction),
                    _ => None,
                };
                OpSummary {
                    unique: cell.unique.0,
                    name: cell.name.clone(),
                    kind: state.kind.kind_name(),
                    stage: state.lifecycle.stage(),
                    fraction: fraction.map(|f| f.to_string()),
                }
            })
            .collect();
        EngineSnapshot {
            node: self.config.node.0,
            live,
        }
    }

    /// Index-task fraction accumulator, for assertions.
    #[cfg(any(test, feature = "test-internals"))]
    pub fn index_fraction(&self, op: OpId) -> Option<crate::types::Fraction> {
        let cell = self.with_op(op).ok()?;
        let state = cell.state.lock();
        match &state.kind {
            KindState::Index(s) => Some(s.fraction),
            _ => None,
        }
    }

    /// Domain point of a point task, for assertions.
    #[cfg(any(test, feature = "test-internals"))]
    pub fn point_of(&self, op: OpId) -> Option<DomainPoint> {
        let cell = self.with_op(op).ok()?;
        let state = cell.state.lock();
        match &state.kind {
            KindState::Point(s) => Some(s.point),
            _ => None,
        }
    }

    /// Index-task point counters `(total, mapped, completed, committed)`.
    #[cfg(any(test, feature = "test-internals"))]
    pub fn index_counters(&self, op: OpId) -> Option<(u64, u64, u64, u64)> {
        let cell = self.with_op(op).ok()?;
        let state = cell.state.lock();
        match &state.kind {
            KindState::Index(s) => Some((
                s.total_points,
                s.mapped_points,
                s.completed_points,
                s.committed_points,
            )),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("node", &self.config.node)
            .field("live", &self.ops.read().len())
            .finish_non_exhaustive()
    }
}

/// Serializable engine summary for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    /// Reporting node.
    pub node: u32,
    /// Live operations.
    pub live: Vec<OpSummary>,
}

/// One live operation in an [`EngineSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct OpSummary {
    /// Unique launch id.
    pub unique: u64,
    /// Registered task name.
    pub name: String,
    /// Kind name.
    pub kind: &'static str,
    /// Lifecycle stage.
    pub stage: Stage,
    /// Index-task fraction accumulator, rendered.
    pub fraction: Option<String>,
}
