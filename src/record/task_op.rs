//! Operation records.
//!
//! One shared record carries the identity, declared accesses, placement and
//! tri-phase lifecycle of every operation; kind-specific state lives in a
//! tagged [`KindState`] variant rather than an inheritance chain. Records
//! are pooled in the engine's arena and protected by one mutex each; the
//! engine's table lock is only held for insert and remove.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::Context;
use crate::event::EventHandle;
use crate::mapper::{TaskProfile, VariantSpec};
use crate::record::lifecycle::LifecycleRecord;
use crate::region_tree::ChosenMapping;
use crate::resource::ResourceTracker;
use crate::types::{
    DomainPoint, Fraction, FutureMap, FutureValue, IndexDomain, MustEpochId, NodeId, OpId, ProcId,
    RedopId, RegionRequirement, RemoteOpId, TaskFuncId, UniqueId,
};

/// Boolean operation flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpFlags {
    /// Eligible for stealing until mapped.
    pub stealable: bool,
    /// Mapping happens on the issuing node before migration.
    pub origin_mapped: bool,
    /// Executing ahead of an unresolved predicate.
    pub speculated: bool,
    /// Control-replicated execution.
    pub replicated: bool,
}

/// Predicate state for speculative execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateState {
    /// Unconditional execution.
    True,
    /// Predicate resolved false: substitute the default result.
    False,
    /// Predicate unresolved; `predicted` is the speculated value, if the
    /// mapper chose to speculate.
    Unresolved {
        /// Mapper's predicted outcome, when speculating.
        predicted: Option<bool>,
    },
}

impl PredicateState {
    /// True if the operation may not run (unresolved or false).
    #[must_use]
    pub const fn blocks_dispatch(&self) -> bool {
        match self {
            Self::True => false,
            Self::False => true,
            Self::Unresolved { predicted } => predicted.is_none(),
        }
    }
}

/// Individual (non-index) launch state.
#[derive(Debug, Clone, Default)]
pub struct IndividualState {
    /// The terminal result future.
    pub result: Option<FutureValue>,
    /// Result substituted when the predicate resolves false.
    pub predicate_default: Option<FutureValue>,
    /// Set once the task has been handed to a processor.
    pub dispatched: bool,
}

/// Index (bulk) launch state: the fan-in accumulator.
#[derive(Debug, Clone)]
pub struct IndexState {
    /// The launch domain.
    pub domain: IndexDomain,
    /// Slice-fraction accumulator; whole exactly once.
    pub fraction: Fraction,
    /// Points discovered so far (sums slice reports).
    pub total_points: u64,
    /// Points mapped so far.
    pub mapped_points: u64,
    /// Points completed so far.
    pub completed_points: u64,
    /// Points committed so far.
    pub committed_points: u64,
    /// Reduction operator; `None` means a future map is produced.
    pub redop: Option<RedopId>,
    /// Deterministic reductions buffer and fold in point order.
    pub deterministic: bool,
    /// Per-point results (also the deterministic-reduction buffer).
    pub future_map: FutureMap,
    /// Folded reduction value (non-deterministic folds immediately).
    pub reduction: Option<FutureValue>,
    /// Result substituted when the predicate resolves false.
    pub predicate_default: Option<FutureValue>,
}

impl IndexState {
    /// Fresh accumulator state over `domain`.
    #[must_use]
    pub fn new(domain: IndexDomain, redop: Option<RedopId>, deterministic: bool) -> Self {
        Self {
            domain,
            fraction: Fraction::ZERO,
            total_points: 0,
            mapped_points: 0,
            completed_points: 0,
            committed_points: 0,
            redop,
            deterministic,
            future_map: FutureMap::new(),
            reduction: None,
            predicate_default: None,
        }
    }
}

/// Who owns a slice: the index task on this node, or a proxy id on the
/// origin node when the slice was shipped remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOwner {
    /// The owning index task lives on this node.
    Local(OpId),
    /// The owning index task lives on `RemoteOpId::owner`.
    Remote(RemoteOpId),
}

/// Slice state: one runtime-chosen fragment of an index launch.
#[derive(Debug, Clone)]
pub struct SliceState {
    /// Sub-domain this slice covers.
    pub domain: IndexDomain,
    /// This slice's share of the launch is `1/denominator`.
    pub denominator: u64,
    /// Back-reference to the owning index task.
    pub owner: SliceOwner,
    /// Enumerated point tasks, empty until enumeration.
    pub points: Vec<OpId>,
    /// Points expected once enumerated.
    pub expected_points: u64,
    /// Points not yet mapped.
    pub unmapped: u64,
    /// Points not yet complete.
    pub incomplete: u64,
    /// Points not yet committed.
    pub uncommitted: u64,
    /// Exactly-once guards for the three upward reports.
    pub reported_mapped: bool,
    /// See `reported_mapped`.
    pub reported_complete: bool,
    /// See `reported_mapped`.
    pub reported_committed: bool,
    /// Point results gathered for the upward complete report.
    pub collected: BTreeMap<DomainPoint, FutureValue>,
    /// Resource records gathered from points.
    pub collected_resources: ResourceTracker,
    /// Points of this slice are steal-eligible.
    pub stealable: bool,
    /// Re-invoke slicing on this slice instead of enumerating points.
    pub recurse: bool,
}

impl SliceState {
    /// Fresh slice over `domain` with share `1/denominator`.
    #[must_use]
    pub fn new(domain: IndexDomain, denominator: u64, owner: SliceOwner, stealable: bool) -> Self {
        Self {
            domain,
            denominator,
            owner,
            points: Vec::new(),
            expected_points: 0,
            unmapped: 0,
            incomplete: 0,
            uncommitted: 0,
            reported_mapped: false,
            reported_complete: false,
            reported_committed: false,
            collected: BTreeMap::new(),
            collected_resources: ResourceTracker::new(),
            stealable,
            recurse: false,
        }
    }
}

/// Point state: one concrete domain element.
#[derive(Debug, Clone)]
pub struct PointState {
    /// The domain point.
    pub point: DomainPoint,
    /// Owning slice (non-owning back-reference).
    pub slice: OpId,
    /// Termination handle, distinct from the generic completion handle:
    /// point placement can be decided after the point is created, so
    /// waiters need a handle that exists before dispatch is scheduled.
    pub termination: EventHandle,
    /// The point's result.
    pub result: Option<FutureValue>,
}

/// Shard state: one replicated execution of a logically-single task.
#[derive(Debug, Clone)]
pub struct ShardState {
    /// Shard index within the replicated set.
    pub shard: u32,
    /// Total shard count.
    pub total: u32,
    /// The manager (original single task) this shard reports to.
    pub manager: OpId,
    /// The shard's result.
    pub result: Option<FutureValue>,
}

/// Kind-specific operation state.
#[derive(Debug, Clone)]
pub enum KindState {
    /// A non-index launch with a terminal future.
    Individual(IndividualState),
    /// A bulk launch over a domain.
    Index(IndexState),
    /// A runtime-produced fragment of an index launch.
    Slice(SliceState),
    /// One concrete domain point of a slice.
    Point(PointState),
    /// One replicated shard of a single task.
    Shard(ShardState),
}

impl KindState {
    /// Short kind name for logs and errors.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Individual(_) => "individual",
            Self::Index(_) => "index",
            Self::Slice(_) => "slice",
            Self::Point(_) => "point",
            Self::Shard(_) => "shard",
        }
    }
}

/// Mutable operation state, guarded by the record's mutex.
#[derive(Debug)]
pub struct OpState {
    /// Tri-phase lifecycle.
    pub lifecycle: LifecycleRecord,
    /// Declared region accesses; immutable after dependence registration
    /// apart from `parent_req_index` bookkeeping.
    pub requirements: Vec<RegionRequirement>,
    /// Opaque argument payload; shared or deep-copied on clone per flag.
    pub arg: Arc<[u8]>,
    /// Future preconditions for dispatch.
    pub future_preconditions: Vec<EventHandle>,
    /// Grant events to acquire before dispatch.
    pub grants: Vec<EventHandle>,
    /// Phase barriers to wait on before dispatch.
    pub barriers: Vec<EventHandle>,
    /// Processor chosen by select-options / mapping.
    pub target_proc: ProcId,
    /// Processor the record currently sits on.
    pub current_proc: ProcId,
    /// Boolean flags.
    pub flags: OpFlags,
    /// Must-epoch membership and index within the epoch.
    pub must_epoch: Option<(MustEpochId, u32)>,
    /// Speculation state.
    pub predicate: PredicateState,
    /// Finalized instance choices, one per requirement.
    pub chosen: Vec<ChosenMapping>,
    /// Variant selected by the mapping.
    pub variant: Option<VariantSpec>,
    /// Accumulated resource side effects.
    pub tracker: ResourceTracker,
    /// Fired when mapping finishes.
    pub mapped_event: EventHandle,
    /// Fired when the completion barrier passes.
    pub completion_event: EventHandle,
    /// Fired when the commit barrier passes.
    pub commit_event: EventHandle,
    /// Direct parent operation for child callbacks, if any.
    pub parent_op: Option<OpId>,
    /// Set when this record proxies an operation owned by another node.
    pub remote_of: Option<RemoteOpId>,
    /// Number of migrations performed; a task is sent at most once per
    /// distribution decision.
    pub sends: u32,
    /// Kind-specific state.
    pub kind: KindState,
}

/// One pooled operation: immutable identity plus mutex-guarded state.
pub struct OpCell {
    /// Pool identity.
    pub id: OpId,
    /// Globally unique launch id.
    pub unique: UniqueId,
    /// Task function.
    pub func: TaskFuncId,
    /// Registered task name.
    pub name: String,
    /// Parent context surface.
    pub context: Context,
    /// Guarded mutable state.
    pub state: Mutex<OpState>,
}

impl OpCell {
    /// Builds the mapper-facing profile snapshot.
    #[must_use]
    pub fn profile(&self) -> TaskProfile {
        let state = self.state.lock();
        let (domain, point) = match &state.kind {
            KindState::Index(s) => (Some(s.domain), None),
            KindState::Slice(s) => (Some(s.domain), None),
            KindState::Point(s) => (None, Some(s.point)),
            KindState::Individual(_) | KindState::Shard(_) => (None, None),
        };
        TaskProfile {
            unique_id: self.unique,
            func: self.func,
            name: self.name.clone(),
            current_proc: state.current_proc,
            requirements: state.requirements.clone(),
            domain,
            point,
            must_epoch: state.must_epoch.map(|(id, _)| id),
        }
    }

    /// Short kind name for logs.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.state.lock().kind.kind_name()
    }
}

impl std::fmt::Debug for OpCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpCell")
            .field("id", &self.id)
            .field("unique", &self.unique)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl OpState {
    /// Fresh state for a new record.
    #[must_use]
    pub fn new(kind: KindState, proc: ProcId) -> Self {
        Self {
            lifecycle: LifecycleRecord::new(),
            requirements: Vec::new(),
            arg: Arc::from(&[][..]),
            future_preconditions: Vec::new(),
            grants: Vec::new(),
            barriers: Vec::new(),
            target_proc: proc,
            current_proc: proc,
            flags: OpFlags::default(),
            must_epoch: None,
            predicate: PredicateState::True,
            chosen: Vec::new(),
            variant: None,
            tracker: ResourceTracker::new(),
            mapped_event: EventHandle::TRIGGERED,
            completion_event: EventHandle::TRIGGERED,
            commit_event: EventHandle::TRIGGERED,
            parent_op: None,
            remote_of: None,
            sends: 0,
            kind,
        }
    }

    /// Field-wise duplicate for sibling splits (slice cloning, shard
    /// fan-out). The argument buffer is shared by reference unless
    /// `deep_copy_arg` is set.
    #[must_use]
    pub fn clone_from(&self, kind: KindState, deep_copy_arg: bool) -> Self {
        Self {
            lifecycle: LifecycleRecord::new(),
            requirements: self.requirements.clone(),
            arg: if deep_copy_arg {
                Arc::from(&self.arg[..])
            } else {
                Arc::clone(&self.arg)
            },
            future_preconditions: self.future_preconditions.clone(),
            grants: self.grants.clone(),
            barriers: self.barriers.clone(),
            target_proc: self.target_proc,
            current_proc: self.current_proc,
            flags: self.flags,
            must_epoch: self.must_epoch,
            predicate: self.predicate,
            chosen: Vec::new(),
            variant: None,
            tracker: ResourceTracker::new(),
            mapped_event: EventHandle::TRIGGERED,
            completion_event: EventHandle::TRIGGERED,
            commit_event: EventHandle::TRIGGERED,
            parent_op: None,
            remote_of: None,
            sends: 0,
            kind,
        }
    }

    /// True if the record currently sits on a node other than `local`.
    #[must_use]
    pub fn is_remote(&self, local: NodeId) -> bool {
        self.current_proc.node != local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RecordingContext;
    use crate::types::NodeId;

    fn cell(kind: KindState) -> OpCell {
        OpCell {
            id: OpId::new_for_test(0, 0),
            unique: UniqueId(9),
            func: TaskFuncId(1),
            name: "probe".into(),
            context: Arc::new(RecordingContext::new()),
            state: Mutex::new(OpState::new(kind, ProcId::cpu(NodeId(0), 0))),
        }
    }

    #[test]
    fn profile_reflects_kind() {
        let cell = cell(KindState::Index(IndexState::new(
            IndexDomain::d1(0, 3),
            None,
            false,
        )));
        let profile = cell.profile();
        assert_eq!(profile.domain, Some(IndexDomain::d1(0, 3)));
        assert_eq!(profile.point, None);
        assert_eq!(cell.kind_name(), "index");
    }

    #[test]
    fn clone_shares_or_copies_argument() {
        let mut state = OpState::new(KindState::Individual(IndividualState::default()), ProcId::cpu(NodeId(0), 0));
        state.arg = Arc::from(&b"payload"[..]);

        let shared = state.clone_from(KindState::Individual(IndividualState::default()), false);
        assert!(Arc::ptr_eq(&state.arg, &shared.arg));

        let deep = state.clone_from(KindState::Individual(IndividualState::default()), true);
        assert!(!Arc::ptr_eq(&state.arg, &deep.arg));
        assert_eq!(&deep.arg[..], b"payload");
    }

    #[test]
    fn remoteness_follows_current_processor() {
        let mut state = OpState::new(KindState::Individual(IndividualState::default()), ProcId::cpu(NodeId(0), 0));
        assert!(!state.is_remote(NodeId(0)));
        state.current_proc = ProcId::cpu(NodeId(2), 0);
        assert!(state.is_remote(NodeId(0)));
    }

    #[test]
    fn predicate_dispatch_blocking() {
        assert!(!PredicateState::True.blocks_dispatch());
        assert!(PredicateState::False.blocks_dispatch());
        assert!(PredicateState::Unresolved { predicted: None }.blocks_dispatch());
        assert!(!PredicateState::Unresolved {
            predicted: Some(true)
        }
        .blocks_dispatch());
    }
}
