//! Launch entry points and the operation lifecycle base.
//!
//! `launch_individual`/`launch_index` create records, run privilege checks,
//! ask the mapper for initial options, and hand the operation to dependence
//! analysis. The tri-phase transition effects for every kind live here too:
//! fan-in modules compute *when* a transition fires, this module applies
//! what it *does*.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::context::Context;
use crate::error::{Error, ErrorKind, PrivilegeViolation, Result};
use crate::event::EventHandle;
use crate::record::{
    IndexState, IndividualState, KindState, OpCell, OpState, PredicateState, Transition,
};
use crate::resource::ResourceTracker;
use crate::types::{
    FutureValue, IndexDomain, MustEpochId, OpId, RedopId, RegionRequirement, RegionSelection,
    TaskFuncId,
};

use super::TaskEngine;

/// Everything the application supplies for one launch.
pub struct TaskDesc {
    /// Task function to run.
    pub func: TaskFuncId,
    /// Registered task name, for diagnostics.
    pub name: String,
    /// Parent context the launch belongs to.
    pub context: Context,
    /// Declared region accesses.
    pub requirements: Vec<RegionRequirement>,
    /// Opaque argument payload.
    pub arg: Vec<u8>,
    /// Future preconditions for dispatch.
    pub futures: Vec<EventHandle>,
    /// Grant events to acquire before dispatch.
    pub grants: Vec<EventHandle>,
    /// Phase barriers to wait on before dispatch.
    pub barriers: Vec<EventHandle>,
    /// Predicate state at launch.
    pub predicate: PredicateState,
    /// Result substituted if the predicate resolves false.
    pub predicate_default: Option<FutureValue>,
}

impl TaskDesc {
    /// A bare launch of `func` under `context`.
    #[must_use]
    pub fn new(func: TaskFuncId, name: impl Into<String>, context: Context) -> Self {
        Self {
            func,
            name: name.into(),
            context,
            requirements: Vec::new(),
            arg: Vec::new(),
            futures: Vec::new(),
            grants: Vec::new(),
            barriers: Vec::new(),
            predicate: PredicateState::True,
            predicate_default: None,
        }
    }

    /// Adds a region requirement.
    #[must_use]
    pub fn with_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }

    /// Sets the argument payload.
    #[must_use]
    pub fn with_arg(mut self, arg: Vec<u8>) -> Self {
        self.arg = arg;
        self
    }

    /// Launches under an unresolved predicate with `default` as the result
    /// substituted on a false resolution.
    #[must_use]
    pub fn with_predicate(mut self, default: FutureValue) -> Self {
        self.predicate = PredicateState::Unresolved { predicted: None };
        self.predicate_default = Some(default);
        self
    }
}

/// Shape of an index launch: the domain plus the aggregation mode.
#[derive(Clone, Copy, Debug)]
pub struct IndexLaunch {
    /// Launch domain.
    pub domain: IndexDomain,
    /// Reduction operator; `None` produces a future map instead.
    pub redop: Option<RedopId>,
    /// Fold in lexicographic point order, independent of arrival order.
    pub deterministic: bool,
}

impl IndexLaunch {
    /// An index launch aggregating into a future map.
    #[must_use]
    pub const fn future_map(domain: IndexDomain) -> Self {
        Self {
            domain,
            redop: None,
            deterministic: false,
        }
    }

    /// An index launch folding point results through `redop`.
    #[must_use]
    pub const fn reduction(domain: IndexDomain, redop: RedopId, deterministic: bool) -> Self {
        Self {
            domain,
            redop: Some(redop),
            deterministic,
        }
    }
}

impl TaskEngine {
    /// Launches one individual task. Returns the live operation id; the
    /// record is reclaimed after commit.
    pub fn launch_individual(self: &Arc<Self>, desc: TaskDesc) -> Result<OpId> {
        let kind = KindState::Individual(IndividualState {
            result: None,
            predicate_default: desc.predicate_default.clone(),
            dispatched: false,
        });
        self.launch_common(desc, kind, false)
    }

    /// Launches an index-space task over `launch.domain`.
    pub fn launch_index(self: &Arc<Self>, desc: TaskDesc, launch: IndexLaunch) -> Result<OpId> {
        if let Some(redop) = launch.redop {
            if self.redops.get(redop).is_none() {
                return Err(Error::new(ErrorKind::UnknownReductionOp)
                    .with_task(desc.name)
                    .with_node(self.config.node));
            }
        }
        let mut state = IndexState::new(launch.domain, launch.redop, launch.deterministic);
        state.predicate_default = desc.predicate_default.clone();
        self.launch_common(desc, KindState::Index(state), true)
    }

    fn launch_common(
        self: &Arc<Self>,
        desc: TaskDesc,
        kind: KindState,
        is_index: bool,
    ) -> Result<OpId> {
        let placeholder = crate::types::ProcId::cpu(self.config.node, 0);
        let op = self.insert_cell(|id, unique| {
            let mut state = OpState::new(kind, placeholder);
            state.requirements = desc.requirements;
            state.arg = Arc::from(desc.arg.as_slice());
            state.future_preconditions = desc.futures;
            state.grants = desc.grants;
            state.barriers = desc.barriers;
            state.predicate = desc.predicate;
            state.mapped_event = self.events.create();
            state.completion_event = self.events.create();
            state.commit_event = self.events.create();
            OpCell {
                id,
                unique,
                func: desc.func,
                name: desc.name,
                context: desc.context,
                state: Mutex::new(state),
            }
        });
        let cell = self.with_op(op)?;

        if let Err(err) = self.perform_privilege_checks(&cell, is_index) {
            self.deactivate(op);
            return Err(err);
        }

        let profile = cell.profile();
        let options = self.mapper.select_task_options(&profile);
        {
            let mut state = cell.state.lock();
            state.target_proc = options.initial_proc;
            state.flags.stealable = options.stealable;
            state.flags.origin_mapped = options.origin_mapped;
            state.flags.replicated = options.replicate;
        }
        cell.context.increment_outstanding();
        debug!(op = %cell.unique, task = %cell.name, target = %options.initial_proc, "launched");

        let ready = {
            let state = cell.state.lock();
            self.analysis
                .register_dependences(cell.unique, &state.requirements)
        };
        let engine = Arc::clone(self);
        self.events.register(
            ready,
            Box::new(move || {
                if let Err(err) = engine.schedule(op) {
                    engine.record_failure(err);
                }
            }),
        );
        Ok(op)
    }

    /// Binds `op` into a must-epoch joint-mapping group at `index`.
    pub fn set_must_epoch(&self, op: OpId, epoch: MustEpochId, index: u32) -> Result<()> {
        let cell = self.with_op(op)?;
        cell.state.lock().must_epoch = Some((epoch, index));
        self.must_epochs.lock().entry(epoch).or_default().push(op);
        Ok(())
    }

    /// Validates every requirement against the parent's privileges and
    /// self-consistency. Any violation is fatal and enumerated; nothing is
    /// silently corrected.
    pub(crate) fn perform_privilege_checks(&self, cell: &OpCell, is_index: bool) -> Result<()> {
        let state = cell.state.lock();
        for (idx, req) in state.requirements.iter().enumerate() {
            self.check_requirement(cell, req, is_index).map_err(|err| {
                err.with_task(cell.name.clone())
                    .with_unique_id(cell.unique)
                    .with_requirement(idx as u32)
                    .with_node(self.config.node)
            })?;
        }
        Ok(())
    }

    fn check_requirement(
        &self,
        cell: &OpCell,
        req: &RegionRequirement,
        is_index: bool,
    ) -> Result<()> {
        use PrivilegeViolation as V;

        if req.fields.is_empty() {
            return Err(Error::new(V::MissingFields));
        }
        if let Some(field) = req.duplicate_field() {
            return Err(Error::new(V::DuplicateField { field }));
        }
        if req.selection.is_projection() && !is_index {
            return Err(Error::new(V::ProjectionOnIndividualLaunch));
        }

        let parent = req.parent;
        if !self.region_tree.region_live(parent) {
            return Err(Error::new(V::InvalidRegionHandle));
        }
        let field_space = match req.selection {
            RegionSelection::Singular(region) | RegionSelection::RegionProjection(region, _) => {
                if !self.region_tree.region_live(region) {
                    return Err(Error::new(V::InvalidRegionHandle));
                }
                if region.tree != parent.tree {
                    return Err(Error::new(V::RegionTreeMismatch));
                }
                if !self.region_tree.is_subregion(region, parent) {
                    return Err(Error::new(V::RegionNotSubregion));
                }
                region.field_space
            }
            RegionSelection::PartitionProjection(partition, _) => {
                if !self.region_tree.partition_live(partition) {
                    return Err(Error::new(V::InvalidPartitionHandle));
                }
                if partition.tree != parent.tree {
                    return Err(Error::new(V::RegionTreeMismatch));
                }
                if !self.region_tree.partition_descends(partition, parent) {
                    return Err(Error::new(V::PartitionNotSubpartition));
                }
                if req.privilege.is_write() && !self.region_tree.partition_disjoint(partition) {
                    return Err(Error::new(V::NonDisjointWriteProjection));
                }
                partition.field_space
            }
        };
        if field_space != parent.field_space {
            return Err(Error::new(V::FieldSpaceMismatch));
        }
        for &field in &req.fields {
            if !self.region_tree.field_allocated(field_space, field) {
                return Err(Error::new(V::FieldNotInFieldSpace { field }));
            }
        }

        match (req.privilege.is_reduce(), req.redop) {
            (true, None) => return Err(Error::new(V::MissingReductionOp)),
            (false, Some(_)) => return Err(Error::new(V::ReductionOpOnNonReduce)),
            (true, Some(redop)) => {
                if self.redops.get(redop).is_none() {
                    return Err(Error::new(ErrorKind::UnknownReductionOp));
                }
            }
            (false, None) => {}
        }

        let Some(parent_req) = cell.context.find_parent_requirement(parent) else {
            return Err(Error::new(V::ParentPrivilegeMissing));
        };
        for &field in &req.fields {
            if !parent_req.fields.contains(&field) {
                return Err(Error::new(V::FieldMissingFromParent { field }));
            }
        }
        if !req.privilege.within(parent_req.privilege) {
            return Err(Error::new(V::InsufficientParentPrivilege {
                held: parent_req.privilege,
                requested: req.privilege,
            }));
        }
        Ok(())
    }

    /// Moves a dependence-ready operation toward execution: resolves
    /// speculation, migrates if the target is remote, else enqueues locally.
    pub(crate) fn schedule(self: &Arc<Self>, op: OpId) -> Result<()> {
        let cell = self.with_op(op)?;
        enum Next {
            Run,
            Park,
            FalsePredicate,
        }
        let next = {
            let mut state = cell.state.lock();
            match state.predicate {
                PredicateState::True | PredicateState::Unresolved {
                    predicted: Some(true),
                } => Next::Run,
                PredicateState::False => Next::FalsePredicate,
                PredicateState::Unresolved { predicted: None } => {
                    drop(state);
                    let speculation = self.mapper.speculate(&cell.profile());
                    let mut state = cell.state.lock();
                    // Only a predicted-true speculation runs ahead; anything
                    // else parks until the predicate resolves.
                    if speculation.speculate && speculation.predicted_value {
                        state.predicate = PredicateState::Unresolved {
                            predicted: Some(true),
                        };
                        state.flags.speculated = true;
                        Next::Run
                    } else {
                        Next::Park
                    }
                }
                PredicateState::Unresolved { predicted: Some(false) } => Next::Park,
            }
        };
        match next {
            Next::Park => {
                trace!(op = %cell.unique, "parked on unresolved predicate");
                Ok(())
            }
            Next::FalsePredicate => self.complete_with_default(&cell),
            Next::Run => {
                let (remote, origin_mapped) = {
                    let state = cell.state.lock();
                    (
                        state.target_proc.node != self.config.node,
                        state.flags.origin_mapped,
                    )
                };
                if remote && !origin_mapped {
                    self.distribute_task(&cell)
                } else {
                    self.enqueue_ready(op);
                    Ok(())
                }
            }
        }
    }

    /// Driver entry: one task's execution finished with `result` and the
    /// resource side effects in `tracker`.
    pub fn complete_execution(
        self: &Arc<Self>,
        op: OpId,
        result: FutureValue,
        tracker: ResourceTracker,
    ) -> Result<()> {
        let cell = self.with_op(op)?;
        let transition = {
            let mut state = cell.state.lock();
            // A post-dispatch false predicate discards the real result and
            // replays with the default.
            let effective = if state.predicate == PredicateState::False {
                self.default_result(&state)
            } else {
                result
            };
            match &mut state.kind {
                KindState::Individual(s) => s.result = Some(effective),
                KindState::Point(s) => s.result = Some(effective),
                KindState::Shard(s) => s.result = Some(effective),
                KindState::Index(_) | KindState::Slice(_) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_unique_id(cell.unique)
                        .with_node(self.config.node));
                }
            }
            state.tracker.merge(&tracker);
            state.lifecycle.record_complete()
        };
        if transition == Some(Transition::Complete) {
            self.apply_complete_transition(&cell)?;
        }
        Ok(())
    }

    pub(crate) fn default_result(&self, state: &OpState) -> FutureValue {
        match &state.kind {
            KindState::Individual(s) => s.predicate_default.clone().unwrap_or_default(),
            KindState::Index(s) => s.predicate_default.clone().unwrap_or_default(),
            _ => FutureValue::empty(),
        }
    }

    /// Applies the effects of a completion transition that already fired.
    /// Called without the operation's lock held.
    pub(crate) fn apply_complete_transition(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        enum Effect {
            Individual {
                result: FutureValue,
                tracker: ResourceTracker,
                remote_of: Option<crate::types::RemoteOpId>,
            },
            Point {
                slice: OpId,
                point: crate::types::DomainPoint,
                result: FutureValue,
                tracker: ResourceTracker,
                termination: EventHandle,
            },
            Slice,
            Index,
            Shard {
                manager: OpId,
                shard: u32,
                result: FutureValue,
                tracker: ResourceTracker,
            },
        }
        let (effect, completion_event) = {
            let state = cell.state.lock();
            let effect = match &state.kind {
                KindState::Individual(s) => Effect::Individual {
                    result: s.result.clone().unwrap_or_default(),
                    tracker: state.tracker.clone(),
                    remote_of: state.remote_of,
                },
                KindState::Point(s) => Effect::Point {
                    slice: s.slice,
                    point: s.point,
                    result: s.result.clone().unwrap_or_default(),
                    tracker: state.tracker.clone(),
                    termination: s.termination,
                },
                KindState::Slice(_) => Effect::Slice,
                KindState::Index(_) => Effect::Index,
                KindState::Shard(s) => Effect::Shard {
                    manager: s.manager,
                    shard: s.shard,
                    result: s.result.clone().unwrap_or_default(),
                    tracker: state.tracker.clone(),
                },
            };
            (effect, state.completion_event)
        };
        self.events.trigger(completion_event);

        match effect {
            Effect::Individual {
                result,
                tracker,
                remote_of,
            } => {
                match remote_of {
                    Some(owner) => self.send_remote_result(owner, &result, &tracker)?,
                    None => {
                        cell.context.receive_future(cell.unique, result);
                        cell.context.return_privilege_state(cell.unique, &tracker);
                    }
                }
                self.request_commit(cell)
            }
            Effect::Point {
                slice,
                point,
                result,
                tracker,
                termination,
            } => {
                self.events.trigger(termination);
                self.record_point_complete(slice, point, result, tracker)?;
                self.request_commit(cell)
            }
            Effect::Slice => {
                self.report_slice_complete(cell)?;
                self.request_commit(cell)
            }
            Effect::Index => self.finish_index_complete(cell),
            Effect::Shard {
                manager,
                shard,
                result,
                tracker,
            } => {
                self.record_shard_complete(manager, shard, result, tracker)?;
                self.request_commit(cell)
            }
        }
    }

    /// Requests this operation's commit; the commit barrier fires once all
    /// children have committed.
    pub(crate) fn request_commit(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let transition = cell.state.lock().lifecycle.record_commit_request();
        if transition == Some(Transition::Commit) {
            self.apply_commit_transition(cell)?;
        }
        Ok(())
    }

    /// Applies the effects of a commit transition that already fired.
    pub(crate) fn apply_commit_transition(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        enum Effect {
            TopLevel,
            Point { slice: OpId },
            Slice,
            Shard { manager: OpId },
        }
        let (effect, commit_event, remote_of) = {
            let state = cell.state.lock();
            let effect = match &state.kind {
                KindState::Individual(_) | KindState::Index(_) => Effect::TopLevel,
                KindState::Point(s) => Effect::Point { slice: s.slice },
                KindState::Slice(_) => Effect::Slice,
                KindState::Shard(s) => Effect::Shard { manager: s.manager },
            };
            (effect, state.commit_event, state.remote_of)
        };
        self.events.trigger(commit_event);
        debug!(op = %cell.unique, kind = cell.kind_name(), "committed");

        match effect {
            Effect::TopLevel => {
                if remote_of.is_none() {
                    cell.context.decrement_outstanding();
                }
                self.deactivate(cell.id);
                Ok(())
            }
            Effect::Point { slice } => {
                self.deactivate(cell.id);
                self.record_point_committed(slice)
            }
            Effect::Slice => {
                let result = self.report_slice_commit(cell);
                self.deactivate(cell.id);
                result
            }
            Effect::Shard { manager } => {
                self.deactivate(cell.id);
                self.record_shard_committed(manager)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RecordingContext;
    use crate::error::ErrorKind;
    use crate::test_utils::engine_on;
    use crate::types::{
        FieldId, FieldSpaceId, IndexPartitionId, IndexSpaceId, LogicalPartition, LogicalRegion,
        NodeId, Privilege, ProjectionId,
    };

    const FIELD: FieldId = FieldId(1);

    fn region(n: u32) -> LogicalRegion {
        LogicalRegion::new(0, IndexSpaceId(n), FieldSpaceId(1))
    }

    fn ctx_holding(req: RegionRequirement) -> Arc<RecordingContext> {
        RecordingContext::with_privileges(vec![req])
    }

    fn desc(ctx: Arc<RecordingContext>, req: RegionRequirement) -> TaskDesc {
        TaskDesc::new(TaskFuncId(1), "checked", ctx).with_requirement(req)
    }

    #[test]
    fn child_privilege_must_fit_within_the_parents() {
        let engine = engine_on(NodeId(0));
        let ctx = ctx_holding(RegionRequirement::read(region(1), region(1), &[FIELD]));
        let err = engine
            .launch_individual(desc(
                ctx.clone(),
                RegionRequirement::write(region(1), region(1), &[FIELD]),
            ))
            .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Privilege(PrivilegeViolation::InsufficientParentPrivilege {
                held: Privilege::ReadOnly,
                requested: Privilege::ReadWrite,
            })
        );
        assert_eq!(err.diag.requirement, Some(0));
        // The failed launch leaves nothing behind.
        assert_eq!(ctx.outstanding(), 0);
        assert!(engine.live_ops().is_empty());
    }

    #[test]
    fn parent_must_hold_a_requirement_on_the_named_region() {
        let engine = engine_on(NodeId(0));
        let ctx = Arc::new(RecordingContext::new());
        let err = engine
            .launch_individual(desc(
                ctx,
                RegionRequirement::read(region(1), region(1), &[FIELD]),
            ))
            .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Privilege(PrivilegeViolation::ParentPrivilegeMissing)
        );
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let engine = engine_on(NodeId(0));
        let ctx = ctx_holding(RegionRequirement::write(region(1), region(1), &[FIELD]));
        let err = engine
            .launch_individual(desc(
                ctx,
                RegionRequirement::read(region(1), region(1), &[FIELD, FIELD]),
            ))
            .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Privilege(PrivilegeViolation::DuplicateField { field: FIELD })
        );
    }

    #[test]
    fn projection_requirements_need_an_index_launch() {
        let engine = engine_on(NodeId(0));
        let ctx = ctx_holding(RegionRequirement::write(region(1), region(1), &[FIELD]));
        let mut req = RegionRequirement::read(region(1), region(1), &[FIELD]);
        req.selection = RegionSelection::RegionProjection(region(1), ProjectionId(9));
        let err = engine.launch_individual(desc(ctx, req)).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Privilege(PrivilegeViolation::ProjectionOnIndividualLaunch)
        );
    }

    #[test]
    fn reduce_privilege_requires_an_operator() {
        let engine = engine_on(NodeId(0));
        let ctx = ctx_holding(RegionRequirement::write(region(1), region(1), &[FIELD]));
        let mut req = RegionRequirement::write(region(1), region(1), &[FIELD]);
        req.privilege = Privilege::Reduce;
        req.redop = None;
        let err = engine.launch_individual(desc(ctx, req)).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Privilege(PrivilegeViolation::MissingReductionOp)
        );
    }

    #[test]
    fn index_launch_rejects_an_unregistered_reduction() {
        let engine = engine_on(NodeId(0));
        let ctx = Arc::new(RecordingContext::new());
        let err = engine
            .launch_index(
                TaskDesc::new(TaskFuncId(1), "unregistered", ctx),
                IndexLaunch::reduction(IndexDomain::d1(0, 3), RedopId(77), false),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownReductionOp);
    }

    #[test]
    fn write_projections_need_a_disjoint_partition() {
        let engine = engine_on(NodeId(0));
        let ctx = ctx_holding(RegionRequirement::write(region(1), region(1), &[FIELD]));
        let partition = LogicalPartition::new(0, IndexPartitionId(4), FieldSpaceId(1));
        let mut req = RegionRequirement::write(region(1), region(1), &[FIELD]);
        req.selection = RegionSelection::PartitionProjection(partition, ProjectionId(9));
        let err = engine
            .launch_index(
                desc(ctx, req),
                IndexLaunch::future_map(IndexDomain::d1(0, 3)),
            )
            .unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Privilege(PrivilegeViolation::NonDisjointWriteProjection)
        );
    }
}
