//! Single-execution mapping and dispatch.
//!
//! One task bound to one processor: mapper invocation, exhaustive output
//! validation, instance registration, and the execution precondition. The
//! mapper's output is untrusted; every check in `finalize_map_task_output`
//! is skipped only under `EngineConfig::unsafe_mapper`.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorKind, MapperViolation, Result};
use crate::event::EventHandle;
use crate::mapper::{MapInput, MapOutput, TaskProfile};
use crate::record::{KindState, OpCell, ShardState, Stage, Transition};
use crate::region_tree::{AcquireResult, ChosenMapping, InstanceRef};
use crate::resource::ResourceTracker;
use crate::types::{FutureValue, OpId, Privilege, RegionRequirement, RegionSelection};

use super::TaskEngine;

impl TaskEngine {
    /// Maps and dispatches one ready single-execution task (individual,
    /// point, or shard).
    pub(crate) fn map_and_launch(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let replicated = {
            let mut state = cell.state.lock();
            state.lifecycle.advance(Stage::Mapping);
            state.flags.replicated && matches!(state.kind, KindState::Individual(_))
        };
        let profile = cell.profile();
        let input = self.build_map_input(&profile);
        if replicated {
            self.invoke_mapper_replicated(cell, &profile, &input)
        } else {
            let output = self.invoke_mapper(&profile, &input);
            self.apply_map_output(cell, output)
        }
    }

    /// Builds the policy input: valid candidates per requirement plus any
    /// premapped choices.
    fn build_map_input(&self, profile: &TaskProfile) -> MapInput {
        let premap = self.mapper.premap_task(profile);
        let mut premapped: Vec<Option<Vec<InstanceRef>>> =
            vec![None; profile.requirements.len()];
        for (idx, instances) in premap.premapped {
            if let Some(slot) = premapped.get_mut(idx as usize) {
                *slot = Some(instances);
            }
        }
        let valid = profile
            .requirements
            .iter()
            .map(|req| {
                if req.privilege == Privilege::None {
                    Vec::new()
                } else {
                    self.region_tree.valid_instances(req)
                }
            })
            .collect();
        MapInput { valid, premapped }
    }

    fn invoke_mapper(&self, profile: &TaskProfile, input: &MapInput) -> MapOutput {
        self.mapper.map_task(profile, input)
    }

    /// Replicated mapping: the policy returns one output per shard. A single
    /// output collapses back to the ordinary path; two or more spin up one
    /// shard record per output under this record as the manager.
    pub(crate) fn invoke_mapper_replicated(
        self: &Arc<Self>,
        cell: &Arc<OpCell>,
        profile: &TaskProfile,
        input: &MapInput,
    ) -> Result<()> {
        let mut outputs = self.mapper.replicate_task(profile, input);
        if outputs.len() <= 1 {
            let output = outputs.pop().ok_or_else(|| {
                self.mapper_error(cell, MapperViolation::NoTargetProcessors, None)
            })?;
            return self.apply_map_output(cell, output);
        }
        if !self.config.unsafe_mapper {
            self.validate_replicated_outputs(cell, &outputs)?;
        }

        let total = outputs.len() as u32;
        debug!(op = %cell.unique, shards = total, "control-replicated mapping");
        let shard_ids: Vec<OpId> = {
            let mut state = cell.state.lock();
            (0..total)
                .map(|shard| {
                    state.lifecycle.record_child_added();
                    let kind = KindState::Shard(ShardState {
                        shard,
                        total,
                        manager: cell.id,
                        result: None,
                    });
                    let shard_state = state.clone_from(kind, false);
                    self.insert_cell(|id, unique| OpCell {
                        id,
                        unique,
                        func: cell.func,
                        name: format!("{}[s{shard}]", cell.name),
                        context: Arc::clone(&cell.context),
                        state: Mutex::new(shard_state),
                    })
                })
                .collect()
        };
        for (shard_id, output) in shard_ids.into_iter().zip(outputs) {
            let shard_cell = self.with_op(shard_id)?;
            shard_cell.state.lock().lifecycle.advance(Stage::Mapping);
            self.apply_map_output(&shard_cell, output)?;
        }
        // The manager delegates execution entirely; its completion now waits
        // only on the shards.
        let transition = cell.state.lock().lifecycle.record_complete();
        if transition == Some(Transition::Complete) {
            self.apply_complete_transition(cell)?;
        }
        Ok(())
    }

    fn validate_replicated_outputs(&self, cell: &Arc<OpCell>, outputs: &[MapOutput]) -> Result<()> {
        for (shard, output) in outputs.iter().enumerate() {
            if output.mappings.iter().any(|m| m.virtual_map) {
                return Err(self.mapper_error(
                    cell,
                    MapperViolation::ReplicatedVirtualMapping {
                        shard: shard as u32,
                    },
                    None,
                ));
            }
        }
        let replicable = outputs[0].variant.replicable;
        if outputs.iter().any(|o| o.variant.replicable != replicable) {
            return Err(self.mapper_error(cell, MapperViolation::ReplicatedVariantMismatch, None));
        }
        let requirements = cell.state.lock().requirements.clone();
        for (req_idx, req) in requirements.iter().enumerate() {
            if !req.privilege.is_write() {
                continue;
            }
            for a in 0..outputs.len() {
                for b in a + 1..outputs.len() {
                    let ids_a = shard_instances(&outputs[a], req_idx);
                    let ids_b = shard_instances(&outputs[b], req_idx);
                    if ids_a.iter().any(|id| ids_b.contains(id)) {
                        return Err(self.mapper_error(
                            cell,
                            MapperViolation::ReplicatedWritesNotDisjoint {
                                shard_a: a as u32,
                                shard_b: b as u32,
                            },
                            Some(req_idx as u32),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validates one mapping output, registers instances, and arms the
    /// execution precondition.
    pub(crate) fn apply_map_output(
        self: &Arc<Self>,
        cell: &Arc<OpCell>,
        output: MapOutput,
    ) -> Result<()> {
        let mappings = self.finalize_map_task_output(cell, &output)?;
        {
            let mut state = cell.state.lock();
            state.chosen = mappings.clone();
            state.variant = Some(output.variant);
            state.target_proc = output.target_procs[0];
            state.current_proc = output.target_procs[0];
        }
        let instance_ready = self.map_all_regions(cell, &mappings)?;
        self.finish_mapping(cell, instance_ready)
    }

    /// Converts policy output into validated instance sets.
    pub(crate) fn finalize_map_task_output(
        &self,
        cell: &Arc<OpCell>,
        output: &MapOutput,
    ) -> Result<Vec<ChosenMapping>> {
        let state = cell.state.lock();
        let requirements = state.requirements.clone();
        drop(state);

        if output.target_procs.is_empty() {
            return Err(self.mapper_error(cell, MapperViolation::NoTargetProcessors, None));
        }
        if self.config.unsafe_mapper {
            return Ok(self.collect_mappings_unchecked(&requirements, output));
        }
        let first = output.target_procs[0];
        if output.target_procs.iter().any(|p| p.kind != first.kind) {
            return Err(self.mapper_error(cell, MapperViolation::TargetProcessorsSpanKinds, None));
        }
        if output.target_procs.iter().any(|p| p.node != first.node) {
            return Err(self.mapper_error(cell, MapperViolation::TargetProcessorsSpanNodes, None));
        }

        let mut chosen = Vec::with_capacity(requirements.len());
        for (idx, req) in requirements.iter().enumerate() {
            let idx_u32 = idx as u32;
            if req.privilege == Privilege::None {
                chosen.push(ChosenMapping::default());
                continue;
            }
            let mapping = output.mappings.get(idx);
            let (instances, virtual_map) = match mapping {
                Some(m) => (m.instances.as_slice(), m.virtual_map),
                None => (&[][..], false),
            };

            if virtual_map {
                if req.privilege.is_reduce() {
                    return Err(self.mapper_error(
                        cell,
                        MapperViolation::VirtualMappingForReduction,
                        Some(idx_u32),
                    ));
                }
                if req.coherence != crate::types::Coherence::Exclusive {
                    return Err(self.mapper_error(
                        cell,
                        MapperViolation::VirtualMappingForNonExclusive,
                        Some(idx_u32),
                    ));
                }
                chosen.push(ChosenMapping {
                    instances: SmallVec::new(),
                    virtual_map: true,
                });
                continue;
            }

            // Every privilege field needs a covering instance.
            for &field in &req.fields {
                if !instances.iter().any(|i| i.fields.contains(&field)) {
                    return Err(self.mapper_error(
                        cell,
                        MapperViolation::UnmappedField { field },
                        Some(idx_u32),
                    ));
                }
            }
            for instance in instances {
                if !self.instance_satisfies(req, instance) {
                    return Err(self.mapper_error(
                        cell,
                        MapperViolation::InstanceDoesNotSatisfy,
                        Some(idx_u32),
                    ));
                }
                for &proc in &output.target_procs {
                    if !self.region_tree.visible_from(instance, proc) {
                        return Err(self.mapper_error(
                            cell,
                            MapperViolation::InstanceNotVisible {
                                memory: instance.memory,
                                proc,
                            },
                            Some(idx_u32),
                        ));
                    }
                }
                if req.privilege.is_reduce() {
                    if instance.redop != req.redop {
                        return Err(self.mapper_error(
                            cell,
                            MapperViolation::MissingReductionInstance,
                            Some(idx_u32),
                        ));
                    }
                } else if instance.is_reduction() {
                    return Err(self.mapper_error(
                        cell,
                        MapperViolation::ReductionInstanceForNonReduction,
                        Some(idx_u32),
                    ));
                }
            }
            chosen.push(ChosenMapping {
                instances: instances.iter().cloned().collect(),
                virtual_map: false,
            });
        }
        Ok(chosen)
    }

    fn collect_mappings_unchecked(
        &self,
        requirements: &[RegionRequirement],
        output: &MapOutput,
    ) -> Vec<ChosenMapping> {
        requirements
            .iter()
            .enumerate()
            .map(|(idx, _)| match output.mappings.get(idx) {
                Some(m) => ChosenMapping {
                    instances: m.instances.iter().cloned().collect(),
                    virtual_map: m.virtual_map,
                },
                None => ChosenMapping::default(),
            })
            .collect()
    }

    fn instance_satisfies(&self, req: &RegionRequirement, instance: &InstanceRef) -> bool {
        match req.selection {
            RegionSelection::Singular(region) => {
                self.region_tree.is_subregion(region, instance.region)
            }
            // Projection requirements are rewritten to singular selections at
            // point enumeration; a projection seen here belongs to a whole
            // index task being force-mapped and is satisfied by tree match.
            RegionSelection::PartitionProjection(..) | RegionSelection::RegionProjection(..) => {
                req.selection.tree() == instance.region.tree
            }
        }
    }

    /// Registers finalized instances with the region-tree service. Versioning
    /// runs first; requirements with updates still in flight register after
    /// the settled ones so one slow region does not stall the rest.
    pub(crate) fn map_all_regions(
        &self,
        cell: &Arc<OpCell>,
        mappings: &[ChosenMapping],
    ) -> Result<EventHandle> {
        let requirements = cell.state.lock().requirements.clone();
        let mut settled = Vec::new();
        let mut deferred = Vec::new();
        for (idx, req) in requirements.iter().enumerate() {
            if req.privilege == Privilege::None || mappings[idx].virtual_map {
                continue;
            }
            let version = self.region_tree.version_info(req);
            if version.pending_updates {
                deferred.push((idx, version));
            } else {
                settled.push((idx, version));
            }
        }

        let mut ready = Vec::new();
        for (idx, version) in settled.into_iter().chain(deferred) {
            let req = &requirements[idx];
            let mapping = &mappings[idx];
            for instance in &mapping.instances {
                self.acquire_with_retry(cell, instance, idx as u32)?;
            }
            ready.push(
                self.region_tree
                    .register_instances(req, version, &mapping.instances),
            );
        }
        Ok(self.events.merge(&ready))
    }

    /// Pins one instance, retrying transient collector races with a warning.
    /// The fatal path is reserved for instances provably collected.
    fn acquire_with_retry(
        &self,
        cell: &Arc<OpCell>,
        instance: &InstanceRef,
        req_idx: u32,
    ) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.region_tree.acquire_instance(instance.id) {
                AcquireResult::Acquired => return Ok(()),
                AcquireResult::Retry if attempts < self.config.acquire_retries => {
                    attempts += 1;
                    warn!(
                        op = %cell.unique,
                        instance = instance.id.0,
                        attempt = attempts,
                        "instance acquisition lost a race, retrying"
                    );
                }
                AcquireResult::Retry | AcquireResult::Collected => {
                    return Err(Error::new(ErrorKind::InstanceCollected)
                        .with_task(cell.name.clone())
                        .with_unique_id(cell.unique)
                        .with_requirement(req_idx)
                        .with_node(self.config.node));
                }
            }
        }
    }

    /// Marks the record mapped, notifies the owning slice for points, and
    /// either distributes (origin-mapped remote targets) or arms dispatch.
    fn finish_mapping(self: &Arc<Self>, cell: &Arc<OpCell>, instance_ready: EventHandle) -> Result<()> {
        let (mapped_event, slice, remote_origin_mapped) = {
            let mut state = cell.state.lock();
            state.lifecycle.advance(Stage::Mapped);
            let slice = match &state.kind {
                KindState::Point(p) => Some(p.slice),
                _ => None,
            };
            let remote = state.target_proc.node != self.config.node && state.flags.origin_mapped;
            (state.mapped_event, slice, remote)
        };
        self.events.trigger(mapped_event);
        trace!(op = %cell.unique, "mapped");
        if let Some(slice) = slice {
            self.record_point_mapped(slice)?;
        }
        if remote_origin_mapped {
            return self.distribute_task(cell);
        }
        self.launch_task(cell, instance_ready)
    }

    /// Computes the execution precondition and arms dispatch on it: chosen
    /// instance readiness (skipped for inner variants), future readiness,
    /// grants and phase barriers.
    pub(crate) fn launch_task(
        self: &Arc<Self>,
        cell: &Arc<OpCell>,
        instance_ready: EventHandle,
    ) -> Result<()> {
        let mut parts: Vec<EventHandle> = Vec::new();
        {
            let state = cell.state.lock();
            let inner = state.variant.map_or(false, |v| v.inner);
            if !inner {
                parts.push(instance_ready);
            }
            parts.extend_from_slice(&state.future_preconditions);
            parts.extend_from_slice(&state.grants);
            parts.extend_from_slice(&state.barriers);
        }
        let precondition = self.events.merge(&parts);
        let engine = Arc::clone(self);
        let op = cell.id;
        self.events.register(
            precondition,
            Box::new(move || {
                if let Err(err) = engine.begin_execution(op) {
                    engine.record_failure(err);
                }
            }),
        );
        Ok(())
    }

    fn begin_execution(self: &Arc<Self>, op: OpId) -> Result<()> {
        let cell = self.with_op(op)?;
        let early_completion = {
            let mut state = cell.state.lock();
            state.lifecycle.advance(Stage::Executing);
            if let KindState::Individual(s) = &mut state.kind {
                s.dispatched = true;
            }
            let leaf = state.variant.map_or(false, |v| v.leaf);
            let no_virtual = state.chosen.iter().all(|m| !m.virtual_map);
            (leaf && no_virtual).then_some(state.completion_event)
        };
        trace!(op = %cell.unique, "dispatched");
        // Leaf variants with fully-materialized mappings expose their
        // completion handle as soon as the precondition is satisfied.
        if let Some(event) = early_completion {
            self.events.trigger(event);
        }
        Ok(())
    }

    /// One shard's completion callback into its manager.
    pub(crate) fn record_shard_complete(
        self: &Arc<Self>,
        manager: OpId,
        shard: u32,
        result: FutureValue,
        tracker: ResourceTracker,
    ) -> Result<()> {
        let cell = self.with_op(manager)?;
        let transition = {
            let mut state = cell.state.lock();
            state.tracker.merge(&tracker);
            if shard == 0 {
                if let KindState::Individual(s) = &mut state.kind {
                    s.result = Some(result);
                }
            }
            state.lifecycle.record_child_complete()
        };
        if transition == Some(Transition::Complete) {
            self.apply_complete_transition(&cell)?;
        }
        Ok(())
    }

    /// One shard's commit callback into its manager.
    pub(crate) fn record_shard_committed(self: &Arc<Self>, manager: OpId) -> Result<()> {
        let cell = self.with_op(manager)?;
        let transition = cell.state.lock().lifecycle.record_child_committed();
        if transition == Some(Transition::Commit) {
            self.apply_commit_transition(&cell)?;
        }
        Ok(())
    }

    fn mapper_error(
        &self,
        cell: &Arc<OpCell>,
        violation: MapperViolation,
        requirement: Option<u32>,
    ) -> Error {
        let mut err = Error::new(violation)
            .with_task(cell.name.clone())
            .with_unique_id(cell.unique)
            .with_node(self.config.node);
        if let Some(idx) = requirement {
            err = err.with_requirement(idx);
        }
        err
    }
}

fn shard_instances(output: &MapOutput, req_idx: usize) -> Vec<crate::region_tree::InstanceId> {
    output
        .mappings
        .get(req_idx)
        .map(|m| m.instances.iter().map(|i| i.id).collect())
        .unwrap_or_default()
}
