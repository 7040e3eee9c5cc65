//! Index-space slicing and point enumeration.
//!
//! The mapper splits a domain into fragments; each fragment becomes a slice
//! whose denominator is the parent's multiplied by the fragment count, so
//! recursive re-slicing of unknown depth still sums to exactly one. Slice
//! volumes and disjointness are hard runtime invariants here, relaxed only
//! under `EngineConfig::unsafe_mapper`.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, ErrorKind, MapperViolation, Result};
use crate::mapper::SliceDescriptor;
use crate::record::{KindState, OpCell, PointState, SliceOwner, SliceState, Stage};
use crate::types::{IndexDomain, OpId, RegionSelection};

use super::TaskEngine;

impl TaskEngine {
    /// Dispatches a ready index task: slice its whole domain.
    pub(crate) fn run_index(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let (domain, owner) = {
            let mut state = cell.state.lock();
            state.lifecycle.advance(Stage::Mapping);
            match &state.kind {
                KindState::Index(s) => (s.domain, SliceOwner::Local(cell.id)),
                _ => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_unique_id(cell.unique)
                        .with_node(self.config.node))
                }
            }
        };
        if domain.is_empty() {
            // Nothing to map or run; the launch completes immediately with
            // its aggregation identity.
            let (transition, mapped_event) = {
                let mut state = cell.state.lock();
                state.lifecycle.advance(Stage::Mapped);
                (state.lifecycle.record_complete(), state.mapped_event)
            };
            self.events.trigger(mapped_event);
            if transition == Some(crate::record::Transition::Complete) {
                self.apply_complete_transition(cell)?;
            }
            return Ok(());
        }
        let slices = self.slice_index_space(cell, domain, 1, owner)?;
        self.trigger_slices(cell, slices)
    }

    /// Dispatches a ready recursive slice: slice its sub-domain again. The
    /// parent slice dissolves; its share is covered by the children's
    /// refined denominators.
    pub(crate) fn reslice(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let (domain, denominator, owner) = {
            let state = cell.state.lock();
            match &state.kind {
                KindState::Slice(s) => (s.domain, s.denominator, s.owner),
                _ => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_unique_id(cell.unique)
                        .with_node(self.config.node))
                }
            }
        };
        let slices = self.slice_index_space(cell, domain, denominator, owner)?;
        let result = self.trigger_slices(cell, slices);
        self.deactivate(cell.id);
        result
    }

    /// Calls the policy once with the remaining sub-domain and turns the
    /// returned fragments into child slices.
    pub(crate) fn slice_index_space(
        self: &Arc<Self>,
        cell: &Arc<OpCell>,
        domain: IndexDomain,
        parent_denominator: u64,
        owner: SliceOwner,
    ) -> Result<Vec<OpId>> {
        let output = self.mapper.slice_domain(&cell.profile(), domain);
        if !self.config.unsafe_mapper {
            self.validate_slices(cell, domain, &output.slices)?;
        }
        let denominator = parent_denominator * output.slices.len() as u64;
        debug!(
            op = %cell.unique,
            fragments = output.slices.len(),
            denominator,
            "sliced domain {domain:?}"
        );

        let slices = output
            .slices
            .into_iter()
            .map(|descriptor| self.spawn_slice(cell, &descriptor, denominator, owner))
            .collect();
        Ok(slices)
    }

    fn validate_slices(
        &self,
        cell: &Arc<OpCell>,
        domain: IndexDomain,
        slices: &[SliceDescriptor],
    ) -> Result<()> {
        let fail = |violation| {
            Error::new(violation)
                .with_task(cell.name.clone())
                .with_unique_id(cell.unique)
                .with_node(self.config.node)
        };
        if slices.is_empty() {
            return Err(fail(MapperViolation::EmptySliceSet));
        }
        for slice in slices {
            if slice.domain.is_empty() {
                return Err(fail(MapperViolation::EmptySliceDomain));
            }
            if slice.domain.dim() != domain.dim() {
                return Err(fail(MapperViolation::SliceDimensionMismatch {
                    expected: domain.dim(),
                    got: slice.domain.dim(),
                }));
            }
        }
        let total: u64 = slices.iter().map(|s| s.domain.volume()).sum();
        if total != domain.volume() {
            return Err(fail(MapperViolation::SliceVolumeMismatch {
                expected: domain.volume(),
                got: total,
            }));
        }
        for (i, a) in slices.iter().enumerate() {
            for b in &slices[i + 1..] {
                if a.domain.overlaps(&b.domain) {
                    return Err(fail(MapperViolation::SliceOverlap));
                }
            }
        }
        Ok(())
    }

    fn spawn_slice(
        &self,
        parent: &Arc<OpCell>,
        descriptor: &SliceDescriptor,
        denominator: u64,
        owner: SliceOwner,
    ) -> OpId {
        let parent_state = parent.state.lock();
        let mut slice_state = parent_state.clone_from(
            KindState::Slice({
                let mut s = SliceState::new(
                    descriptor.domain,
                    denominator,
                    owner,
                    descriptor.stealable,
                );
                s.recurse = descriptor.recurse;
                s
            }),
            false,
        );
        drop(parent_state);
        slice_state.target_proc = descriptor.target;
        slice_state.flags.stealable = descriptor.stealable;
        self.insert_cell(|id, unique| OpCell {
            id,
            unique,
            func: parent.func,
            name: parent.name.clone(),
            context: Arc::clone(&parent.context),
            state: Mutex::new(slice_state),
        })
    }

    /// Routes freshly-created slices: must-epoch members force-map now,
    /// remote targets are shipped, local ones queue.
    pub(crate) fn trigger_slices(self: &Arc<Self>, parent: &Arc<OpCell>, slices: Vec<OpId>) -> Result<()> {
        let must_epoch = parent.state.lock().must_epoch.is_some();
        for slice_id in slices {
            let slice = self.with_op(slice_id)?;
            if must_epoch {
                // Joint-mapping groups map synchronously; queueing could
                // interleave another group member's mapping.
                let recurse = matches!(&slice.state.lock().kind, KindState::Slice(s) if s.recurse);
                if recurse {
                    self.reslice(&slice)?;
                } else {
                    self.enumerate_points(&slice)?;
                }
                continue;
            }
            let (remote, origin_mapped) = {
                let state = slice.state.lock();
                (
                    state.target_proc.node != self.config.node,
                    state.flags.origin_mapped,
                )
            };
            if remote && !origin_mapped {
                self.distribute_task(&slice)?;
            } else {
                self.enqueue_ready(slice_id);
            }
        }
        Ok(())
    }

    /// Expands a non-recursive slice into one point task per domain element,
    /// evaluating the projection function for every non-singular requirement.
    pub(crate) fn enumerate_points(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let (domain, stealable, must_epoch) = {
            let mut state = cell.state.lock();
            state.lifecycle.advance(Stage::Mapping);
            match &state.kind {
                KindState::Slice(s) => (s.domain, s.stealable, state.must_epoch.is_some()),
                _ => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_unique_id(cell.unique)
                        .with_node(self.config.node))
                }
            }
        };

        let mut point_ids = Vec::with_capacity(domain.volume() as usize);
        for point in domain.points() {
            let mut point_state = {
                let mut state = cell.state.lock();
                state.lifecycle.record_child_added();
                let mut ps = state.clone_from(
                    KindState::Point(PointState {
                        point,
                        slice: cell.id,
                        termination: self.events.create(),
                        result: None,
                    }),
                    false,
                );
                ps.flags.stealable = stealable;
                ps
            };
            // Rewrite projection requirements to the concrete region this
            // point accesses.
            for (idx, req) in point_state.requirements.iter_mut().enumerate() {
                if !req.selection.is_projection() {
                    continue;
                }
                let projection_id = match req.selection {
                    RegionSelection::PartitionProjection(_, id)
                    | RegionSelection::RegionProjection(_, id) => id,
                    RegionSelection::Singular(_) => unreachable!("checked is_projection"),
                };
                let projection = self
                    .projections
                    .lock()
                    .get(&projection_id)
                    .cloned()
                    .ok_or_else(|| {
                        Error::new(ErrorKind::UnknownProjection)
                            .with_task(cell.name.clone())
                            .with_unique_id(cell.unique)
                            .with_requirement(idx as u32)
                            .with_node(self.config.node)
                    })?;
                let region = projection(req.selection, point);
                req.selection = RegionSelection::Singular(region);
            }
            let point_id = self.insert_cell(|id, unique| OpCell {
                id,
                unique,
                func: cell.func,
                name: cell.name.clone(),
                context: Arc::clone(&cell.context),
                state: Mutex::new(point_state),
            });
            point_ids.push(point_id);
        }

        let volume = domain.volume();
        {
            let mut state = cell.state.lock();
            if let KindState::Slice(s) = &mut state.kind {
                s.points = point_ids.clone();
                s.expected_points = volume;
                s.unmapped = volume;
                s.incomplete = volume;
                s.uncommitted = volume;
            }
            // Enumeration is this slice's own work; from here only the
            // points' callbacks remain.
            let transition = state.lifecycle.record_complete();
            debug_assert!(transition.is_none(), "slice completed with points pending");
        }
        trace!(op = %cell.unique, points = volume, "enumerated points");

        for point_id in point_ids {
            if must_epoch {
                let point = self.with_op(point_id)?;
                self.map_and_launch(&point)?;
            } else {
                self.enqueue_ready(point_id);
            }
        }
        Ok(())
    }
}
