//! The index/slice fan-in protocol.
//!
//! Points report upward to their slice, which decrements one of three
//! counters under its own lock; a counter reaching zero triggers the slice's
//! matching transition exactly once. A transitioning slice reports into the
//! owning index task directly (same node) or over the wire (remote owner).
//! The index task accumulates `fraction += 1/denominator` and its point
//! counters; its own transitions fire only once the fraction is exactly
//! whole and the relevant counter equals the running total.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::record::{KindState, OpCell, SliceOwner, Stage, Transition};
use crate::resource::ResourceTracker;
use crate::types::{DomainPoint, FutureValue, OpId};

use super::TaskEngine;

impl TaskEngine {
    /// One point finished mapping; called by the point's mapping path.
    pub(crate) fn record_point_mapped(self: &Arc<Self>, slice: OpId) -> Result<()> {
        let cell = self.with_op(slice)?;
        let report = {
            let mut state = cell.state.lock();
            let KindState::Slice(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            debug_assert!(s.unmapped > 0, "unmatched point-mapped callback");
            s.unmapped -= 1;
            if s.unmapped == 0 && !s.reported_mapped {
                s.reported_mapped = true;
                state.lifecycle.advance(Stage::Mapped);
                let KindState::Slice(s) = &state.kind else {
                    unreachable!()
                };
                Some((s.owner, s.denominator, s.expected_points))
            } else {
                None
            }
        };
        match report {
            Some((owner, denominator, points)) => {
                trace!(op = %cell.unique, denominator, points, "slice mapped");
                self.deliver_slice_mapped(owner, denominator, points)
            }
            None => Ok(()),
        }
    }

    /// One point's completion callback: stores its result, decrements the
    /// slice's incomplete counter, and fires the slice completion when both
    /// the counter and the lifecycle agree.
    pub(crate) fn record_point_complete(
        self: &Arc<Self>,
        slice: OpId,
        point: DomainPoint,
        result: FutureValue,
        tracker: ResourceTracker,
    ) -> Result<()> {
        let cell = self.with_op(slice)?;
        let transition = {
            let mut state = cell.state.lock();
            let KindState::Slice(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            if s.collected.insert(point, result).is_some() {
                return Err(Error::new(ErrorKind::DuplicatePointResult)
                    .with_task(cell.name.clone())
                    .with_unique_id(cell.unique)
                    .with_node(self.config.node));
            }
            s.collected_resources.merge(&tracker);
            debug_assert!(s.incomplete > 0, "unmatched point-complete callback");
            s.incomplete -= 1;
            state.lifecycle.record_child_complete()
        };
        if transition == Some(Transition::Complete) {
            self.apply_complete_transition(&cell)?;
        }
        Ok(())
    }

    /// One point's commit callback.
    pub(crate) fn record_point_committed(self: &Arc<Self>, slice: OpId) -> Result<()> {
        let cell = self.with_op(slice)?;
        let transition = {
            let mut state = cell.state.lock();
            if let KindState::Slice(s) = &mut state.kind {
                debug_assert!(s.uncommitted > 0, "unmatched point-commit callback");
                s.uncommitted -= 1;
            }
            state.lifecycle.record_child_committed()
        };
        if transition == Some(Transition::Commit) {
            self.apply_commit_transition(&cell)?;
        }
        Ok(())
    }

    /// Reports a completed slice upward with its collected results and
    /// resource state. Fires at most once per slice.
    pub(crate) fn report_slice_complete(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let report = {
            let mut state = cell.state.lock();
            let KindState::Slice(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            if s.reported_complete {
                None
            } else {
                s.reported_complete = true;
                let results: Vec<(DomainPoint, FutureValue)> =
                    s.collected.iter().map(|(p, v)| (*p, v.clone())).collect();
                Some((s.owner, s.expected_points, results, s.collected_resources.clone()))
            }
        };
        match report {
            Some((owner, points, results, tracker)) => {
                trace!(op = %cell.unique, points, "slice complete");
                self.deliver_slice_complete(owner, points, results, tracker)
            }
            None => Ok(()),
        }
    }

    /// Reports a committed slice upward. Fires at most once per slice.
    pub(crate) fn report_slice_commit(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let report = {
            let mut state = cell.state.lock();
            let KindState::Slice(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            if s.reported_committed {
                None
            } else {
                s.reported_committed = true;
                Some((s.owner, s.expected_points))
            }
        };
        match report {
            Some((owner, points)) => {
                trace!(op = %cell.unique, points, "slice committed");
                self.deliver_slice_commit(owner, points)
            }
            None => Ok(()),
        }
    }

    fn deliver_slice_mapped(
        self: &Arc<Self>,
        owner: SliceOwner,
        denominator: u64,
        points: u64,
    ) -> Result<()> {
        match owner {
            SliceOwner::Local(index) => self.return_slice_mapped(index, denominator, points),
            SliceOwner::Remote(remote) => self.send_slice_mapped(remote, denominator, points),
        }
    }

    fn deliver_slice_complete(
        self: &Arc<Self>,
        owner: SliceOwner,
        points: u64,
        results: Vec<(DomainPoint, FutureValue)>,
        tracker: ResourceTracker,
    ) -> Result<()> {
        match owner {
            SliceOwner::Local(index) => {
                self.return_slice_complete(index, points, results, tracker)
            }
            SliceOwner::Remote(remote) => {
                self.send_slice_complete(remote, points, &results, &tracker)
            }
        }
    }

    fn deliver_slice_commit(self: &Arc<Self>, owner: SliceOwner, points: u64) -> Result<()> {
        match owner {
            SliceOwner::Local(index) => self.return_slice_commit(index, points),
            SliceOwner::Remote(remote) => self.send_slice_commit(remote, points),
        }
    }

    /// One slice reports mapped: accumulate its share and point count. The
    /// index maps once the fraction is whole and every known point mapped.
    pub(crate) fn return_slice_mapped(
        self: &Arc<Self>,
        index: OpId,
        denominator: u64,
        points: u64,
    ) -> Result<()> {
        let Ok(cell) = self.with_op(index) else {
            warn!(op = %index, "slice-mapped report for a reclaimed index task");
            return Ok(());
        };
        if denominator == 0 {
            return Err(Error::new(ErrorKind::Internal)
                .with_unique_id(cell.unique)
                .with_node(self.config.node));
        }
        let mapped_event = {
            let mut state = cell.state.lock();
            let KindState::Index(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            s.fraction = s.fraction.add_share(denominator);
            if s.fraction.exceeds_whole() {
                return Err(Error::new(ErrorKind::FractionOverflow)
                    .with_task(cell.name.clone())
                    .with_unique_id(cell.unique)
                    .with_node(self.config.node));
            }
            s.total_points += points;
            s.mapped_points += points;
            trace!(
                op = %cell.unique,
                fraction = %s.fraction,
                mapped = s.mapped_points,
                total = s.total_points,
                "slice share arrived"
            );
            if s.fraction.is_whole() && s.mapped_points == s.total_points {
                state.lifecycle.advance(Stage::Mapped);
                Some(state.mapped_event)
            } else {
                None
            }
        };
        if let Some(event) = mapped_event {
            self.events.trigger(event);
        }
        Ok(())
    }

    /// One slice reports complete: fold or store each point result and
    /// advance the completion counter. The index completes once the
    /// fraction is whole and every known point completed.
    pub(crate) fn return_slice_complete(
        self: &Arc<Self>,
        index: OpId,
        points: u64,
        results: Vec<(DomainPoint, FutureValue)>,
        tracker: ResourceTracker,
    ) -> Result<()> {
        let Ok(cell) = self.with_op(index) else {
            warn!(op = %index, "slice-complete report for a reclaimed index task");
            return Ok(());
        };
        let transition = {
            let mut state = cell.state.lock();
            let KindState::Index(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            s.completed_points += points;
            for (point, value) in results {
                match s.redop {
                    Some(redop) if !s.deterministic => {
                        let op = self.redops.get(redop).ok_or_else(|| {
                            Error::new(ErrorKind::UnknownReductionOp)
                                .with_unique_id(cell.unique)
                                .with_node(self.config.node)
                        })?;
                        let acc = s.reduction.get_or_insert_with(|| op.identity());
                        op.fold(acc, &value);
                    }
                    // Deterministic reductions and future maps both buffer by
                    // point; the deterministic fold runs after all points
                    // report, in lexicographic order.
                    _ => {
                        if s.future_map.insert(point, value).is_some() {
                            return Err(Error::new(ErrorKind::DuplicatePointResult)
                                .with_task(cell.name.clone())
                                .with_unique_id(cell.unique)
                                .with_node(self.config.node));
                        }
                    }
                }
            }
            let all_points_done =
                s.fraction.is_whole() && s.completed_points == s.total_points;
            state.tracker.merge(&tracker);
            if all_points_done && !state.lifecycle.is_complete()
            {
                state.lifecycle.record_complete()
            } else {
                None
            }
        };
        if transition == Some(Transition::Complete) {
            self.apply_complete_transition(&cell)?;
        }
        Ok(())
    }

    /// One slice reports committed.
    pub(crate) fn return_slice_commit(self: &Arc<Self>, index: OpId, points: u64) -> Result<()> {
        let Ok(cell) = self.with_op(index) else {
            warn!(op = %index, "slice-commit report for a reclaimed index task");
            return Ok(());
        };
        {
            let mut state = cell.state.lock();
            if let KindState::Index(s) = &mut state.kind {
                s.committed_points += points;
            }
        }
        self.maybe_commit_index(&cell)
    }

    /// Final index completion effects: run the deterministic fold, hand the
    /// aggregate back to the parent context, and try the commit.
    pub(crate) fn finish_index_complete(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let (futures, tracker) = {
            let mut state = cell.state.lock();
            let KindState::Index(s) = &mut state.kind else {
                return Err(Error::new(ErrorKind::Internal).with_node(self.config.node));
            };
            let futures = match s.redop {
                Some(redop) => {
                    let op = self.redops.get(redop).ok_or_else(|| {
                        Error::new(ErrorKind::UnknownReductionOp)
                            .with_unique_id(cell.unique)
                            .with_node(self.config.node)
                    })?;
                    if s.deterministic {
                        let mut acc = op.identity();
                        for (_, value) in s.future_map.iter() {
                            op.fold(&mut acc, value);
                        }
                        s.reduction = Some(acc);
                    }
                    vec![s.reduction.clone().unwrap_or_else(|| op.identity())]
                }
                // Future-map mode: the parent receives one future per point,
                // in lexicographic point order.
                None => s.future_map.iter().map(|(_, v)| v.clone()).collect(),
            };
            (futures, state.tracker.clone())
        };
        for value in futures {
            cell.context.receive_future(cell.unique, value);
        }
        cell.context.return_privilege_state(cell.unique, &tracker);
        self.maybe_commit_index(cell)
    }

    /// Requests the index commit once completion has fired and every point
    /// has committed.
    pub(crate) fn maybe_commit_index(self: &Arc<Self>, cell: &Arc<OpCell>) -> Result<()> {
        let transition = {
            let mut state = cell.state.lock();
            let ready = match &state.kind {
                KindState::Index(s) => {
                    state.lifecycle.is_complete()
                        && !state.lifecycle.is_committed()
                        && s.committed_points == s.total_points
                }
                _ => false,
            };
            if ready {
                state.lifecycle.record_commit_request()
            } else {
                None
            }
        };
        if transition == Some(Transition::Commit) {
            self.apply_commit_transition(cell)?;
        }
        Ok(())
    }
}
