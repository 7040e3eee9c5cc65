//! Tri-phase operation lifecycle record.
//!
//! Every operation passes through three global barrier events: mapped,
//! complete, committed. The completion transition fires exactly once, at
//! the first moment `complete_received && children_complete` holds; the
//! commit transition fires exactly once at the first moment
//! `commit_received && children_commit` holds after completion. This record
//! is a pure state machine: it reports which transition an update caused
//! and the engine layer performs the matching effects, so effects happen
//! exactly once by construction.

use serde::Serialize;

/// Execution stage of a single-execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Stage {
    /// Created, not yet eligible to map.
    Ready,
    /// Mapping in progress.
    Mapping,
    /// All region requirements mapped.
    Mapped,
    /// Dispatched to a processor.
    Executing,
    /// Execution and all children complete.
    Complete,
    /// Commit barrier passed; record may be reclaimed.
    Committed,
}

/// The transition a lifecycle update caused, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The completion barrier fired; notify parent and waiters once.
    Complete,
    /// The commit barrier fired; the record may be pooled once effects run.
    Commit,
}

/// Shared tri-phase state for every operation kind.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRecord {
    stage: Stage,
    complete_received: bool,
    commit_received: bool,
    pending_child_completes: u32,
    pending_child_commits: u32,
    completed_fired: bool,
    committed_fired: bool,
}

impl Default for LifecycleRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleRecord {
    /// A fresh record with no children.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stage: Stage::Ready,
            complete_received: false,
            commit_received: false,
            pending_child_completes: 0,
            pending_child_commits: 0,
            completed_fired: false,
            committed_fired: false,
        }
    }

    /// Resets the record for pool reuse.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Current execution stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Advances the execution stage. Stages are monotone; moving backwards
    /// indicates an engine bug.
    pub fn advance(&mut self, stage: Stage) {
        debug_assert!(self.stage <= stage, "stage moved backwards: {:?} -> {stage:?}", self.stage);
        self.stage = stage;
    }

    /// True once the completion barrier has fired.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.completed_fired
    }

    /// True once the commit barrier has fired.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed_fired
    }

    /// True if all direct children have completed.
    #[must_use]
    pub const fn children_complete(&self) -> bool {
        self.pending_child_completes == 0
    }

    /// True if all direct children have committed.
    #[must_use]
    pub const fn children_committed(&self) -> bool {
        self.pending_child_commits == 0
    }

    /// Registers a direct child; it must later report complete and commit.
    pub fn record_child_added(&mut self) {
        debug_assert!(!self.completed_fired, "child added after completion");
        self.pending_child_completes += 1;
        self.pending_child_commits += 1;
    }

    /// Records this operation's own execution finishing.
    pub fn record_complete(&mut self) -> Option<Transition> {
        debug_assert!(!self.complete_received, "complete received twice");
        self.complete_received = true;
        self.try_fire_complete()
    }

    /// Records one direct child's completion callback.
    pub fn record_child_complete(&mut self) -> Option<Transition> {
        debug_assert!(self.pending_child_completes > 0, "unmatched child complete");
        self.pending_child_completes -= 1;
        self.try_fire_complete()
    }

    /// Records the commit request for this operation.
    pub fn record_commit_request(&mut self) -> Option<Transition> {
        debug_assert!(!self.commit_received, "commit requested twice");
        self.commit_received = true;
        self.try_fire_commit()
    }

    /// Records one direct child's commit callback.
    pub fn record_child_committed(&mut self) -> Option<Transition> {
        debug_assert!(self.pending_child_commits > 0, "unmatched child commit");
        self.pending_child_commits -= 1;
        self.try_fire_commit()
    }

    fn try_fire_complete(&mut self) -> Option<Transition> {
        if self.completed_fired || !self.complete_received || self.pending_child_completes > 0 {
            return None;
        }
        self.completed_fired = true;
        self.stage = Stage::Complete;
        // Completion may unblock an already-requested commit.
        Some(Transition::Complete)
    }

    fn try_fire_commit(&mut self) -> Option<Transition> {
        if self.committed_fired
            || !self.completed_fired
            || !self.commit_received
            || self.pending_child_commits > 0
        {
            return None;
        }
        self.committed_fired = true;
        self.stage = Stage::Committed;
        Some(Transition::Commit)
    }

    /// Re-checks the commit condition after completion fired. Needed when
    /// the commit request and the last child commit arrived before the
    /// completion barrier.
    pub fn recheck_commit(&mut self) -> Option<Transition> {
        self.try_fire_commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_only_after_own_and_children() {
        let mut lc = LifecycleRecord::new();
        lc.record_child_added();
        lc.record_child_added();
        assert_eq!(lc.record_complete(), None);
        assert_eq!(lc.record_child_complete(), None);
        assert_eq!(lc.record_child_complete(), Some(Transition::Complete));
        assert!(lc.is_complete());
    }

    #[test]
    fn childless_operation_completes_on_own_signal() {
        let mut lc = LifecycleRecord::new();
        assert_eq!(lc.record_complete(), Some(Transition::Complete));
    }

    #[test]
    fn commit_waits_for_completion() {
        let mut lc = LifecycleRecord::new();
        lc.record_child_added();
        // Commit request and child commit both arrive early.
        assert_eq!(lc.record_commit_request(), None);
        assert_eq!(lc.record_child_committed(), None);
        lc.record_complete();
        assert_eq!(lc.record_child_complete(), Some(Transition::Complete));
        assert_eq!(lc.recheck_commit(), Some(Transition::Commit));
        assert!(lc.is_committed());
    }

    #[test]
    fn commit_fires_once() {
        let mut lc = LifecycleRecord::new();
        lc.record_complete();
        assert_eq!(lc.record_commit_request(), Some(Transition::Commit));
        assert_eq!(lc.recheck_commit(), None);
    }

    #[test]
    fn children_order_does_not_matter() {
        // Child signals before own signals.
        let mut lc = LifecycleRecord::new();
        lc.record_child_added();
        assert_eq!(lc.record_child_complete(), None);
        assert_eq!(lc.record_complete(), Some(Transition::Complete));
        assert_eq!(lc.record_child_committed(), None);
        assert_eq!(lc.record_commit_request(), Some(Transition::Commit));
    }

    #[test]
    fn reset_clears_everything() {
        let mut lc = LifecycleRecord::new();
        lc.record_complete();
        lc.record_commit_request();
        lc.reset();
        assert!(!lc.is_complete());
        assert!(!lc.is_committed());
        assert_eq!(lc.stage(), Stage::Ready);
    }

    #[test]
    fn stages_advance_monotonically() {
        let mut lc = LifecycleRecord::new();
        lc.advance(Stage::Mapping);
        lc.advance(Stage::Mapped);
        lc.advance(Stage::Executing);
        assert_eq!(lc.stage(), Stage::Executing);
    }
}
