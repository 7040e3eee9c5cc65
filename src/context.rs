//! Parent-context surface.
//!
//! Every launch belongs to a parent task context. The engine reaches the
//! parent only through this trait: outstanding-operation accounting,
//! privilege lookups, and the return of accumulated privilege state at
//! commit. The engine never reaches past this surface into the parent's
//! own state.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::resource::ResourceTracker;
use crate::types::{FutureValue, LogicalRegion, RegionRequirement, UniqueId};

/// The parent task context of a launch.
pub trait ParentContext: Send + Sync {
    /// Called when a child operation is created.
    fn increment_outstanding(&self);

    /// Called when a child operation commits and is reclaimed.
    fn decrement_outstanding(&self);

    /// Finds the parent's own requirement covering `parent_region`, the
    /// privilege source for a child requirement naming that parent.
    fn find_parent_requirement(&self, parent_region: LogicalRegion) -> Option<RegionRequirement>;

    /// Receives a completed child's accumulated resource records.
    fn return_privilege_state(&self, child: UniqueId, tracker: &ResourceTracker);

    /// Receives a completed child's result future.
    fn receive_future(&self, child: UniqueId, value: FutureValue);
}

/// Recording context for tests: counts outstanding operations and stores
/// everything returned to it.
#[derive(Default)]
pub struct RecordingContext {
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    outstanding: i64,
    privileges: Vec<RegionRequirement>,
    returned: Vec<(UniqueId, ResourceTracker)>,
    futures: Vec<(UniqueId, FutureValue)>,
}

impl RecordingContext {
    /// An empty context holding no privileges.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context holding the given requirements as its own privileges.
    #[must_use]
    pub fn with_privileges(requirements: Vec<RegionRequirement>) -> Arc<Self> {
        let ctx = Self::new();
        ctx.state.lock().privileges = requirements;
        Arc::new(ctx)
    }

    /// Current outstanding-operation count.
    #[must_use]
    pub fn outstanding(&self) -> i64 {
        self.state.lock().outstanding
    }

    /// Resource trackers returned so far.
    #[must_use]
    pub fn returned_trackers(&self) -> Vec<(UniqueId, ResourceTracker)> {
        self.state.lock().returned.clone()
    }

    /// Futures returned so far.
    #[must_use]
    pub fn returned_futures(&self) -> Vec<(UniqueId, FutureValue)> {
        self.state.lock().futures.clone()
    }
}

impl ParentContext for RecordingContext {
    fn increment_outstanding(&self) {
        self.state.lock().outstanding += 1;
    }

    fn decrement_outstanding(&self) {
        self.state.lock().outstanding -= 1;
    }

    fn find_parent_requirement(&self, parent_region: LogicalRegion) -> Option<RegionRequirement> {
        let state = self.state.lock();
        state
            .privileges
            .iter()
            .find(|req| match req.selection {
                crate::types::RegionSelection::Singular(region) => region == parent_region,
                _ => false,
            })
            .cloned()
    }

    fn return_privilege_state(&self, child: UniqueId, tracker: &ResourceTracker) {
        self.state.lock().returned.push((child, tracker.clone()));
    }

    fn receive_future(&self, child: UniqueId, value: FutureValue) {
        self.state.lock().futures.push((child, value));
    }
}

/// Shared context handle type used by the engine.
pub type Context = Arc<dyn ParentContext>;
