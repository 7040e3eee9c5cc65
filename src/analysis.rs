//! Dependence-analysis service surface.
//!
//! Operation ordering is computed outside this crate. The engine registers
//! each launch's requirements and receives back an ordering obligation: an
//! event that fires once every mapping dependence has drained.

use std::sync::Arc;

use crate::event::EventHandle;
use crate::types::{LogicalRegion, RegionRequirement, UniqueId};

/// The dependence-analysis engine the task engine defers ordering to.
pub trait DependenceAnalysis: Send + Sync {
    /// Registers a launch's requirements; the returned event gates the
    /// launch's mapping stage.
    fn register_dependences(&self, op: UniqueId, requirements: &[RegionRequirement]) -> EventHandle;

    /// Computes the privilege path from `parent` down to `region`.
    ///
    /// Returns false if `region` is not reachable below `parent`.
    fn privilege_path(&self, region: LogicalRegion, parent: LogicalRegion) -> bool;

    /// True if the two requirements may alias.
    fn may_alias(&self, a: &RegionRequirement, b: &RegionRequirement) -> bool;
}

/// Analysis double that orders nothing: every launch is immediately
/// mappable and every path is valid. Suitable for engine tests, which
/// exercise the lifecycle rather than the ordering.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAnalysis;

impl DependenceAnalysis for NullAnalysis {
    fn register_dependences(
        &self,
        _op: UniqueId,
        _requirements: &[RegionRequirement],
    ) -> EventHandle {
        EventHandle::TRIGGERED
    }

    fn privilege_path(&self, region: LogicalRegion, parent: LogicalRegion) -> bool {
        region.tree == parent.tree
    }

    fn may_alias(&self, a: &RegionRequirement, b: &RegionRequirement) -> bool {
        a.selection.tree() == b.selection.tree()
    }
}

/// Shared handle type used by the engine.
pub type Analysis = Arc<dyn DependenceAnalysis>;
