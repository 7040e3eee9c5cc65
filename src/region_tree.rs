//! Region-tree / physical-instance service surface.
//!
//! The engine treats the region forest as an opaque collaborator: it asks
//! for valid instance candidates, registers chosen instances, and receives
//! synchronization handles back. Physical layout, placement and coherence
//! are entirely the service's business.
//!
//! [`MockRegionTree`] is the in-crate test double, configured per test with
//! instance visibility, partition disjointness and subregion facts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;

use crate::event::EventHandle;
use crate::types::{
    FieldId, FieldSet, FieldSpaceId, LogicalPartition, LogicalRegion, MemoryId, NodeId, ProcId,
    RedopId, RegionRequirement,
};

/// A physical instance handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct InstanceId(pub u64);

/// A reference to a physical instance, as exchanged with the mapper.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InstanceRef {
    /// The instance.
    pub id: InstanceId,
    /// Memory holding the instance.
    pub memory: MemoryId,
    /// Region the instance materializes.
    pub region: LogicalRegion,
    /// Fields the instance carries.
    pub fields: FieldSet,
    /// Reduction operator for specialized reduction instances.
    pub redop: Option<RedopId>,
}

impl InstanceRef {
    /// True for specialized reduction instances.
    #[must_use]
    pub const fn is_reduction(&self) -> bool {
        self.redop.is_some()
    }

    /// True if the instance carries every field in `fields`.
    #[must_use]
    pub fn covers_fields(&self, fields: &[FieldId]) -> bool {
        fields.iter().all(|f| self.fields.contains(f))
    }
}

/// The chosen mapping for one region requirement after validation.
#[derive(Clone, Debug, Default)]
pub struct ChosenMapping {
    /// Concrete instances; empty iff `virtual_map`.
    pub instances: SmallVec<[InstanceRef; 2]>,
    /// Deferred (virtual) mapping marker.
    pub virtual_map: bool,
}

/// Outcome of attempting to pin an instance before use.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AcquireResult {
    /// The instance is pinned for the operation's duration.
    Acquired,
    /// Lost a race with the collector; retrying may succeed.
    Retry,
    /// The instance is gone; fatal for the requesting mapping.
    Collected,
}

/// Opaque version information for a requirement's region state.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct VersionInfo {
    /// Version number advanced by the dependence analysis.
    pub version: u64,
    /// True if updates are still in flight and candidates may be stale.
    pub pending_updates: bool,
}

/// The region-tree service the engine maps regions through.
pub trait RegionTreeService: Send + Sync {
    /// Computes version information for a requirement prior to mapping.
    fn version_info(&self, req: &RegionRequirement) -> VersionInfo;

    /// Returns the currently valid instances usable for `req`.
    fn valid_instances(&self, req: &RegionRequirement) -> Vec<InstanceRef>;

    /// Registers finalized instances for `req`; returns the readiness event
    /// for the registered data.
    fn register_instances(
        &self,
        req: &RegionRequirement,
        version: VersionInfo,
        instances: &[InstanceRef],
    ) -> EventHandle;

    /// Attempts to pin `instance` against collection.
    fn acquire_instance(&self, instance: InstanceId) -> AcquireResult;

    /// True if `instance`'s memory is reachable from `proc`.
    fn visible_from(&self, instance: &InstanceRef, proc: ProcId) -> bool;

    /// True if `partition` is disjoint.
    fn partition_disjoint(&self, partition: LogicalPartition) -> bool;

    /// True if `region` is (transitively) a subregion of `parent`.
    fn is_subregion(&self, region: LogicalRegion, parent: LogicalRegion) -> bool;

    /// True if `partition` descends from `parent`.
    fn partition_descends(&self, partition: LogicalPartition, parent: LogicalRegion) -> bool;

    /// True if `field` is allocated in `space`.
    fn field_allocated(&self, space: FieldSpaceId, field: FieldId) -> bool;

    /// True if `region` is a live handle.
    fn region_live(&self, region: LogicalRegion) -> bool;

    /// True if `partition` is a live handle.
    fn partition_live(&self, partition: LogicalPartition) -> bool;
}

type VisibilityFn = dyn Fn(&InstanceRef, ProcId) -> bool + Send + Sync;

/// Configurable in-memory region tree for tests.
///
/// Defaults are permissive: every handle is live, every region is a
/// subregion of every parent in the same tree, fields are allocated, and
/// instances are visible everywhere. Tests narrow the parts they exercise.
pub struct MockRegionTree {
    inner: Mutex<MockState>,
    visibility: Option<Box<VisibilityFn>>,
}

struct MockState {
    valid: HashMap<LogicalRegion, Vec<InstanceRef>>,
    collected: HashSet<InstanceId>,
    retry_once: HashSet<InstanceId>,
    disjoint: HashSet<LogicalPartition>,
    dead_regions: HashSet<LogicalRegion>,
    dead_partitions: HashSet<LogicalPartition>,
    registered: Vec<(LogicalRegion, Vec<InstanceId>)>,
    next_instance: u64,
}

impl Default for MockRegionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegionTree {
    /// A permissive mock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockState {
                valid: HashMap::new(),
                collected: HashSet::new(),
                retry_once: HashSet::new(),
                disjoint: HashSet::new(),
                dead_regions: HashSet::new(),
                dead_partitions: HashSet::new(),
                registered: Vec::new(),
                next_instance: 1,
            }),
            visibility: None,
        }
    }

    /// Restricts instance visibility with a predicate.
    #[must_use]
    pub fn with_visibility<F>(mut self, f: F) -> Self
    where
        F: Fn(&InstanceRef, ProcId) -> bool + Send + Sync + 'static,
    {
        self.visibility = Some(Box::new(f));
        self
    }

    /// Creates an instance in `memory` covering `fields` of `region` and
    /// adds it to the valid set.
    pub fn add_instance(
        &self,
        region: LogicalRegion,
        memory: MemoryId,
        fields: &[FieldId],
        redop: Option<RedopId>,
    ) -> InstanceRef {
        let mut inner = self.inner.lock();
        let id = InstanceId(inner.next_instance);
        inner.next_instance += 1;
        let instance = InstanceRef {
            id,
            memory,
            region,
            fields: fields.iter().copied().collect(),
            redop,
        };
        inner.valid.entry(region).or_default().push(instance.clone());
        instance
    }

    /// Marks `partition` disjoint.
    pub fn set_disjoint(&self, partition: LogicalPartition) {
        self.inner.lock().disjoint.insert(partition);
    }

    /// Marks `instance` as collected: acquisition fails fatally.
    pub fn collect_instance(&self, instance: InstanceId) {
        self.inner.lock().collected.insert(instance);
    }

    /// Makes the next acquisition of `instance` lose a transient race.
    pub fn race_instance_once(&self, instance: InstanceId) {
        self.inner.lock().retry_once.insert(instance);
    }

    /// Marks `region` as deleted.
    pub fn kill_region(&self, region: LogicalRegion) {
        self.inner.lock().dead_regions.insert(region);
    }

    /// Marks `partition` as deleted.
    pub fn kill_partition(&self, partition: LogicalPartition) {
        self.inner.lock().dead_partitions.insert(partition);
    }

    /// Instance registrations observed so far, in order.
    #[must_use]
    pub fn registrations(&self) -> Vec<(LogicalRegion, Vec<InstanceId>)> {
        self.inner.lock().registered.clone()
    }
}

impl RegionTreeService for MockRegionTree {
    fn version_info(&self, _req: &RegionRequirement) -> VersionInfo {
        VersionInfo::default()
    }

    fn valid_instances(&self, req: &RegionRequirement) -> Vec<InstanceRef> {
        let inner = self.inner.lock();
        match &req.selection {
            crate::types::RegionSelection::Singular(region)
            | crate::types::RegionSelection::RegionProjection(region, _) => {
                inner.valid.get(region).cloned().unwrap_or_default()
            }
            crate::types::RegionSelection::PartitionProjection(..) => Vec::new(),
        }
    }

    fn register_instances(
        &self,
        req: &RegionRequirement,
        _version: VersionInfo,
        instances: &[InstanceRef],
    ) -> EventHandle {
        let region = match &req.selection {
            crate::types::RegionSelection::Singular(region)
            | crate::types::RegionSelection::RegionProjection(region, _) => *region,
            crate::types::RegionSelection::PartitionProjection(partition, _) => {
                LogicalRegion::new(partition.tree, crate::types::IndexSpaceId(0), partition.field_space)
            }
        };
        self.inner
            .lock()
            .registered
            .push((region, instances.iter().map(|i| i.id).collect()));
        EventHandle::TRIGGERED
    }

    fn acquire_instance(&self, instance: InstanceId) -> AcquireResult {
        let mut inner = self.inner.lock();
        if inner.collected.contains(&instance) {
            AcquireResult::Collected
        } else if inner.retry_once.remove(&instance) {
            AcquireResult::Retry
        } else {
            AcquireResult::Acquired
        }
    }

    fn visible_from(&self, instance: &InstanceRef, proc: ProcId) -> bool {
        self.visibility
            .as_ref()
            .map_or(true, |f| f(instance, proc))
    }

    fn partition_disjoint(&self, partition: LogicalPartition) -> bool {
        self.inner.lock().disjoint.contains(&partition)
    }

    fn is_subregion(&self, region: LogicalRegion, parent: LogicalRegion) -> bool {
        region.tree == parent.tree
    }

    fn partition_descends(&self, partition: LogicalPartition, parent: LogicalRegion) -> bool {
        partition.tree == parent.tree
    }

    fn field_allocated(&self, _space: FieldSpaceId, _field: FieldId) -> bool {
        true
    }

    fn region_live(&self, region: LogicalRegion) -> bool {
        !self.inner.lock().dead_regions.contains(&region)
    }

    fn partition_live(&self, partition: LogicalPartition) -> bool {
        !self.inner.lock().dead_partitions.contains(&partition)
    }
}

impl std::fmt::Debug for MockRegionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRegionTree").finish_non_exhaustive()
    }
}

/// Shared service handle type used by the engine.
pub type RegionTree = Arc<dyn RegionTreeService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexSpaceId;

    fn region(n: u32) -> LogicalRegion {
        LogicalRegion::new(0, IndexSpaceId(n), FieldSpaceId(1))
    }

    #[test]
    fn mock_tracks_valid_instances() {
        let tree = MockRegionTree::new();
        let inst = tree.add_instance(region(1), MemoryId::new(NodeId(0), 0), &[FieldId(1)], None);
        let req = RegionRequirement::read(region(1), region(1), &[FieldId(1)]);
        let valid = tree.valid_instances(&req);
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].id, inst.id);
        assert!(valid[0].covers_fields(&[FieldId(1)]));
        assert!(!valid[0].covers_fields(&[FieldId(2)]));
    }

    #[test]
    fn acquire_retry_then_success() {
        let tree = MockRegionTree::new();
        let inst = tree.add_instance(region(1), MemoryId::new(NodeId(0), 0), &[FieldId(1)], None);
        tree.race_instance_once(inst.id);
        assert_eq!(tree.acquire_instance(inst.id), AcquireResult::Retry);
        assert_eq!(tree.acquire_instance(inst.id), AcquireResult::Acquired);
        tree.collect_instance(inst.id);
        assert_eq!(tree.acquire_instance(inst.id), AcquireResult::Collected);
    }

    #[test]
    fn visibility_predicate_applies() {
        let tree = MockRegionTree::new()
            .with_visibility(|inst, proc| inst.memory.node == proc.node);
        let inst = tree.add_instance(region(1), MemoryId::new(NodeId(1), 0), &[FieldId(1)], None);
        assert!(tree.visible_from(&inst, ProcId::cpu(NodeId(1), 0)));
        assert!(!tree.visible_from(&inst, ProcId::cpu(NodeId(0), 0)));
    }
}
