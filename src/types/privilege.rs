//! Region requirements: privilege and coherence declarations.
//!
//! A region requirement declares what a task will do to a logical region:
//! which fields, with what privilege, under what coherence. Requirements are
//! validated against the parent's privileges before mapping and are immutable
//! afterwards apart from engine-internal bookkeeping.

use core::fmt;
use serde::Serialize;
use smallvec::SmallVec;

use crate::types::id::{ProjectionId, RedopId};

/// A field within a field space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct FieldId(pub u32);

/// A field space handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct FieldSpaceId(pub u32);

/// An index space handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct IndexSpaceId(pub u32);

/// An index partition handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct IndexPartitionId(pub u32);

/// A logical region: an index space crossed with a field space within a tree.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LogicalRegion {
    /// Region tree the region belongs to.
    pub tree: u32,
    /// Row space.
    pub index_space: IndexSpaceId,
    /// Column space.
    pub field_space: FieldSpaceId,
}

impl LogicalRegion {
    /// Builds a region handle.
    #[must_use]
    pub const fn new(tree: u32, index_space: IndexSpaceId, field_space: FieldSpaceId) -> Self {
        Self {
            tree,
            index_space,
            field_space,
        }
    }
}

impl fmt::Debug for LogicalRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogicalRegion(t{},is{},fs{})",
            self.tree, self.index_space.0, self.field_space.0
        )
    }
}

/// A logical partition of a region.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LogicalPartition {
    /// Region tree the partition belongs to.
    pub tree: u32,
    /// The partitioned index space.
    pub index_partition: IndexPartitionId,
    /// Column space.
    pub field_space: FieldSpaceId,
}

impl LogicalPartition {
    /// Builds a partition handle.
    #[must_use]
    pub const fn new(
        tree: u32,
        index_partition: IndexPartitionId,
        field_space: FieldSpaceId,
    ) -> Self {
        Self {
            tree,
            index_partition,
            field_space,
        }
    }
}

impl fmt::Debug for LogicalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogicalPartition(t{},ip{},fs{})",
            self.tree, self.index_partition.0, self.field_space.0
        )
    }
}

/// Access privilege for a region requirement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum Privilege {
    /// No access (placeholder requirements).
    None,
    /// Read-only access.
    ReadOnly,
    /// Read-write access.
    ReadWrite,
    /// Write access with the prior contents discarded.
    WriteDiscard,
    /// Reduction-only access through a registered operator.
    Reduce,
}

impl Privilege {
    /// True for any privilege that can mutate the region.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteDiscard)
    }

    /// True for any privilege that can observe prior contents.
    #[must_use]
    pub const fn is_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// True for reduction privilege.
    #[must_use]
    pub const fn is_reduce(self) -> bool {
        matches!(self, Self::Reduce)
    }

    /// True if a child holding `self` from a parent holding `parent` is
    /// within the parent's rights.
    #[must_use]
    pub const fn within(self, parent: Self) -> bool {
        match self {
            Self::None => true,
            Self::ReadOnly => parent.is_read(),
            Self::ReadWrite => matches!(parent, Self::ReadWrite),
            Self::WriteDiscard => parent.is_write(),
            // A reduction is allowed under full write privilege too.
            Self::Reduce => matches!(parent, Self::Reduce | Self::ReadWrite),
        }
    }

    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::ReadOnly => 1,
            Self::ReadWrite => 2,
            Self::WriteDiscard => 3,
            Self::Reduce => 4,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::ReadOnly),
            2 => Some(Self::ReadWrite),
            3 => Some(Self::WriteDiscard),
            4 => Some(Self::Reduce),
            _ => None,
        }
    }
}

/// Coherence annotation for a region requirement.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum Coherence {
    /// Serialized access (the default).
    Exclusive,
    /// Interleaving allowed at operation granularity.
    Atomic,
    /// Concurrent access, application-managed.
    Simultaneous,
    /// No ordering obligations.
    Relaxed,
}

impl Coherence {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Exclusive => 0,
            Self::Atomic => 1,
            Self::Simultaneous => 2,
            Self::Relaxed => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Exclusive),
            1 => Some(Self::Atomic),
            2 => Some(Self::Simultaneous),
            3 => Some(Self::Relaxed),
            _ => None,
        }
    }
}

/// What a requirement names: a concrete region, or a projection from a
/// region/partition evaluated per point of an index launch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum RegionSelection {
    /// One concrete region, identical for every point.
    Singular(LogicalRegion),
    /// Per-point projection from a partition.
    PartitionProjection(LogicalPartition, ProjectionId),
    /// Per-point projection from a region.
    RegionProjection(LogicalRegion, ProjectionId),
}

impl RegionSelection {
    /// True for either projection form.
    #[must_use]
    pub const fn is_projection(&self) -> bool {
        matches!(
            self,
            Self::PartitionProjection(..) | Self::RegionProjection(..)
        )
    }

    /// The region tree this selection lives in.
    #[must_use]
    pub const fn tree(&self) -> u32 {
        match self {
            Self::Singular(r) | Self::RegionProjection(r, _) => r.tree,
            Self::PartitionProjection(p, _) => p.tree,
        }
    }
}

/// Field list type: requirements usually name a handful of fields.
pub type FieldSet = SmallVec<[FieldId; 8]>;

/// A declared region access.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct RegionRequirement {
    /// What is accessed.
    pub selection: RegionSelection,
    /// Privilege over the named fields.
    pub privilege: Privilege,
    /// Coherence annotation.
    pub coherence: Coherence,
    /// Reduction operator; required iff `privilege` is `Reduce`.
    pub redop: Option<RedopId>,
    /// Fields the privilege covers.
    pub fields: FieldSet,
    /// The parent region the privilege is derived from.
    pub parent: LogicalRegion,
    /// Index of the matching requirement in the parent task, filled in by
    /// privilege checking.
    pub parent_req_index: Option<u32>,
    /// Mapper may leave this requirement virtually mapped.
    pub allow_virtual: bool,
}

impl RegionRequirement {
    /// A singular read-write exclusive requirement (the common case).
    #[must_use]
    pub fn write(region: LogicalRegion, parent: LogicalRegion, fields: &[FieldId]) -> Self {
        Self {
            selection: RegionSelection::Singular(region),
            privilege: Privilege::ReadWrite,
            coherence: Coherence::Exclusive,
            redop: None,
            fields: fields.iter().copied().collect(),
            parent,
            parent_req_index: None,
            allow_virtual: false,
        }
    }

    /// A singular read-only exclusive requirement.
    #[must_use]
    pub fn read(region: LogicalRegion, parent: LogicalRegion, fields: &[FieldId]) -> Self {
        Self {
            privilege: Privilege::ReadOnly,
            ..Self::write(region, parent, fields)
        }
    }

    /// A reduction requirement through `redop`.
    #[must_use]
    pub fn reduce(
        region: LogicalRegion,
        parent: LogicalRegion,
        fields: &[FieldId],
        redop: RedopId,
    ) -> Self {
        Self {
            privilege: Privilege::Reduce,
            redop: Some(redop),
            ..Self::write(region, parent, fields)
        }
    }

    /// Returns the first field that appears more than once, if any.
    #[must_use]
    pub fn duplicate_field(&self) -> Option<FieldId> {
        let mut seen: SmallVec<[FieldId; 8]> = SmallVec::new();
        for &field in &self.fields {
            if seen.contains(&field) {
                return Some(field);
            }
            seen.push(field);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(tree: u32) -> LogicalRegion {
        LogicalRegion::new(tree, IndexSpaceId(1), FieldSpaceId(1))
    }

    #[test]
    fn privilege_subsumption() {
        assert!(Privilege::ReadOnly.within(Privilege::ReadWrite));
        assert!(Privilege::ReadOnly.within(Privilege::ReadOnly));
        assert!(!Privilege::ReadWrite.within(Privilege::ReadOnly));
        assert!(Privilege::WriteDiscard.within(Privilege::ReadWrite));
        assert!(Privilege::Reduce.within(Privilege::ReadWrite));
        assert!(!Privilege::Reduce.within(Privilege::ReadOnly));
        assert!(Privilege::None.within(Privilege::None));
    }

    #[test]
    fn tag_round_trips() {
        for p in [
            Privilege::None,
            Privilege::ReadOnly,
            Privilege::ReadWrite,
            Privilege::WriteDiscard,
            Privilege::Reduce,
        ] {
            assert_eq!(Privilege::from_u8(p.as_u8()), Some(p));
        }
        for c in [
            Coherence::Exclusive,
            Coherence::Atomic,
            Coherence::Simultaneous,
            Coherence::Relaxed,
        ] {
            assert_eq!(Coherence::from_u8(c.as_u8()), Some(c));
        }
    }

    #[test]
    fn duplicate_field_detection() {
        let mut req = RegionRequirement::read(region(0), region(0), &[FieldId(1), FieldId(2)]);
        assert_eq!(req.duplicate_field(), None);
        req.fields.push(FieldId(1));
        assert_eq!(req.duplicate_field(), Some(FieldId(1)));
    }
}
