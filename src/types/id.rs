//! Identifier types for engine entities.
//!
//! Operation identifiers wrap arena indices for ABA safety; node, processor
//! and function identifiers are plain newtypes that travel on the wire.

use core::fmt;
use serde::Serialize;

use crate::util::ArenaIndex;

/// Identifies one live operation record in the engine's pool.
///
/// Stale ids (from a recycled slot) fail arena lookup rather than aliasing a
/// different launch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) ArenaIndex);

impl OpId {
    pub(crate) const fn from_arena(index: ArenaIndex) -> Self {
        Self(index)
    }

    pub(crate) const fn arena_index(self) -> ArenaIndex {
        self.0
    }

    /// Builds an id from raw parts, for tests only.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(slot: u32, generation: u32) -> Self {
        Self(ArenaIndex::new(slot, generation))
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({}:{})", self.0.slot(), self.0.generation())
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0.slot())
    }
}

/// Globally unique launch identifier, assigned at creation on the origin
/// node and carried unchanged through migration and slicing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UniqueId(pub u64);

impl UniqueId {
    /// Packs a node id and node-local counter into one launch id.
    #[must_use]
    pub const fn pack(node: NodeId, seq: u32) -> Self {
        Self(((node.0 as u64) << 32) | seq as u64)
    }

    /// The node that issued this id.
    #[must_use]
    pub const fn origin(self) -> NodeId {
        NodeId((self.0 >> 32) as u32)
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId({:#x})", self.0)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{:x}", self.0)
    }
}

/// One node (address space) of the distributed runtime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct NodeId(pub u32);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// The kind of a processor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub enum ProcKind {
    /// Latency-optimized core (CPU).
    Cpu,
    /// Throughput-optimized core (GPU).
    Gpu,
    /// I/O processor.
    Io,
    /// Utility processor for runtime work.
    Util,
}

impl ProcKind {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::Cpu => 0,
            Self::Gpu => 1,
            Self::Io => 2,
            Self::Util => 3,
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Cpu),
            1 => Some(Self::Gpu),
            2 => Some(Self::Io),
            3 => Some(Self::Util),
            _ => None,
        }
    }
}

/// One processor: a node, a node-local index, and a kind.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ProcId {
    /// Owning node (address space).
    pub node: NodeId,
    /// Node-local processor index.
    pub local: u32,
    /// Processor kind.
    pub kind: ProcKind,
}

impl ProcId {
    /// Builds a processor id.
    #[must_use]
    pub const fn new(node: NodeId, local: u32, kind: ProcKind) -> Self {
        Self { node, local, kind }
    }

    /// CPU processor shorthand used widely in tests.
    #[must_use]
    pub const fn cpu(node: NodeId, local: u32) -> Self {
        Self::new(node, local, ProcKind::Cpu)
    }
}

impl fmt::Debug for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcId({}:{}:{:?})", self.node, self.local, self.kind)
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}p{}", self.node, self.local)
    }
}

/// One memory visible to some set of processors.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct MemoryId {
    /// Owning node.
    pub node: NodeId,
    /// Node-local memory index.
    pub local: u32,
}

impl MemoryId {
    /// Builds a memory id.
    #[must_use]
    pub const fn new(node: NodeId, local: u32) -> Self {
        Self { node, local }
    }
}

impl fmt::Debug for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryId({}:{})", self.node, self.local)
    }
}

/// Registered task function.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct TaskFuncId(pub u32);

impl fmt::Display for TaskFuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// One compiled variant of a task function (leaf, inner, replicable...).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct VariantId(pub u32);

/// A must-epoch joint-mapping group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct MustEpochId(pub u64);

/// Cross-node proxy handle: identifies an operation on its owning node so a
/// remote executor can route results back without holding an arena index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RemoteOpId {
    /// The node that owns the original operation.
    pub owner: NodeId,
    /// The owner-local unique id of the operation.
    pub unique: UniqueId,
}

impl fmt::Debug for RemoteOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteOpId({}@{})", self.unique, self.owner)
    }
}

/// Registered projection function for index launches.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct ProjectionId(pub u32);

/// Registered reduction operator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct RedopId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_packs_origin() {
        let id = UniqueId::pack(NodeId(3), 41);
        assert_eq!(id.origin(), NodeId(3));
        assert_eq!(id.0 & 0xffff_ffff, 41);
    }

    #[test]
    fn proc_kind_tag_round_trip() {
        for kind in [ProcKind::Cpu, ProcKind::Gpu, ProcKind::Io, ProcKind::Util] {
            assert_eq!(ProcKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(ProcKind::from_u8(9), None);
    }

    #[test]
    fn display_is_terse() {
        assert_eq!(ProcId::cpu(NodeId(1), 2).to_string(), "n1p2");
        assert_eq!(NodeId(7).to_string(), "n7");
    }
}
