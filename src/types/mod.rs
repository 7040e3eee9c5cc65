//! Core value types: identifiers, domains, fractions, privileges, futures.

mod domain;
mod fraction;
mod future;
mod id;
mod privilege;

pub use domain::{DomainPoint, IndexDomain, PointIter, MAX_DIM};
pub use fraction::Fraction;
pub use future::{FutureMap, FutureValue, RedopRegistry, ReductionOp, SumU64};
pub use id::{
    MemoryId, MustEpochId, NodeId, OpId, ProcId, ProcKind, ProjectionId, RedopId, RemoteOpId,
    TaskFuncId, UniqueId, VariantId,
};
pub use privilege::{
    Coherence, FieldId, FieldSet, FieldSpaceId, IndexPartitionId, IndexSpaceId, LogicalPartition,
    LogicalRegion, Privilege, RegionRequirement, RegionSelection,
};
