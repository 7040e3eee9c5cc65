//! Error types and reporting strategy.
//!
//! The engine distinguishes two fatal classes and never recovers from
//! either; the embedding driver decides between abort and surfaced failure:
//!
//! - **Mapper contract violations**: the scheduling policy returned output
//!   the engine cannot honor. Checked exhaustively unless
//!   [`EngineConfig::unsafe_mapper`](crate::config::EngineConfig) is set.
//! - **Privilege violations**: the application declared a region access its
//!   parent context does not hold. Reported once per offending requirement.
//!
//! Every error carries a structured diagnostic payload (task name, unique
//! id, requirement index) that serializes to JSON for external tooling.
//! Speculation failures are not errors and never appear here.

use serde::Serialize;
use thiserror::Error;

use crate::types::{FieldId, MemoryId, Privilege, ProcId};

/// A scheduling-policy contract violation. Always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum MapperViolation {
    /// The mapper returned no target processors.
    #[error("mapper returned no target processors")]
    NoTargetProcessors,
    /// Target processors mix processor kinds.
    #[error("target processors span multiple processor kinds")]
    TargetProcessorsSpanKinds,
    /// Target processors span more than one node.
    #[error("target processors span multiple address spaces")]
    TargetProcessorsSpanNodes,
    /// A privilege field was left without an instance.
    #[error("field {field:?} has privileges but no instance was mapped")]
    UnmappedField {
        /// The uncovered field.
        field: FieldId,
    },
    /// A chosen instance does not satisfy the region requirement.
    #[error("chosen instance does not satisfy the region requirement")]
    InstanceDoesNotSatisfy,
    /// A chosen instance's memory is not visible from every target.
    #[error("instance memory {memory:?} is not visible from target {proc}")]
    InstanceNotVisible {
        /// The instance's memory.
        memory: MemoryId,
        /// The target processor that cannot see it.
        proc: ProcId,
    },
    /// A reduction-privilege requirement was mapped to a normal instance.
    #[error("reduction-privilege requirement mapped without a reduction instance")]
    MissingReductionInstance,
    /// A non-reduction requirement was mapped to a reduction instance.
    #[error("non-reduction requirement mapped to a specialized reduction instance")]
    ReductionInstanceForNonReduction,
    /// Virtual mapping requested for a reduction requirement.
    #[error("virtual mapping is illegal for reduction privileges")]
    VirtualMappingForReduction,
    /// Virtual mapping requested under non-exclusive coherence.
    #[error("virtual mapping is illegal for non-exclusive coherence")]
    VirtualMappingForNonExclusive,
    /// The mapper returned an empty slice list.
    #[error("mapper returned no slices for a non-empty index domain")]
    EmptySliceSet,
    /// A slice has an empty domain.
    #[error("mapper returned a slice with an empty domain")]
    EmptySliceDomain,
    /// A slice domain's dimensionality differs from the launch domain's.
    #[error("slice dimensionality {got} does not match launch dimensionality {expected}")]
    SliceDimensionMismatch {
        /// Launch domain dimensionality.
        expected: u8,
        /// Offending slice dimensionality.
        got: u8,
    },
    /// Slice volumes do not sum to the input volume.
    #[error("slice volumes sum to {got}, expected {expected}")]
    SliceVolumeMismatch {
        /// Volume of the domain handed to the mapper.
        expected: u64,
        /// Sum of the returned slice volumes.
        got: u64,
    },
    /// Two returned slices overlap.
    #[error("mapper returned overlapping slices")]
    SliceOverlap,
    /// Replicated mapping gave two shards overlapping write instances.
    #[error("replicated mapping shares a write instance between shards {shard_a} and {shard_b}")]
    ReplicatedWritesNotDisjoint {
        /// First offending shard.
        shard_a: u32,
        /// Second offending shard.
        shard_b: u32,
    },
    /// A shard of a replicated mapping requested a virtual mapping.
    #[error("replicated mapping shard {shard} requested a virtual mapping")]
    ReplicatedVirtualMapping {
        /// Offending shard.
        shard: u32,
    },
    /// Shards of a control-replicated mapping disagree on replicability.
    #[error("replicated mapping shards chose variants that disagree on replicability")]
    ReplicatedVariantMismatch,
}

/// An application privilege violation. Always fatal, reported once per
/// offending requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum PrivilegeViolation {
    /// No parent requirement covers the named parent region.
    #[error("parent context holds no privilege on the named parent region")]
    ParentPrivilegeMissing,
    /// The parent holds a weaker privilege than requested.
    #[error("requested {requested:?} exceeds parent privilege {held:?}")]
    InsufficientParentPrivilege {
        /// Privilege held by the parent on the shared fields.
        held: Privilege,
        /// Privilege the child requested.
        requested: Privilege,
    },
    /// The requirement's region is not a subregion of its declared parent.
    #[error("region is not a subregion of the declared parent")]
    RegionNotSubregion,
    /// The requirement's partition does not descend from its declared parent.
    #[error("partition does not descend from the declared parent region")]
    PartitionNotSubpartition,
    /// The requirement region and parent live in different region trees.
    #[error("region and declared parent belong to different region trees")]
    RegionTreeMismatch,
    /// A field appears twice in one requirement.
    #[error("field {field:?} appears more than once in the requirement")]
    DuplicateField {
        /// The duplicated field.
        field: FieldId,
    },
    /// The requirement names no fields.
    #[error("requirement names no fields")]
    MissingFields,
    /// A field does not belong to the region's field space.
    #[error("field {field:?} is not allocated in the region's field space")]
    FieldNotInFieldSpace {
        /// The foreign field.
        field: FieldId,
    },
    /// A field is not covered by the parent requirement.
    #[error("field {field:?} is not covered by the parent's privileges")]
    FieldMissingFromParent {
        /// The uncovered field.
        field: FieldId,
    },
    /// The region and parent field spaces differ.
    #[error("requirement and parent use different field spaces")]
    FieldSpaceMismatch,
    /// Reduction privilege without a reduction operator.
    #[error("reduction privilege declared without a reduction operator")]
    MissingReductionOp,
    /// A reduction operator on a non-reduction privilege.
    #[error("reduction operator declared for a non-reduction privilege")]
    ReductionOpOnNonReduce,
    /// A projection requirement on an individual (non-index) launch.
    #[error("projection requirements are only legal on index launches")]
    ProjectionOnIndividualLaunch,
    /// A write-privilege projection over a non-disjoint partition.
    #[error("write-privilege projection over a partition that is not disjoint")]
    NonDisjointWriteProjection,
    /// The region handle does not name a live region.
    #[error("region handle does not name a live region")]
    InvalidRegionHandle,
    /// The partition handle does not name a live partition.
    #[error("partition handle does not name a live partition")]
    InvalidPartitionHandle,
}

/// Wire-format decoding failures for migrated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum WireFault {
    /// Buffer ended before the encoded structure did.
    #[error("encoded buffer is truncated")]
    Truncated,
    /// Magic bytes did not match.
    #[error("bad magic bytes")]
    BadMagic,
    /// Unknown format version.
    #[error("unsupported wire version {0}")]
    BadVersion(u8),
    /// An enum tag was out of range.
    #[error("invalid tag byte {0}")]
    BadTag(u8),
    /// The payload checksum did not match.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
}

/// The kind of an engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum ErrorKind {
    /// Scheduling-policy contract violation (§7 class a).
    #[error("mapper contract violation: {0}")]
    Mapper(#[from] MapperViolation),
    /// Application privilege violation (§7 class b).
    #[error("privilege violation: {0}")]
    Privilege(#[from] PrivilegeViolation),
    /// Wire decoding failure for a migrated task or tracker.
    #[error("wire fault: {0}")]
    Wire(#[from] WireFault),
    /// An operation id no longer names a live record.
    #[error("operation is no longer live")]
    StaleOperation,
    /// The slice-fraction accumulator exceeded 1.
    #[error("slice fraction exceeded the whole")]
    FractionOverflow,
    /// A domain point reported a result twice.
    #[error("domain point reported a result twice")]
    DuplicatePointResult,
    /// No reduction operator registered under the requested id.
    #[error("unknown reduction operator")]
    UnknownReductionOp,
    /// No projection function registered under the requested id.
    #[error("unknown projection function")]
    UnknownProjection,
    /// An instance was deleted before acquisition could pin it.
    #[error("physical instance was already collected")]
    InstanceCollected,
    /// A message arrived for a node this engine does not route to.
    #[error("no transport route to the destination node")]
    NoRoute,
    /// Internal protocol invariant broke (engine bug).
    #[error("internal engine invariant violated")]
    Internal,
}

/// How an error class should be treated by the embedding driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// No recovery path; abort or surface.
    Fatal,
    /// Safe to retry or route around.
    Recoverable,
}

impl ErrorKind {
    /// Classifies the kind for the embedding driver.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Mapper(_)
            | Self::Privilege(_)
            | Self::Wire(_)
            | Self::FractionOverflow
            | Self::DuplicatePointResult
            | Self::UnknownReductionOp
            | Self::UnknownProjection
            | Self::InstanceCollected
            | Self::Internal => Severity::Fatal,
            Self::StaleOperation | Self::NoRoute => Severity::Recoverable,
        }
    }
}

/// Structured diagnostic context attached to every error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diag {
    /// Registered task name, when known.
    pub task: Option<String>,
    /// Unique launch id.
    pub unique_id: Option<u64>,
    /// Offending region-requirement index.
    pub requirement: Option<u32>,
    /// Node the error was raised on.
    pub node: Option<u32>,
}

/// An engine error: a kind plus diagnostic context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Where it went wrong.
    pub diag: Diag,
}

impl Error {
    /// Creates an error with empty diagnostics.
    #[must_use]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        Self {
            kind: kind.into(),
            diag: Diag::default(),
        }
    }

    /// Attaches the task name.
    #[must_use]
    pub fn with_task(mut self, name: impl Into<String>) -> Self {
        self.diag.task = Some(name.into());
        self
    }

    /// Attaches the unique launch id.
    #[must_use]
    pub fn with_unique_id(mut self, id: crate::types::UniqueId) -> Self {
        self.diag.unique_id = Some(id.0);
        self
    }

    /// Attaches the region-requirement index.
    #[must_use]
    pub fn with_requirement(mut self, index: u32) -> Self {
        self.diag.requirement = Some(index);
        self
    }

    /// Attaches the reporting node.
    #[must_use]
    pub fn with_node(mut self, node: crate::types::NodeId) -> Self {
        self.diag.node = Some(node.0);
        self
    }

    /// Severity shorthand.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Serializes kind and diagnostics as a JSON report.
    #[must_use]
    pub fn to_report(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(task) = &self.diag.task {
            write!(f, " (task {task}")?;
            if let Some(id) = self.diag.unique_id {
                write!(f, " {id:#x}")?;
            }
            if let Some(req) = self.diag.requirement {
                write!(f, ", requirement {req}")?;
            }
            write!(f, ")")?;
        } else if let Some(id) = self.diag.unique_id {
            write!(f, " (launch {id:#x})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl<K: Into<ErrorKind>> From<K> for Error {
    fn from(kind: K) -> Self {
        Self::new(kind)
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UniqueId;

    #[test]
    fn mapper_violations_are_fatal() {
        let err = Error::new(MapperViolation::EmptySliceSet);
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn display_includes_task_and_requirement() {
        let err = Error::new(MapperViolation::InstanceDoesNotSatisfy)
            .with_task("stencil")
            .with_unique_id(UniqueId(0x2a))
            .with_requirement(1);
        let text = err.to_string();
        assert!(text.contains("stencil"), "{text}");
        assert!(text.contains("0x2a"), "{text}");
        assert!(text.contains("requirement 1"), "{text}");
    }

    #[test]
    fn report_is_json() {
        let err = Error::new(PrivilegeViolation::MissingFields).with_task("init");
        let report = err.to_report();
        let parsed: serde_json::Value = serde_json::from_str(&report).expect("valid json");
        assert_eq!(parsed["diag"]["task"], "init");
    }

    #[test]
    fn stale_operation_is_recoverable() {
        assert_eq!(ErrorKind::StaleOperation.severity(), Severity::Recoverable);
    }
}
