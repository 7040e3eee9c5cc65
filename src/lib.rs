//! Taskgrid: the task-operation engine of a distributed, task-parallel
//! execution runtime.
//!
//! # Overview
//!
//! Taskgrid owns the lifetime of every task launch on a node: individual
//! launches, bulk index launches over dense domains, the slices and points
//! an index launch decomposes into, and the shards of a control-replicated
//! single task. Dependence analysis, the region forest, and physical data
//! movement live behind service traits; this crate decides *when* each
//! launch maps, runs, completes, and commits, and keeps that protocol
//! correct across node boundaries.
//!
//! # Core Guarantees
//!
//! - **Tri-phase lifecycle**: every operation maps, completes, and commits
//!   exactly once, in order, with children folded in before each phase
//! - **Exact slice accounting**: recursive re-slicing of unknown depth sums
//!   to exactly one through rational fraction arithmetic, never floats
//! - **Untrusted mappers**: every scheduling-policy output is validated
//!   before use; a policy bug is a structured fatal error, not corruption
//! - **Deterministic reductions**: on request, index reductions fold in
//!   lexicographic point order regardless of arrival order
//! - **Safe migration**: checksummed wire encodings, generational operation
//!   ids, and proxy handles keep cross-node state exact
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, domains, fractions, privileges, futures
//! - [`record`]: pooled operation records and the lifecycle state machine
//! - [`engine`]: launch, mapping, slicing, fan-in, speculation, migration
//! - [`mapper`]: the scheduling-policy interface and stock mappers
//! - [`context`]: the parent-task surface launches report back through
//! - [`analysis`], [`region_tree`]: external collaborator surfaces
//! - [`resource`]: resource creation/deletion tracking across task trees
//! - [`event`]: completion events and continuation dispatch
//! - [`wire`]: binary encodings for migrated state
//! - [`error`]: structured fatal diagnostics
//! - [`test_utils`]: shared harness pieces for unit and integration tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod analysis;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod mapper;
pub mod record;
pub mod region_tree;
pub mod resource;
pub mod test_utils;
pub mod types;
pub mod util;
pub mod wire;

pub use config::EngineConfig;
pub use engine::{IndexLaunch, LoopbackRouter, TaskDesc, TaskEngine, Transport};
pub use error::{Error, ErrorKind, Result};
