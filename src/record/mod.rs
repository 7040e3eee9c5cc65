//! Pooled operation records and the shared tri-phase lifecycle.

pub mod lifecycle;
pub mod task_op;

pub use lifecycle::{LifecycleRecord, Stage, Transition};
pub use task_op::{
    IndexState, IndividualState, KindState, OpCell, OpFlags, OpState, PointState, PredicateState,
    ShardState, SliceOwner, SliceState,
};
