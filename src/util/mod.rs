//! Internal utilities: the generational operation arena.

mod arena;

pub use arena::{Arena, ArenaIndex};
