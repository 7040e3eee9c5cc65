//! Generational arena backing the operation pool.
//!
//! Every operation record lives in an arena slot. Recycling a slot bumps its
//! generation, so a stale identifier held by a late callback can never reach
//! a record that has been deactivated and reused for a different launch.
//!
//! No unsafe code; stale accesses fail by generation mismatch, not by
//! touching freed memory.

use core::fmt;
use core::hash::{Hash, Hasher};

/// A generation-stamped index into an [`Arena`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Builds an index from raw parts (tests and wire decoding).
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// The raw slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// The generation stamp.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.slot, self.generation)
    }
}

impl Hash for ArenaIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64((u64::from(self.slot) << 32) | u64::from(self.generation));
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    state: SlotState<T>,
}

#[derive(Debug)]
enum SlotState<T> {
    Live(T),
    Free { next: Option<u32> },
}

/// A generational arena with a free-list for slot reuse.
///
/// `insert` prefers recycled slots; `remove` is the "deactivate" half of the
/// pool protocol and invalidates every outstanding index to that slot.
#[derive(Debug)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    /// Creates an arena with room for `capacity` records before reallocating.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            free_head: None,
            live: 0,
        }
    }

    /// Number of live records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// True if no records are live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Inserts a record, reusing a freed slot when one is available.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.insert_with(|_| value)
    }

    /// Inserts the record produced by `build`, handing it its final index so
    /// records can embed their own identity without a fix-up pass.
    pub fn insert_with<F>(&mut self, build: F) -> ArenaIndex
    where
        F: FnOnce(ArenaIndex) -> T,
    {
        self.live += 1;
        if let Some(slot) = self.free_head {
            let entry = &mut self.entries[slot as usize];
            let SlotState::Free { next } = entry.state else {
                unreachable!("free list references a live slot");
            };
            self.free_head = next;
            let index = ArenaIndex {
                slot,
                generation: entry.generation,
            };
            entry.state = SlotState::Live(build(index));
            index
        } else {
            let slot = u32::try_from(self.entries.len()).expect("arena slot count overflow");
            let index = ArenaIndex {
                slot,
                generation: 0,
            };
            self.entries.push(Entry {
                generation: 0,
                state: SlotState::Live(build(index)),
            });
            index
        }
    }

    /// Removes and returns the record at `index`, bumping the slot generation.
    ///
    /// Returns `None` if the index is stale or the slot is already free.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let entry = self.entries.get_mut(index.slot as usize)?;
        if entry.generation != index.generation || matches!(entry.state, SlotState::Free { .. }) {
            return None;
        }
        entry.generation = entry.generation.wrapping_add(1);
        let old = core::mem::replace(
            &mut entry.state,
            SlotState::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(index.slot);
        self.live -= 1;
        match old {
            SlotState::Live(value) => Some(value),
            SlotState::Free { .. } => unreachable!(),
        }
    }

    /// Shared access to the record at `index`, if still live.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.entries.get(index.slot as usize) {
            Some(entry) if entry.generation == index.generation => match &entry.state {
                SlotState::Live(value) => Some(value),
                SlotState::Free { .. } => None,
            },
            _ => None,
        }
    }

    /// Exclusive access to the record at `index`, if still live.
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.entries.get_mut(index.slot as usize) {
            Some(entry) if entry.generation == index.generation => match &mut entry.state {
                SlotState::Live(value) => Some(value),
                SlotState::Free { .. } => None,
            },
            _ => None,
        }
    }

    /// True if `index` refers to a live record.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over live records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match &entry.state {
                SlotState::Live(value) => Some((
                    ArenaIndex {
                        slot: slot as u32,
                        generation: entry.generation,
                    },
                    value,
                )),
                SlotState::Free { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn recycled_slot_changes_generation() {
        let mut arena = Arena::new();
        let first = arena.insert(1);
        arena.remove(first);
        let second = arena.insert(2);
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first.generation(), second.generation());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn insert_with_sees_final_index() {
        let mut arena = Arena::new();
        let idx = arena.insert_with(|i| i.slot());
        assert_eq!(arena.get(idx), Some(&idx.slot()));
    }

    #[test]
    fn double_remove_is_none() {
        let mut arena = Arena::new();
        let idx = arena.insert(5);
        assert_eq!(arena.remove(idx), Some(5));
        assert_eq!(arena.remove(idx), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn iter_skips_freed_slots() {
        let mut arena = Arena::new();
        let a = arena.insert(10);
        let _b = arena.insert(20);
        arena.remove(a);
        let live: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![20]);
    }
}
