//! Completion events and continuation dispatch.
//!
//! The engine never blocks a worker on another operation's progress in the
//! steady state. Both categories of completion handle — mapping-dependency
//! events gating scheduling-side progress and execution-dependency events
//! gating data flow — are [`EventHandle`]s: a continuation is registered
//! against a handle and runs from the dispatch queue once the handle fires.
//!
//! Merged events fire when all of their sources have fired; merge counting
//! happens inside the table so no continuation is needed per source.

use std::collections::HashMap;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

/// A deferred continuation.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Handle to an asynchronous completion event.
///
/// `EventHandle::TRIGGERED` is the pre-fired event; registering against it
/// dispatches the continuation immediately.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EventHandle(u64);

impl EventHandle {
    /// The always-fired event.
    pub const TRIGGERED: Self = Self(0);

    /// True for the pre-fired event.
    #[must_use]
    pub const fn is_triggered_constant(self) -> bool {
        self.0 == 0
    }
}

#[derive(Default)]
struct Pending {
    waiters: Vec<Continuation>,
    /// Merge targets to decrement when this event fires.
    feeds: Vec<u64>,
    /// For merged events: sources that have not fired yet.
    remaining: u32,
}

struct TableInner {
    next: u64,
    pending: HashMap<u64, Pending>,
}

/// Registration table from event handles to continuations.
pub struct EventTable {
    inner: Mutex<TableInner>,
    run_queue: SegQueue<Continuation>,
}

impl Default for EventTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next: 1,
                pending: HashMap::new(),
            }),
            run_queue: SegQueue::new(),
        }
    }

    /// Creates a fresh untriggered event.
    pub fn create(&self) -> EventHandle {
        let mut inner = self.inner.lock();
        let id = inner.next;
        inner.next += 1;
        inner.pending.insert(
            id,
            Pending {
                remaining: 1,
                ..Pending::default()
            },
        );
        EventHandle(id)
    }

    /// Returns an event that fires once every source has fired.
    ///
    /// Already-fired sources are skipped; if none remain, the pre-fired
    /// event is returned.
    pub fn merge(&self, sources: &[EventHandle]) -> EventHandle {
        let mut inner = self.inner.lock();
        let live: Vec<u64> = sources
            .iter()
            .filter(|e| inner.pending.contains_key(&e.0))
            .map(|e| e.0)
            .collect();
        if live.is_empty() {
            return EventHandle::TRIGGERED;
        }
        let id = inner.next;
        inner.next += 1;
        inner.pending.insert(
            id,
            Pending {
                remaining: live.len() as u32,
                ..Pending::default()
            },
        );
        for source in live {
            inner
                .pending
                .get_mut(&source)
                .expect("live source vanished")
                .feeds
                .push(id);
        }
        EventHandle(id)
    }

    /// True if `event` has fired (or is the pre-fired constant).
    #[must_use]
    pub fn has_triggered(&self, event: EventHandle) -> bool {
        event.0 == 0 || !self.inner.lock().pending.contains_key(&event.0)
    }

    /// Registers `continuation` to run once `event` fires.
    ///
    /// Fires immediately (via the dispatch queue) if the event already has.
    pub fn register(&self, event: EventHandle, continuation: Continuation) {
        let mut inner = self.inner.lock();
        match inner.pending.get_mut(&event.0) {
            Some(pending) => pending.waiters.push(continuation),
            None => self.run_queue.push(continuation),
        }
    }

    /// Fires `event`, queueing its waiters and resolving merge chains.
    ///
    /// Firing an already-fired event is a no-op; the protocol guarantees a
    /// single trigger per event, but late duplicates must be harmless.
    pub fn trigger(&self, event: EventHandle) {
        if event.0 == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        let mut stack = vec![event.0];
        while let Some(id) = stack.pop() {
            let ready = match inner.pending.get_mut(&id) {
                Some(pending) => {
                    pending.remaining = pending.remaining.saturating_sub(1);
                    pending.remaining == 0
                }
                None => false,
            };
            if !ready {
                continue;
            }
            let fired = inner.pending.remove(&id).expect("checked above");
            for waiter in fired.waiters {
                self.run_queue.push(waiter);
            }
            stack.extend(fired.feeds);
        }
    }

    /// Runs queued continuations until the queue is empty.
    ///
    /// Continuations may create, register on, and trigger further events;
    /// the queue drains those too before returning.
    pub fn drain(&self) {
        while let Some(continuation) = self.run_queue.pop() {
            continuation();
        }
    }

    /// Number of not-yet-fired events (diagnostics).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl std::fmt::Debug for EventTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTable")
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicU32>, impl Fn() -> Continuation) {
        let count = Arc::new(AtomicU32::new(0));
        let make = {
            let count = Arc::clone(&count);
            move || -> Continuation {
                let count = Arc::clone(&count);
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }
        };
        (count, make)
    }

    #[test]
    fn register_then_trigger_runs_once() {
        let table = EventTable::new();
        let (count, make) = counter();
        let event = table.create();
        table.register(event, make());
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        table.trigger(event);
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Duplicate trigger is harmless.
        table.trigger(event);
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_on_fired_event_dispatches() {
        let table = EventTable::new();
        let (count, make) = counter();
        table.register(EventHandle::TRIGGERED, make());
        let event = table.create();
        table.trigger(event);
        table.register(event, make());
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn merge_waits_for_all_sources() {
        let table = EventTable::new();
        let (count, make) = counter();
        let a = table.create();
        let b = table.create();
        let merged = table.merge(&[a, b]);
        table.register(merged, make());
        table.trigger(a);
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        table.trigger(b);
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(table.has_triggered(merged));
    }

    #[test]
    fn merge_of_fired_sources_is_prefired() {
        let table = EventTable::new();
        let a = table.create();
        table.trigger(a);
        let merged = table.merge(&[a, EventHandle::TRIGGERED]);
        assert_eq!(merged, EventHandle::TRIGGERED);
    }

    #[test]
    fn continuations_can_chain() {
        let table = Arc::new(EventTable::new());
        let (count, make) = counter();
        let first = table.create();
        let second = table.create();
        {
            let table = Arc::clone(&table);
            let next = make();
            table.clone().register(
                first,
                Box::new(move || {
                    table.register(second, next);
                    table.trigger(second);
                }),
            );
        }
        table.trigger(first);
        table.drain();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
