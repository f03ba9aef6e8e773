//! Timer heap for deadline-driven wakeups.
//!
//! A min-heap of `(deadline, slot)` pairs. Slots hold the waker of the
//! future that registered them; dropping the future clears its slot, so an
//! expired entry for a dead timer pops harmlessly. Registration and
//! cancellation are therefore always paired.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::task::Waker;

use crate::types::Time;

/// The waker slot shared between a timer future and the heap.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    waker: Mutex<Option<Waker>>,
}

impl TimerSlot {
    /// Installs or refreshes the waker to fire at the deadline.
    pub(crate) fn set_waker(&self, waker: &Waker) {
        let mut slot = self.waker.lock().expect("timer lock poisoned");
        match &mut *slot {
            Some(existing) if existing.will_wake(waker) => {}
            other => *other = Some(waker.clone()),
        }
    }

    /// Clears the slot; the heap entry becomes inert.
    pub(crate) fn clear(&self) {
        self.waker.lock().expect("timer lock poisoned").take();
    }

    fn take(&self) -> Option<Waker> {
        self.waker.lock().expect("timer lock poisoned").take()
    }
}

struct TimerEntry {
    deadline: Time,
    generation: u64,
    slot: Arc<TimerSlot>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timers ordered by deadline.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a deadline and returns the slot to park a waker in.
    pub(crate) fn register(&mut self, deadline: Time) -> Arc<TimerSlot> {
        let slot = Arc::new(TimerSlot::default());
        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(TimerEntry {
            deadline,
            generation,
            slot: slot.clone(),
        });
        slot
    }

    /// Returns the earliest registered deadline, if any.
    pub(crate) fn peek_deadline(&self) -> Option<Time> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops every entry due at `now` and returns the wakers to fire.
    pub(crate) fn pop_due(&mut self, now: Time) -> Vec<Waker> {
        let mut due = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                if let Some(waker) = entry.slot.take() {
                    due.push(waker);
                }
            }
        }
        due
    }

    /// Drops every registered timer.
    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn earliest_deadline_is_kept_at_top() {
        let mut heap = TimerHeap::new();
        let _a = heap.register(Time::from_millis(200));
        let _b = heap.register(Time::from_millis(100));
        let _c = heap.register(Time::from_millis(150));
        assert_eq!(heap.peek_deadline(), Some(Time::from_millis(100)));
    }

    #[test]
    fn pop_due_fires_only_registered_wakers() {
        let mut heap = TimerHeap::new();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(counter.clone());

        let a = heap.register(Time::from_millis(50));
        a.set_waker(&waker);
        let b = heap.register(Time::from_millis(60));
        b.set_waker(&waker);
        b.clear(); // cancelled before firing

        let due = heap.pop_due(Time::from_millis(100));
        for w in due {
            w.wake();
        }
        assert_eq!(counter.0.load(AtomicOrdering::SeqCst), 1);
        assert!(heap.peek_deadline().is_none());
    }

    #[test]
    fn pop_due_leaves_future_deadlines() {
        let mut heap = TimerHeap::new();
        let _a = heap.register(Time::from_millis(10));
        let _b = heap.register(Time::from_millis(90));
        let _ = heap.pop_due(Time::from_millis(20));
        assert_eq!(heap.peek_deadline(), Some(Time::from_millis(90)));
    }
}
