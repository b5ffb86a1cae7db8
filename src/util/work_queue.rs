use std::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_queue::SegQueue;

/// Lock-free FIFO of opaque work items with a drainer-handoff counter.
///
/// An item is pushed before the counter is incremented. The producer that
/// observes a pre-increment value of zero becomes the drainer: it pops and
/// executes items, then settles the executed count; a still-positive counter
/// means more items arrived and the drainer keeps going. The counter may dip
/// below zero when the drainer executes an item whose producer has not yet
/// incremented; that producer then brings it back toward zero without being
/// appointed, which is exactly right because its item has already run.
pub(crate) struct WorkQueue<T> {
    items: SegQueue<T>,
    pending: AtomicIsize,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: SegQueue::new(),
            pending: AtomicIsize::new(0),
        }
    }

    /// Push an item. Returns `true` if the caller became the drainer and
    /// must now pop/settle until the queue is settled.
    #[must_use]
    pub(crate) fn post(&self, item: T) -> bool {
        self.items.push(item);
        self.pending.fetch_add(1, Ordering::AcqRel) == 0
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Subtract the number of executed items. A positive return value means
    /// the drainer must keep popping.
    #[must_use]
    pub(crate) fn settle(&self, executed: usize) -> isize {
        self.pending.fetch_sub(executed as isize, Ordering::AcqRel) - executed as isize
    }
}
