use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use jana_event::Event;

/// Advisory status returned by mailbox operations.
///
/// These are scheduling hints only; the scheduler recomputes authoritative
/// readiness under its own lock before committing to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStatus {
    /// Items are available (or were accepted) and there is room to spare.
    Ready,
    /// The partition lock was contended; try another arrow.
    Congested,
    /// Nothing to pop.
    Empty,
    /// At or over the soft capacity.
    Full,
}

/// Outcome of a single-item pop.
#[derive(Debug)]
pub enum PopOutcome {
    /// An item was popped.
    Item(Box<Event>),
    /// The partition (and any steal candidates) were empty.
    Empty,
    /// The partition lock was contended.
    Congested,
}

struct Partition {
    inner: Mutex<PartitionInner>,
}

struct PartitionInner {
    items: VecDeque<Box<Event>>,
    reserved: usize,
}

/// A bounded, location-partitioned MPMC handoff buffer of event handles.
///
/// Each location (NUMA-like partition index) owns an independent deque so
/// that events picked up by same-location workers never migrate across
/// memory domains. The capacity is a soft per-location threshold enforced
/// through reservations: a producer reserves space on its output before
/// popping from its input, so occupancy never exceeds
/// `threshold + outstanding reservations`.
pub struct Mailbox {
    threshold: usize,
    stealing: bool,
    partitions: Vec<Partition>,
}

impl Mailbox {
    /// Creates a mailbox with `locations` partitions of soft capacity
    /// `threshold` each. `stealing` permits cross-location pops when the
    /// home partition is empty.
    pub fn new(threshold: usize, locations: usize, stealing: bool) -> Self {
        let locations = locations.max(1);
        Self {
            threshold,
            stealing,
            partitions: (0..locations)
                .map(|_| Partition {
                    inner: Mutex::new(PartitionInner {
                        items: VecDeque::new(),
                        reserved: 0,
                    }),
                })
                .collect(),
        }
    }

    /// The soft per-location capacity.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of location partitions.
    pub fn locations(&self) -> usize {
        self.partitions.len()
    }

    fn lock(&self, loc: usize) -> MutexGuard<'_, PartitionInner> {
        self.partitions[loc]
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves up to `requested` slots at `loc`, granting whatever fits
    /// (possibly zero). A grant must be paid back by
    /// [`push_and_unreserve`](Self::push_and_unreserve) or
    /// [`unreserve`](Self::unreserve). Callers that need the full amount
    /// (the scheduler does) treat a partial grant as "not ready" and give
    /// it back.
    pub fn reserve(&self, requested: usize, loc: usize) -> usize {
        let mut inner = self.lock(loc);
        let available = self
            .threshold
            .saturating_sub(inner.items.len() + inner.reserved);
        let granted = available.min(requested);
        inner.reserved += granted;
        granted
    }

    /// Releases an unused reservation.
    pub fn unreserve(&self, count: usize, loc: usize) {
        let mut inner = self.lock(loc);
        debug_assert!(count <= inner.reserved);
        inner.reserved = inner.reserved.saturating_sub(count);
    }

    /// Appends `items` at `loc`, paying back `reserved` reservation slots.
    ///
    /// Always succeeds: a caller that pushes more than it reserved exceeds
    /// the threshold softly rather than blocking the pipeline.
    pub fn push_and_unreserve(
        &self,
        items: impl IntoIterator<Item = Box<Event>>,
        reserved: usize,
        loc: usize,
    ) -> MailboxStatus {
        let mut inner = self.lock(loc);
        inner.reserved = inner.reserved.saturating_sub(reserved);
        inner.items.extend(items);
        if inner.items.len() >= self.threshold {
            MailboxStatus::Full
        } else {
            MailboxStatus::Ready
        }
    }

    /// Pops one item from `loc`, wait-free when uncontended. When the home
    /// partition is empty and stealing was enabled, scans the other
    /// locations before giving up.
    pub fn try_pop(&self, loc: usize) -> PopOutcome {
        match self.try_pop_local(loc) {
            PopOutcome::Empty if self.stealing => {
                for other in 0..self.partitions.len() {
                    if other == loc {
                        continue;
                    }
                    if let PopOutcome::Item(event) = self.try_pop_local(other) {
                        return PopOutcome::Item(event);
                    }
                }
                PopOutcome::Empty
            }
            outcome => outcome,
        }
    }

    fn try_pop_local(&self, loc: usize) -> PopOutcome {
        let Ok(mut inner) = self.partitions[loc].inner.try_lock() else {
            return PopOutcome::Congested;
        };
        match inner.items.pop_front() {
            Some(event) => PopOutcome::Item(event),
            None => PopOutcome::Empty,
        }
    }

    /// Pops up to `max` additional items from `loc` without blocking.
    /// Used by chunked consumers that already hold one input event.
    pub fn try_pop_chunk(&self, max: usize, loc: usize) -> Vec<Box<Event>> {
        let Ok(mut inner) = self.partitions[loc].inner.try_lock() else {
            return Vec::new();
        };
        let n = max.min(inner.items.len());
        inner.items.drain(..n).collect()
    }

    /// Total item count across all locations. Takes every partition lock;
    /// meant for reports and tests, not the hot path.
    pub fn size(&self) -> usize {
        (0..self.partitions.len())
            .map(|loc| self.lock(loc).items.len())
            .sum()
    }

    /// Item count at one location.
    pub fn size_at(&self, loc: usize) -> usize {
        self.lock(loc).items.len()
    }

    /// Outstanding reservation count at one location.
    pub fn reserved_at(&self, loc: usize) -> usize {
        self.lock(loc).reserved
    }
}

#[cfg(test)]
mod tests {
    use jana_event::{Event, EventLevel};

    use super::{Mailbox, PopOutcome};

    fn event() -> Box<Event> {
        Box::new(Event::new(EventLevel::PhysicsEvent))
    }

    #[test]
    fn reserve_grants_at_most_the_remaining_capacity() {
        let mb = Mailbox::new(4, 1, false);
        assert_eq!(mb.reserve(3, 0), 3);
        assert_eq!(mb.reserve(2, 0), 1);
        assert_eq!(mb.reserve(1, 0), 0);
        assert_eq!(mb.reserved_at(0), 4);
        mb.unreserve(4, 0);
        assert_eq!(mb.reserved_at(0), 0);
    }

    #[test]
    fn push_pays_back_reservation() {
        let mb = Mailbox::new(2, 1, false);
        let granted = mb.reserve(2, 0);
        mb.push_and_unreserve([event(), event()], granted, 0);
        assert_eq!(mb.reserved_at(0), 0);
        assert_eq!(mb.size(), 2);
        // Occupancy is at the threshold: nothing further can reserve.
        assert_eq!(mb.reserve(1, 0), 0);
    }

    #[test]
    fn pop_in_fifo_order() {
        let mb = Mailbox::new(8, 1, false);
        for nr in 0..3u64 {
            let mut e = event();
            e.set_event_nr(nr);
            mb.push_and_unreserve([e], 0, 0);
        }
        for nr in 0..3u64 {
            match mb.try_pop(0) {
                PopOutcome::Item(e) => assert_eq!(e.event_nr(), nr),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(matches!(mb.try_pop(0), PopOutcome::Empty));
    }

    #[test]
    fn stealing_crosses_locations_only_when_enabled() {
        let no_steal = Mailbox::new(8, 2, false);
        no_steal.push_and_unreserve([event()], 0, 1);
        assert!(matches!(no_steal.try_pop(0), PopOutcome::Empty));

        let steal = Mailbox::new(8, 2, true);
        steal.push_and_unreserve([event()], 0, 1);
        assert!(matches!(steal.try_pop(0), PopOutcome::Item(_)));
    }

    #[test]
    fn chunk_pop_takes_at_most_max() {
        let mb = Mailbox::new(8, 1, false);
        mb.push_and_unreserve([event(), event(), event()], 0, 0);
        assert_eq!(mb.try_pop_chunk(2, 0).len(), 2);
        assert_eq!(mb.try_pop_chunk(2, 0).len(), 1);
        assert!(mb.try_pop_chunk(2, 0).is_empty());
    }
}
