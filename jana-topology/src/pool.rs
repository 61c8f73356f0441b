use jana_event::{Event, EventLevel, FactorySet, Result};

use crate::mailbox::{Mailbox, PopOutcome};

type FactorySetFn = Box<dyn Fn() -> Result<FactorySet> + Send + Sync>;

/// A mailbox pre-filled with fresh events: the only source and sink of
/// event handles.
///
/// One pool exists per event level. Events checked out of a pool travel
/// through the topology and are recycled by [`Pool::push`], which resets
/// them. When `limit_in_flight` is off the pool allocates new events on
/// demand instead of reporting empty, trading bounded memory for latency.
pub struct Pool {
    mailbox: Mailbox,
    level: EventLevel,
    capacity: usize,
    limit_in_flight: bool,
    make_factories: FactorySetFn,
}

impl Pool {
    /// Creates a pool of `capacity` events at `level`, partitioned over
    /// `locations`, each event's factory set built by `make_factories`.
    pub fn new(
        level: EventLevel,
        capacity: usize,
        locations: usize,
        limit_in_flight: bool,
        make_factories: impl Fn() -> Result<FactorySet> + Send + Sync + 'static,
    ) -> Result<Self> {
        let pool = Self {
            mailbox: Mailbox::new(capacity, locations, true),
            level,
            capacity,
            limit_in_flight,
            make_factories: Box::new(make_factories),
        };
        // Distribute the initial events evenly across locations.
        for i in 0..capacity {
            let event = pool.fresh_event()?;
            pool.mailbox
                .push_and_unreserve([event], 0, i % pool.mailbox.locations());
        }
        Ok(pool)
    }

    fn fresh_event(&self) -> Result<Box<Event>> {
        let factories = (self.make_factories)()?;
        Ok(Box::new(Event::with_factories(self.level, factories)))
    }

    /// The level of the events this pool owns.
    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// The configured capacity (initial fill count).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks out an idle event, preferring the home location but always
    /// falling back to the other partitions. Returns `None` when every
    /// partition is empty and the in-flight limit is on.
    pub fn pop(&self, loc: usize) -> Option<Box<Event>> {
        for attempt in 0..2 {
            match self.mailbox.try_pop(loc) {
                PopOutcome::Item(event) => return Some(event),
                PopOutcome::Empty => break,
                // Contended on the first pass; the retry takes the lock on
                // the slow path via the stealing scan.
                PopOutcome::Congested if attempt == 0 => continue,
                PopOutcome::Congested => return None,
            }
        }
        if self.limit_in_flight {
            None
        } else {
            self.fresh_event().ok()
        }
    }

    /// Returns an event to the pool, recycling it first.
    pub fn push(&self, mut event: Box<Event>, loc: usize) {
        event.reset();
        self.mailbox.push_and_unreserve([event], 0, loc);
    }

    /// Resident (idle) event count.
    pub fn size(&self) -> usize {
        self.mailbox.size()
    }

    /// End-of-run hook. The pool itself has nothing to tear down; events
    /// drop with the topology.
    pub fn finalize(&self) {}
}

#[cfg(test)]
mod tests {
    use jana_event::{EventLevel, FactorySet};

    use super::Pool;

    #[test]
    fn prefilled_to_capacity() {
        let pool = Pool::new(EventLevel::PhysicsEvent, 4, 2, true, || Ok(FactorySet::new()))
            .unwrap();
        assert_eq!(pool.size(), 4);
        let a = pool.pop(0).unwrap();
        let b = pool.pop(0).unwrap();
        assert_eq!(pool.size(), 2);
        pool.push(a, 0);
        pool.push(b, 1);
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn bounded_when_limiting_in_flight() {
        let pool = Pool::new(EventLevel::PhysicsEvent, 2, 1, true, || Ok(FactorySet::new()))
            .unwrap();
        let _a = pool.pop(0).unwrap();
        let _b = pool.pop(0).unwrap();
        assert!(pool.pop(0).is_none());
    }

    #[test]
    fn unbounded_when_not_limiting() {
        let pool = Pool::new(EventLevel::PhysicsEvent, 1, 1, false, || Ok(FactorySet::new()))
            .unwrap();
        let _a = pool.pop(0).unwrap();
        let extra = pool.pop(0);
        assert!(extra.is_some());
    }

    #[test]
    fn recycling_resets_events() {
        let pool = Pool::new(EventLevel::PhysicsEvent, 1, 1, true, || Ok(FactorySet::new()))
            .unwrap();
        let mut event = pool.pop(0).unwrap();
        event.set_parent(42, 0);
        assert!(!event.is_warmed_up());
        pool.push(event, 0);
        let event = pool.pop(0).unwrap();
        assert_eq!(event.parent_nr(), None);
        assert!(event.is_warmed_up());
    }
}
