use std::any::TypeId;

use crate::{CallGraph, CollectionRef, Error, EventLevel, FactorySet, Result};

/// The unit of work.
///
/// Events are created once by their pool, then recycled for the whole run:
/// at every instant an event is owned by exactly one of a pool, a queue, or
/// an in-flight task. Collections hang off the event's [`FactorySet`] and
/// are produced on demand by [`Event::get`].
#[derive(Debug)]
pub struct Event {
    event_nr: u64,
    run_nr: u32,
    level: EventLevel,
    // Unfold bookkeeping. A child points back at its parent by event
    // number only; the parent itself is owned by the unfold arrow slot
    // until the fold completes.
    parent_nr: Option<u64>,
    child_idx: Option<usize>,
    child_count: Option<usize>,
    warmed_up: bool,
    factories: FactorySet,
    call_graph: CallGraph,
}

impl Event {
    /// Creates a fresh event at the given level with an empty factory set.
    pub fn new(level: EventLevel) -> Self {
        Self::with_factories(level, FactorySet::new())
    }

    /// Creates a fresh event with a pre-populated factory set. This is how
    /// pools build their events from the registered factory generators.
    pub fn with_factories(level: EventLevel, factories: FactorySet) -> Self {
        Self {
            event_nr: 0,
            run_nr: 0,
            level,
            parent_nr: None,
            child_idx: None,
            child_count: None,
            warmed_up: false,
            factories,
            call_graph: CallGraph::default(),
        }
    }

    /// Event number, monotonically non-decreasing within a level.
    pub fn event_nr(&self) -> u64 {
        self.event_nr
    }

    /// Sets the event number. Assigned by the source arrow before user
    /// code runs; unfolders may override it on children.
    pub fn set_event_nr(&mut self, nr: u64) {
        self.event_nr = nr;
    }

    /// Run number.
    pub fn run_nr(&self) -> u32 {
        self.run_nr
    }

    /// Sets the run number.
    pub fn set_run_nr(&mut self, nr: u32) {
        self.run_nr = nr;
    }

    /// The level this event lives at. Fixed by the owning pool.
    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// Parent event number, when this event was produced by an unfolder.
    pub fn parent_nr(&self) -> Option<u64> {
        self.parent_nr
    }

    /// This event's index among its siblings, when unfolded.
    pub fn child_idx(&self) -> Option<usize> {
        self.child_idx
    }

    /// Links this event to its parent. Called by the unfold arrow.
    pub fn set_parent(&mut self, parent_nr: u64, child_idx: usize) {
        self.parent_nr = Some(parent_nr);
        self.child_idx = Some(child_idx);
    }

    /// Number of children this (parent) event unfolded into, stamped when
    /// the unfolder moves on to the next parent.
    pub fn child_count(&self) -> Option<usize> {
        self.child_count
    }

    /// Stamps the final child count. Called by the unfold arrow.
    pub fn set_child_count(&mut self, count: usize) {
        self.child_count = Some(count);
    }

    /// False until this event instance completes its first full cycle.
    /// Cold events are allowed the longer warmup timeout because their
    /// factories still have to `init`.
    pub fn is_warmed_up(&self) -> bool {
        self.warmed_up
    }

    /// The factory registry.
    pub fn factories(&self) -> &FactorySet {
        &self.factories
    }

    /// The per-event record of factory dispatches.
    pub fn call_graph(&self) -> &CallGraph {
        &self.call_graph
    }

    /// Returns the collection of `T` with the given tag, producing it on
    /// first request.
    ///
    /// Triggers `change_run` and `process` on the backing factory if the
    /// collection has not been produced for this event yet; subsequent
    /// calls return the cached collection. Errors raised by user code come
    /// back annotated with the factory's plugin, name, and tag.
    pub fn get<T: Send + 'static>(&self, tag: &str) -> Result<CollectionRef<'_, T>> {
        let slot = self.factories.slot_of::<T>(tag).ok_or_else(|| Error::FactoryNotFound {
            object_type: std::any::type_name::<T>(),
            tag: tag.to_owned(),
        })?;
        self.call_graph.record(std::any::type_name::<T>(), tag);
        slot.fetch(self)
    }

    /// Stores a collection directly, bypassing any factory, and marks it
    /// `Inserted`. Used by sources and by parallel processors.
    pub fn insert<T: Send + 'static>(&mut self, items: Vec<T>, tag: &str) {
        self.factories.insert(items, tag);
    }

    /// Polymorphic view: every object of the tagged collection upcast to
    /// `S`, provided the backing factory declared the conversion with
    /// `Slot::upcast`. Returns an empty vector when no conversion was
    /// declared or the collection has not been produced; never triggers
    /// `process`.
    pub fn get_as<S: Send + 'static>(&self, tag: &str) -> Vec<S> {
        match self.factories.upcast_all(tag, TypeId::of::<S>()) {
            Some(boxed) => *boxed
                .downcast::<Vec<S>>()
                .expect("upcast table entry produces Vec of its key type"),
            None => Vec::new(),
        }
    }

    /// Recycles this event: clears all non-persistent collections, rewinds
    /// factory statuses, and drops the unfold linkage. Called by the
    /// framework when the event returns to its pool.
    pub fn reset(&mut self) {
        self.factories.reset_all();
        self.call_graph.clear();
        self.parent_nr = None;
        self.child_idx = None;
        self.child_count = None;
        self.warmed_up = true;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::{Error, Event, EventLevel, Factory, FactorySet, Result, Slot};

    #[derive(Clone, Debug, PartialEq)]
    struct Hit {
        energy: i32,
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Cluster {
        total: i32,
    }

    struct CountingFactory {
        calls: Arc<AtomicUsize>,
        run_changes: Arc<AtomicUsize>,
    }

    impl Factory for CountingFactory {
        type Object = Cluster;

        fn change_run(&mut self, _event: &Event) -> Result<()> {
            self.run_changes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn process(&mut self, event: &Event) -> Result<Vec<Cluster>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let hits = event.get::<Hit>("raw")?;
            Ok(vec![Cluster {
                total: hits.iter().map(|h| h.energy).sum(),
            }])
        }
    }

    fn event_with_counting_factory() -> (Event, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let run_changes = Arc::new(AtomicUsize::new(0));
        let mut set = FactorySet::new();
        set.add(
            Slot::new(CountingFactory {
                calls: calls.clone(),
                run_changes: run_changes.clone(),
            })
            .tag("clusters"),
        )
        .unwrap();
        let mut event = Event::with_factories(EventLevel::PhysicsEvent, set);
        event.insert(vec![Hit { energy: 3 }, Hit { energy: 4 }], "raw");
        (event, calls, run_changes)
    }

    #[test]
    fn get_memoizes_process() {
        let (event, calls, _) = event_with_counting_factory();
        assert_eq!(event.get::<Cluster>("clusters").unwrap()[0].total, 7);
        assert_eq!(event.get::<Cluster>("clusters").unwrap().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn change_run_tracks_run_number() {
        let (mut event, _, run_changes) = event_with_counting_factory();
        event.set_run_nr(7);
        let _ = event.get::<Cluster>("clusters").unwrap();
        assert_eq!(run_changes.load(Ordering::SeqCst), 1);

        event.reset();
        event.insert(vec![Hit { energy: 1 }], "raw");
        let _ = event.get::<Cluster>("clusters").unwrap();
        // Same run: no second change_run.
        assert_eq!(run_changes.load(Ordering::SeqCst), 1);

        event.reset();
        event.set_run_nr(8);
        event.insert(vec![Hit { energy: 1 }], "raw");
        let _ = event.get::<Cluster>("clusters").unwrap();
        assert_eq!(run_changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_factory_is_an_error() {
        let event = Event::new(EventLevel::PhysicsEvent);
        match event.get::<Hit>("nope") {
            Err(Error::FactoryNotFound { tag, .. }) => assert_eq!(tag, "nope"),
            other => panic!("unexpected: {:?}", other.map(|c| c.len())),
        };
    }

    #[test]
    fn reset_clears_inserted_collections() {
        let mut event = Event::new(EventLevel::PhysicsEvent);
        event.insert(vec![Hit { energy: 1 }], "raw");
        assert_eq!(event.get::<Hit>("raw").unwrap().len(), 1);
        event.reset();
        assert!(event.get::<Hit>("raw").unwrap().is_empty());
        assert!(event.is_warmed_up());
    }

    struct BrokenFactory;

    impl Factory for BrokenFactory {
        type Object = Hit;

        fn init(&mut self) -> Result<()> {
            Err(Error::user("no calibration available"))
        }

        fn process(&mut self, _event: &Event) -> Result<Vec<Hit>> {
            unreachable!("init always fails")
        }
    }

    #[test]
    fn failed_init_poisons_the_slot() {
        let mut set = FactorySet::new();
        set.add(Slot::new(BrokenFactory)).unwrap();
        let event = Event::with_factories(EventLevel::PhysicsEvent, set);
        assert!(matches!(
            event.get::<Hit>(""),
            Err(Error::FactoryBroken { .. })
        ));
        // And again: init must not be retried.
        assert!(matches!(
            event.get::<Hit>(""),
            Err(Error::FactoryBroken { .. })
        ));
    }

    struct SeedFactory;

    impl Factory for SeedFactory {
        type Object = Cluster;

        fn process(&mut self, _event: &Event) -> Result<Vec<Cluster>> {
            Ok(vec![Cluster { total: 11 }, Cluster { total: 22 }])
        }
    }

    #[test]
    fn get_as_requires_declared_upcast() {
        let mut set = FactorySet::new();
        set.add(
            Slot::new(SeedFactory)
                .tag("seeded")
                .upcast::<Hit>(|c| Hit { energy: c.total }),
        )
        .unwrap();
        let event = Event::with_factories(EventLevel::PhysicsEvent, set);

        // Not processed yet: declared upcast over an empty collection.
        assert!(event.get_as::<Hit>("seeded").is_empty());

        let _ = event.get::<Cluster>("seeded").unwrap();
        let hits = event.get_as::<Hit>("seeded");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].energy, 11);

        // No conversion to this type was declared.
        assert!(event.get_as::<String>("seeded").is_empty());
    }

    #[test]
    fn call_graph_records_dispatches() {
        let (event, _, _) = event_with_counting_factory();
        let _ = event.get::<Cluster>("clusters").unwrap();
        let entries = event.call_graph().entries();
        // The cluster request comes first, then its nested hit request.
        assert_eq!(entries.len(), 2);
        assert!(entries[0].object_type.contains("Cluster"));
        assert!(entries[1].object_type.contains("Hit"));
    }
}
