use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jana::prelude::*;

#[derive(Default)]
struct TimesliceSource;

impl EventSource for TimesliceSource {
    fn name(&self) -> &str {
        "TimesliceSource"
    }

    fn level(&self) -> EventLevel {
        EventLevel::Timeslice
    }

    fn emit(&mut self, _event: &mut Event) -> Result<EmitResult> {
        Ok(EmitResult::Success)
    }
}

struct SplitUnfolder {
    unfold_calls: Arc<AtomicUsize>,
}

impl Unfolder for SplitUnfolder {
    fn name(&self) -> &str {
        "SplitUnfolder"
    }

    fn parent_level(&self) -> EventLevel {
        EventLevel::Timeslice
    }

    fn child_level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    fn unfold(&mut self, parent: &Event, child: &mut Event, item_idx: usize) -> Result<UnfoldResult> {
        self.unfold_calls.fetch_add(1, Ordering::SeqCst);
        if item_idx == 3 {
            return Ok(UnfoldResult::NextParent);
        }
        child.set_event_nr(parent.event_nr() * 10 + item_idx as u64);
        Ok(UnfoldResult::KeepParent)
    }
}

#[derive(Default)]
struct ChildCounter {
    processed: AtomicUsize,
}

impl Processor for ChildCounter {
    fn name(&self) -> &str {
        "ChildCounter"
    }

    fn process(&self, _event: &Event) -> Result<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct GroupingFolder {
    joins: Arc<Mutex<BTreeMap<u64, Vec<usize>>>>,
}

impl Folder for GroupingFolder {
    fn name(&self) -> &str {
        "GroupingFolder"
    }

    fn child_level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    fn fold(&mut self, children: &mut [Box<Event>], parent: &mut Event) -> Result<()> {
        let sub_ids = children
            .iter()
            .map(|child| child.child_idx().expect("children carry sub-ids"))
            .collect();
        self.joins.lock().unwrap().insert(parent.event_nr(), sub_ids);
        Ok(())
    }
}

#[test]
fn timeslices_unfold_and_fold_back() {
    let unfold_calls = Arc::new(AtomicUsize::new(0));
    let child_counter = Arc::new(ChildCounter::default());
    let joins = Arc::new(Mutex::new(BTreeMap::new()));

    struct Shared(Arc<ChildCounter>);
    impl Processor for Shared {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn process(&self, event: &Event) -> Result<()> {
            self.0.process(event)
        }
    }

    let mut registry = Registry::new();
    registry.add_source(TimesliceSource);
    registry.add_unfolder(SplitUnfolder {
        unfold_calls: unfold_calls.clone(),
    });
    registry.add_folder(GroupingFolder {
        joins: joins.clone(),
    });
    registry.add_processor(Shared(child_counter.clone()));

    let params = ParameterManager::new();
    params.set("nthreads", 2usize);
    params.set("jana:nevents", 5u64);
    params.set("jana:event_pool_size", 4usize);
    params.set("jana:show_ticker", false);
    params.set("jana:ticker_interval", 20u64);

    let topology = TopologyBuilder::from_params(registry, &params)
        .unwrap()
        .build()
        .unwrap();
    let engine = ExecutionEngine::new(topology, &params).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.run_status(), RunStatus::Paused);

    // 4 unfold calls per timeslice: three children plus the NextParent.
    assert_eq!(unfold_calls.load(Ordering::SeqCst), 20);
    // 3 children per timeslice reach the sequential tap.
    assert_eq!(child_counter.processed.load(Ordering::SeqCst), 15);

    // Exactly one join per parent; children grouped by parent with
    // sub-ids covering 0..N-1.
    let joins = joins.lock().unwrap();
    assert_eq!(joins.len(), 5);
    for parent_nr in 0..5u64 {
        assert_eq!(joins[&parent_nr], vec![0, 1, 2], "parent {parent_nr}");
    }

    // 15 children retired by the fold + 5 timeslices retired at the top.
    assert_eq!(engine.perf().event_count, 20);
    assert_eq!(
        engine.topology().resident_event_count(),
        engine.topology().initial_event_capacity()
    );

    engine.finish().unwrap();
    assert_eq!(engine.run_status(), RunStatus::Finished);
}
