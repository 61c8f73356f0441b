use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use jana::prelude::*;

struct Payload {
    x: i64,
}

#[derive(Default)]
struct PayloadSource;

impl EventSource for PayloadSource {
    fn name(&self) -> &str {
        "PayloadSource"
    }

    fn emit(&mut self, event: &mut Event) -> Result<EmitResult> {
        let x = 2 * event.event_nr() as i64;
        event.insert(vec![Payload { x }], "src");
        Ok(EmitResult::Success)
    }
}

#[derive(Default)]
struct IncrementMap;

impl Processor for IncrementMap {
    fn name(&self) -> &str {
        "IncrementMap"
    }

    fn process_parallel(&self, event: &mut Event) -> Result<()> {
        let x = event.get::<Payload>("src")?[0].x;
        event.insert(vec![Payload { x: x + 1 }], "map");
        Ok(())
    }
}

#[derive(Default)]
struct CheckingTap {
    processed: AtomicUsize,
    mismatches: AtomicUsize,
}

impl Processor for CheckingTap {
    fn name(&self) -> &str {
        "CheckingTap"
    }

    fn process(&self, event: &Event) -> Result<()> {
        let map_x = event.get::<Payload>("map")?[0].x;
        if map_x != 2 * event.event_nr() as i64 + 1 {
            self.mismatches.fetch_add(1, Ordering::SeqCst);
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn parallel_map_produces_consistent_events() {
    let map = Arc::new(IncrementMap);
    let tap = Arc::new(CheckingTap::default());

    struct Shared<P>(Arc<P>);
    impl<P: Processor> Processor for Shared<P> {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn process_parallel(&self, event: &mut Event) -> Result<()> {
            self.0.process_parallel(event)
        }
        fn process(&self, event: &Event) -> Result<()> {
            self.0.process(event)
        }
    }

    let mut registry = Registry::new();
    registry.add_source(PayloadSource);
    registry.add_processor(Shared(map));
    registry.add_processor(Shared(tap.clone()));

    let params = ParameterManager::new();
    params.set("nthreads", 4usize);
    params.set("jana:nevents", 1000u64);
    params.set("jana:show_ticker", false);
    params.set("jana:ticker_interval", 20u64);

    let topology = TopologyBuilder::from_params(registry, &params)
        .unwrap()
        .build()
        .unwrap();
    let engine = ExecutionEngine::new(topology, &params).unwrap();

    engine.run().unwrap();
    assert_eq!(engine.run_status(), RunStatus::Paused);
    assert_eq!(tap.processed.load(Ordering::SeqCst), 1000);
    assert_eq!(tap.mismatches.load(Ordering::SeqCst), 0);
    assert_eq!(engine.perf().event_count, 1000);

    // Mass conservation at the quiescent end of the run.
    assert_eq!(
        engine.topology().resident_event_count(),
        engine.topology().initial_event_capacity()
    );

    engine.finish().unwrap();
    assert_eq!(engine.run_status(), RunStatus::Finished);
}
