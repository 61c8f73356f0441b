use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jana::prelude::*;

#[derive(Default)]
struct SlowSource;

impl EventSource for SlowSource {
    fn name(&self) -> &str {
        "SlowSource"
    }

    fn emit(&mut self, _event: &mut Event) -> Result<EmitResult> {
        // Slow enough that the pause lands mid-stream.
        std::thread::sleep(Duration::from_millis(1));
        Ok(EmitResult::Success)
    }
}

struct RecordingTap {
    numbers: Arc<Mutex<Vec<u64>>>,
}

impl Processor for RecordingTap {
    fn name(&self) -> &str {
        "RecordingTap"
    }

    fn process(&self, event: &Event) -> Result<()> {
        self.numbers.lock().unwrap().push(event.event_nr());
        Ok(())
    }
}

#[test]
fn pausing_and_resuming_loses_and_duplicates_nothing() {
    let numbers = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry.add_source(SlowSource);
    registry.add_processor(RecordingTap {
        numbers: numbers.clone(),
    });

    let params = ParameterManager::new();
    params.set("nthreads", 2usize);
    params.set("jana:nevents", 100u64);
    params.set("jana:event_pool_size", 8usize);
    params.set("jana:show_ticker", false);

    let topology = TopologyBuilder::from_params(registry, &params)
        .unwrap()
        .build()
        .unwrap();
    let engine = ExecutionEngine::new(topology, &params).unwrap();

    engine.start_topology().unwrap();
    engine.scale(2).unwrap();

    // Wait until roughly a third of the stream has been retired, then
    // pause.
    let deadline = Instant::now() + Duration::from_secs(30);
    while numbers.lock().unwrap().len() < 30 {
        assert!(Instant::now() < deadline, "source made no progress");
        std::thread::sleep(Duration::from_millis(1));
    }
    engine.request_pause();
    assert_eq!(engine.wait(), RunStatus::Paused);
    let at_pause = numbers.lock().unwrap().len();
    assert!(at_pause >= 30);
    assert!(
        at_pause < 100,
        "the pause should land before the stream ends"
    );

    // Resume and run to exhaustion.
    engine.start_topology().unwrap();
    assert_eq!(engine.wait(), RunStatus::Paused);
    engine.scale(0).unwrap();

    let numbers = numbers.lock().unwrap();
    assert_eq!(numbers.len(), 100, "every event exactly once");
    let mut sorted = numbers.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 100, "no duplicates");
    assert_eq!(*sorted.last().unwrap(), 99);

    assert_eq!(
        engine.topology().resident_event_count(),
        engine.topology().initial_event_capacity()
    );
    engine.finish().unwrap();
}
