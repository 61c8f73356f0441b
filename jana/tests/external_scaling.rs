//! Driving the topology without any worker threads: the caller pumps
//! `exchange_task` (and `fire`) itself and must reproduce the
//! single-threaded results exactly.

use std::sync::{Arc, Mutex};

use jana::prelude::*;

struct Payload {
    x: i64,
}

#[derive(Default)]
struct StepSource;

impl EventSource for StepSource {
    fn name(&self) -> &str {
        "StepSource"
    }

    fn emit(&mut self, event: &mut Event) -> Result<EmitResult> {
        let x = event.event_nr() as i64;
        event.insert(vec![Payload { x }], "src");
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
        assert_eq!(event.get::<Payload>("src")?[0].x, event.event_nr() as i64);
        self.numbers.lock().unwrap().push(event.event_nr());
        Ok(())
    }
}

fn build_engine(numbers: Arc<Mutex<Vec<u64>>>, nevents: u64) -> Arc<ExecutionEngine> {
    let mut registry = Registry::new();
    registry.add_source(StepSource);
    registry.add_processor(RecordingTap { numbers });

    let params = ParameterManager::new();
    params.set("nthreads", 0usize);
    params.set("jana:nevents", nevents);
    params.set("jana:event_source_chunksize", 1usize);
    params.set("jana:show_ticker", false);

    let topology = TopologyBuilder::from_params(registry, &params)
        .unwrap()
        .build()
        .unwrap();
    ExecutionEngine::new(topology, &params).unwrap()
}

#[test]
fn external_worker_reproduces_the_single_threaded_run() {
    let numbers = Arc::new(Mutex::new(Vec::new()));
    let engine = build_engine(numbers.clone(), 5);

    engine.start_topology().unwrap();
    assert_eq!(engine.run_status(), RunStatus::Running);
    let worker = engine.register_external_worker();

    // The very first task must be the source: nothing else has input yet.
    let mut task = engine
        .exchange_task(None, worker, false)
        .expect("the source is ready");
    assert_eq!(task.arrow_name(), "PhysicsEventSource");
    task.fire();
    assert_eq!(task.output_count(), 1);

    let mut previous = Some(task);
    while let Some(mut task) = engine.exchange_task(previous.take(), worker, false) {
        task.fire();
        previous = Some(task);
    }

    assert_eq!(engine.wait(), RunStatus::Paused);
    assert_eq!(engine.perf().event_count, 5);
    assert_eq!(*numbers.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    engine.finish().unwrap();
    assert_eq!(engine.run_status(), RunStatus::Finished);
}

#[test]
fn fire_steps_one_arrow_at_a_time() {
    let numbers = Arc::new(Mutex::new(Vec::new()));
    let engine = build_engine(numbers.clone(), 1);
    engine.start_topology().unwrap();

    // Arrows are wired source → map → tap.
    let names: Vec<String> = engine
        .topology()
        .arrows()
        .iter()
        .map(|a| a.name().to_owned())
        .collect();
    assert_eq!(
        names,
        vec!["PhysicsEventSource", "PhysicsEventMap", "PhysicsEventTap"]
    );

    // Emit one event, map it, retire it.
    assert!(engine.fire(0, 0).unwrap().is_some());
    assert!(engine.fire(1, 0).unwrap().is_some());
    assert!(engine.fire(2, 0).unwrap().is_some());
    assert_eq!(*numbers.lock().unwrap(), vec![0]);

    // The source hits its event limit on the next fire.
    use jana::topology::FireResult;
    assert_eq!(engine.fire(0, 0).unwrap(), Some(FireResult::Finished));
    // A finished arrow reports so instead of firing.
    assert_eq!(engine.fire(0, 0).unwrap(), Some(FireResult::Finished));

    assert_eq!(engine.wait(), RunStatus::Paused);
    assert_eq!(engine.perf().event_count, 1);
}
