use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use jana::prelude::*;

#[derive(Default)]
struct TrickleSource;

impl EventSource for TrickleSource {
    fn name(&self) -> &str {
        "TrickleSource"
    }

    fn emit(&mut self, _event: &mut Event) -> Result<EmitResult> {
        Ok(EmitResult::Success)
    }
}

#[derive(Default)]
struct StallingTap {
    stalled: AtomicBool,
}

impl Processor for StallingTap {
    fn name(&self) -> &str {
        "StallingTap"
    }

    fn process(&self, _event: &Event) -> Result<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(5));
        }
        Ok(())
    }
}

#[test]
fn stalled_worker_times_out() {
    let mut registry = Registry::new();
    registry.add_source(TrickleSource);
    registry.add_processor(StallingTap::default());

    let params = ParameterManager::new();
    params.set("nthreads", 1usize);
    params.set("jana:nevents", 10u64);
    params.set("jana:timeout", 1u64);
    params.set("jana:warmup_timeout", 1u64);
    params.set("jana:show_ticker", false);
    params.set("jana:ticker_interval", 50u64);

    let topology = TopologyBuilder::from_params(registry, &params)
        .unwrap()
        .build()
        .unwrap();
    let engine = ExecutionEngine::new(topology, &params).unwrap();

    let err = engine.run().unwrap_err();
    match &err {
        Error::Timeout {
            worker_id,
            arrow,
            backtrace,
        } => {
            assert_eq!(*worker_id, 0);
            assert_eq!(arrow, "PhysicsEventTap");
            #[cfg(unix)]
            assert!(
                !backtrace.is_empty(),
                "timeout backtrace should name the stalled frame"
            );
            #[cfg(not(unix))]
            let _ = backtrace;
        }
        other => panic!("expected a timeout, got: {other}"),
    }
    assert_eq!(engine.run_status(), RunStatus::Failed);
    assert_eq!(engine.exit_code(), ExitCode::Timeout as i32);
}
