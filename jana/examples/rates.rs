//! Synthetic throughput demo: one source, a parallel map stage that burns
//! CPU, and a sequential tap. Run with `--release` to see the ticker
//! report realistic rates.

use std::hint::black_box;

use jana::prelude::*;

struct Sample {
    charge: u32,
}

#[derive(Default)]
struct SyntheticSource;

impl EventSource for SyntheticSource {
    fn name(&self) -> &str {
        "SyntheticSource"
    }

    fn emit(&mut self, event: &mut Event) -> Result<EmitResult> {
        let base = event.event_nr() as u32;
        event.insert(
            (0..64).map(|i| Sample { charge: base.wrapping_add(i) }).collect(),
            "raw",
        );
        Ok(EmitResult::Success)
    }
}

#[derive(Default)]
struct Integrator;

impl Processor for Integrator {
    fn name(&self) -> &str {
        "Integrator"
    }

    fn process_parallel(&self, event: &mut Event) -> Result<()> {
        let total: u64 = {
            let samples = event.get::<Sample>("raw")?;
            samples.iter().map(|s| u64::from(s.charge)).sum()
        };
        // Pretend the integration is expensive.
        let mut acc = total;
        for _ in 0..10_000 {
            acc = black_box(acc.rotate_left(1) ^ 0x9e37_79b9);
        }
        event.insert(vec![Sample { charge: acc as u32 }], "integrated");
        Ok(())
    }

    fn process(&self, event: &Event) -> Result<()> {
        let _ = event.get::<Sample>("integrated")?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let mut registry = Registry::new();
    registry.add_source(SyntheticSource);
    registry.add_processor(Integrator);

    let params = ParameterManager::new();
    params.set("nthreads", 4usize);
    params.set("jana:nevents", 100_000u64);

    let topology = TopologyBuilder::from_params(registry, &params)?.build()?;
    let engine = ExecutionEngine::new(topology, &params)?;
    engine.run()?;
    let perf = engine.perf();
    println!(
        "{} events in {:.2}s ({:.0} Hz)",
        perf.event_count,
        perf.uptime.as_secs_f64(),
        perf.throughput_hz
    );
    engine.finish()
}
