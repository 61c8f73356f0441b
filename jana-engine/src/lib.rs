//! The execution engine: worker threads, the cooperative scheduler, the
//! run-state machine, and the supervisor.
//!
//! Typical embedding:
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.add_source(MySource::default());
//! registry.add_processor(MyProcessor::default());
//! let params = ParameterManager::new();
//! let topology = TopologyBuilder::from_params(registry, &params)?.build()?;
//! let engine = ExecutionEngine::new(topology, &params)?;
//! engine.run()?;
//! engine.finish()?;
//! ```

mod engine;
pub mod signal;
mod supervisor;

pub use engine::{ExecutionEngine, ExitCode, Perf, RunStatus, Task};
