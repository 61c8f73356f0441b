//!
#![doc = include_str!("../../README.md")]
#![warn(missing_docs)]

pub use jana_engine as engine;
pub use jana_event as event;
pub use jana_log as log;
pub use jana_params as params;
pub use jana_topology as topology;

/// The types most embeddings need: component traits, the registry, the
/// builder, and the engine.
pub mod prelude {
    pub use jana_engine::{ExecutionEngine, ExitCode, Perf, RunStatus, Task};
    pub use jana_event::{
        CollectionRef, EmitResult, Error, Event, EventLevel, EventSource, Factory,
        FactoryGenerator, FactorySet, Folder, Processor, Result, Slot, UnfoldResult, Unfolder,
    };
    pub use jana_params::ParameterManager;
    pub use jana_topology::{Registry, Topology, TopologyBuilder, TopologyConfig};
}
