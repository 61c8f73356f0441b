//! Event model for the jana event-processing framework.
//!
//! An [`Event`] is the unit of work that travels through the topology. It
//! owns a [`FactorySet`]: a registry of lazy, memoized producers of typed
//! collections, keyed by `(object type, tag)`. User components (sources,
//! processors, unfolders) are defined here as traits; the arrows that drive
//! them live in `jana-topology`.

#![warn(missing_docs)]

mod callgraph;
mod components;
mod error;
mod event;
mod factory;
mod factory_set;
mod level;

pub use callgraph::{CallGraph, CallGraphEntry};
pub use components::{
    EmitResult, EventSource, FactoryGenerator, Folder, Processor, UnfoldResult, Unfolder,
};
pub use error::{Error, Result};
pub use event::Event;
pub use factory::{CollectionRef, Factory, FactoryStatus, Slot};
pub use factory_set::FactorySet;
pub use level::EventLevel;
