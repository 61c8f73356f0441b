//! The static processing graph: arrows connected by bounded queues and
//! backed by event pools.
//!
//! A [`Topology`] is immutable once built. The [`TopologyBuilder`] wires
//! the components registered in a [`Registry`] into the standard chain
//! `source → map → tap → retire`, inserting an unfold/fold arrow pair
//! wherever a registered unfolder bridges two event levels. The execution
//! engine (in `jana-engine`) drives the arrows; everything here is passive.

mod arrow;
mod builder;
mod mailbox;
mod mapping;
mod pool;
mod registry;
mod topology;

pub use arrow::{Arrow, FireResult, Outputs, Port, PortBinding, PortIndex, PullResult};
pub use builder::{TopologyBuilder, TopologyConfig};
pub use mailbox::{Mailbox, MailboxStatus, PopOutcome};
pub use mapping::{AffinityStrategy, LocalityStrategy, ProcessorMapping};
pub use pool::Pool;
pub use registry::Registry;
pub use topology::Topology;
