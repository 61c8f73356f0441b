use std::fmt;
use std::sync::Arc;

use crate::arrow::Arrow;
use crate::mailbox::Mailbox;
use crate::mapping::ProcessorMapping;
use crate::pool::Pool;

/// The immutable processing graph: arrows, queues, pools, and the
/// worker-to-CPU mapping. Built once by the [`TopologyBuilder`]; the
/// execution engine only reads it.
///
/// [`TopologyBuilder`]: crate::TopologyBuilder
pub struct Topology {
    pub(crate) arrows: Vec<Arc<Arrow>>,
    pub(crate) queues: Vec<Arc<Mailbox>>,
    pub(crate) pools: Vec<Arc<Pool>>,
    pub(crate) mapping: ProcessorMapping,
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("arrows", &self.arrows.len())
            .field("queues", &self.queues.len())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl Topology {
    /// The arrows, in scheduling order.
    pub fn arrows(&self) -> &[Arc<Arrow>] {
        &self.arrows
    }

    /// All queues.
    pub fn queues(&self) -> &[Arc<Mailbox>] {
        &self.queues
    }

    /// All pools, one per level.
    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    /// The worker-id → (cpu, location) table.
    pub fn mapping(&self) -> &ProcessorMapping {
        &self.mapping
    }

    /// Sum of all pool capacities: the fixed number of events resident in
    /// the system for the whole run (when in-flight limiting is on).
    pub fn initial_event_capacity(&self) -> usize {
        self.pools.iter().map(|pool| pool.capacity()).sum()
    }

    /// Events currently accounted for by pools, queues, and arrow-internal
    /// slots. At any quiescent moment this plus the in-flight task count
    /// equals [`initial_event_capacity`](Self::initial_event_capacity).
    pub fn resident_event_count(&self) -> usize {
        let pooled: usize = self.pools.iter().map(|pool| pool.size()).sum();
        let queued: usize = self.queues.iter().map(|queue| queue.size()).sum();
        let held: usize = self.arrows.iter().map(|arrow| arrow.held_events()).sum();
        pooled + queued + held
    }
}
