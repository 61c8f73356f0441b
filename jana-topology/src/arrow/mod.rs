use std::sync::Arc;

use jana_event::{Event, EventLevel, Result};
use smallvec::SmallVec;

use crate::mailbox::{Mailbox, PopOutcome};
use crate::pool::Pool;

mod fold;
mod map;
mod source;
mod tap;
mod unfold;

pub(crate) use fold::FoldArrow;
pub(crate) use map::{MapArrow, ProcessorCell};
pub(crate) use source::{SourceArrow, SourceConfig};
pub(crate) use tap::TapArrow;
pub(crate) use unfold::UnfoldArrow;

/// Index of a port within its arrow.
pub type PortIndex = usize;

/// What a port is bound to.
#[derive(Clone)]
pub enum PortBinding {
    /// A bounded handoff queue.
    Queue(Arc<Mailbox>),
    /// An event pool.
    Pool(Arc<Pool>),
}

/// An input or output endpoint of an arrow.
pub struct Port {
    pub(crate) binding: PortBinding,
    pub(crate) is_input: bool,
    // Events routed through this port count as completed at this arrow;
    // set on the retire ports of sink arrows.
    pub(crate) counts_completed: bool,
}

impl Port {
    pub(crate) fn input(binding: PortBinding) -> Self {
        Self {
            binding,
            is_input: true,
            counts_completed: false,
        }
    }

    pub(crate) fn output(binding: PortBinding) -> Self {
        Self {
            binding,
            is_input: false,
            counts_completed: false,
        }
    }

    pub(crate) fn retire(binding: PortBinding) -> Self {
        Self {
            binding,
            is_input: false,
            counts_completed: true,
        }
    }

    /// True if this is an input port.
    pub fn is_input(&self) -> bool {
        self.is_input
    }
}

/// Status returned by a completed fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireResult {
    /// More work is likely available.
    KeepGoing,
    /// Not ready right now (e.g. a source awaiting external data); retry
    /// after the backoff interval.
    ComeBackLater,
    /// This arrow will never fire again.
    Finished,
}

/// Output buffer filled by a fire: `(event, output port)` pairs. The engine
/// routes every entry to the queue or pool bound to its port.
pub type Outputs = SmallVec<[(Box<Event>, PortIndex); 4]>;

/// Outcome of pulling an input event for an arrow.
#[derive(Debug)]
pub enum PullResult {
    /// An event is ready.
    Event(Box<Event>),
    /// Nothing available on this port.
    Empty,
    /// The underlying partition was contended; advisory only.
    Congested,
}

// In-fire pull used by arrows that draw extra events beyond the one the
// scheduler handed them (chunked sources and taps, unfold child checkout).
// Congestion is treated as "nothing available"; the arrow just stops early.
pub(crate) fn pull_from(ports: &[Port], port: PortIndex, loc: usize) -> Option<Box<Event>> {
    match &ports[port].binding {
        PortBinding::Queue(queue) => match queue.try_pop(loc) {
            PopOutcome::Item(event) => Some(event),
            PopOutcome::Empty | PopOutcome::Congested => None,
        },
        PortBinding::Pool(pool) => pool.pop(loc),
    }
}

pub(crate) enum ArrowKind {
    Source(SourceArrow),
    Map(MapArrow),
    Tap(TapArrow),
    Unfold(UnfoldArrow),
    Fold(FoldArrow),
}

/// A node of the topology: a named stage with ports, firing on one input
/// event at a time.
///
/// The five variants share this record; variant-specific state lives in
/// the kind. Parallel arrows may fire concurrently from many workers; the
/// engine serializes the others via its `active_tasks` bookkeeping, so the
/// internal mutexes of sequential variants are uncontended.
pub struct Arrow {
    name: String,
    level: EventLevel,
    is_parallel: bool,
    is_source: bool,
    is_sink: bool,
    fan_out: usize,
    ports: Vec<Port>,
    kind: ArrowKind,
}

impl Arrow {
    pub(crate) fn new(
        name: String,
        level: EventLevel,
        is_parallel: bool,
        is_source: bool,
        is_sink: bool,
        fan_out: usize,
        ports: Vec<Port>,
        kind: ArrowKind,
    ) -> Self {
        Self {
            name,
            level,
            is_parallel,
            is_source,
            is_sink,
            fan_out,
            ports,
            kind,
        }
    }

    /// Arrow name, unique within the topology.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event level this arrow fires on.
    pub fn level(&self) -> EventLevel {
        self.level
    }

    /// Whether multiple workers may fire this arrow concurrently.
    pub fn is_parallel(&self) -> bool {
        self.is_parallel
    }

    /// Whether this arrow emits fresh events into the topology.
    pub fn is_source(&self) -> bool {
        self.is_source
    }

    /// Whether this arrow retires events (its completions drive the event
    /// count).
    pub fn is_sink(&self) -> bool {
        self.is_sink
    }

    /// Worst-case number of events one fire pushes to any single output
    /// queue; the engine reserves this much before firing.
    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// The arrow's ports.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Ports the scheduler should try to pull an input from, in order of
    /// preference. Empty means the arrow is ready without an input (it
    /// draws what it needs inside `fire`).
    pub fn next_input_ports(&self) -> SmallVec<[PortIndex; 2]> {
        match &self.kind {
            ArrowKind::Source(_) => SmallVec::from_slice(&[source::PORT_POOL]),
            ArrowKind::Map(_) | ArrowKind::Tap(_) => SmallVec::from_slice(&[0]),
            ArrowKind::Unfold(a) => a.next_input_ports(),
            ArrowKind::Fold(_) => SmallVec::from_slice(&[fold::PORT_CHILD_IN, fold::PORT_PARENT_IN]),
        }
    }

    /// Pulls one event from the given input port.
    pub fn pull(&self, port: PortIndex, loc: usize) -> PullResult {
        match &self.ports[port].binding {
            PortBinding::Queue(queue) => match queue.try_pop(loc) {
                PopOutcome::Item(event) => PullResult::Event(event),
                PopOutcome::Empty => PullResult::Empty,
                PopOutcome::Congested => PullResult::Congested,
            },
            PortBinding::Pool(pool) => match pool.pop(loc) {
                Some(event) => PullResult::Event(event),
                None => PullResult::Empty,
            },
        }
    }

    /// Reserves `fan_out` slots on every output queue port. Returns the
    /// per-port grants, or `None` (with everything rolled back) if any one
    /// output cannot be reserved in full; the arrow is then not ready.
    pub fn reserve_outputs(&self, loc: usize) -> Option<SmallVec<[(PortIndex, usize); 2]>> {
        let mut grants: SmallVec<[(PortIndex, usize); 2]> = SmallVec::new();
        for (idx, port) in self.ports.iter().enumerate() {
            if port.is_input {
                continue;
            }
            if let PortBinding::Queue(queue) = &port.binding {
                let granted = queue.reserve(self.fan_out, loc);
                if granted < self.fan_out {
                    queue.unreserve(granted, loc);
                    for (prev_idx, prev_granted) in grants {
                        if let PortBinding::Queue(q) = &self.ports[prev_idx].binding {
                            q.unreserve(prev_granted, loc);
                        }
                    }
                    return None;
                }
                grants.push((idx, granted));
            }
        }
        Some(grants)
    }

    /// Releases reservations taken by [`reserve_outputs`](Self::reserve_outputs)
    /// when the arrow turned out not to be ready after all.
    pub fn unreserve_outputs(&self, reservations: &[(PortIndex, usize)], loc: usize) {
        for &(port_idx, granted) in reservations {
            if let PortBinding::Queue(queue) = &self.ports[port_idx].binding {
                queue.unreserve(granted, loc);
            }
        }
    }

    /// Routes every output to the queue or pool bound to its port, paying
    /// back the given reservations (including unused ones). Returns how
    /// many events were retired through counting ports.
    pub fn push_outputs(
        &self,
        outputs: Outputs,
        reservations: &[(PortIndex, usize)],
        loc: usize,
    ) -> usize {
        let mut completed = 0;
        let mut queue_buckets: SmallVec<[(PortIndex, Vec<Box<Event>>); 2]> = SmallVec::new();
        for (event, port_idx) in outputs {
            let port = &self.ports[port_idx];
            if port.counts_completed {
                completed += 1;
            }
            match &port.binding {
                PortBinding::Pool(pool) => pool.push(event, loc),
                PortBinding::Queue(_) => {
                    match queue_buckets.iter_mut().find(|(idx, _)| *idx == port_idx) {
                        Some((_, bucket)) => bucket.push(event),
                        None => queue_buckets.push((port_idx, vec![event])),
                    }
                }
            }
        }
        // Reserved ports first, paying back the full grant even when fewer
        // events materialized; then any unreserved pushes.
        for &(port_idx, reserved) in reservations {
            if let PortBinding::Queue(queue) = &self.ports[port_idx].binding {
                let events = queue_buckets
                    .iter_mut()
                    .find(|(idx, _)| *idx == port_idx)
                    .map(|(_, bucket)| std::mem::take(bucket))
                    .unwrap_or_default();
                queue.push_and_unreserve(events, reserved, loc);
            }
        }
        for (port_idx, bucket) in queue_buckets {
            if bucket.is_empty() {
                continue;
            }
            if let PortBinding::Queue(queue) = &self.ports[port_idx].binding {
                queue.push_and_unreserve(bucket, 0, loc);
            }
        }
        completed
    }

    /// Fires the arrow on one input event (or none, for arrows that draw
    /// their own inputs). Outputs land in `outputs` for the engine to
    /// route. User errors propagate annotated; the input's ownership is
    /// transferred into `outputs` wherever possible, even on error.
    pub fn fire(
        &self,
        input: Option<Box<Event>>,
        input_port: Option<PortIndex>,
        outputs: &mut Outputs,
        loc: usize,
    ) -> Result<FireResult> {
        match &self.kind {
            ArrowKind::Source(a) => a.fire(input, &self.ports, outputs, loc),
            ArrowKind::Map(a) => a.fire(input, outputs),
            ArrowKind::Tap(a) => a.fire(input, &self.ports, outputs, loc),
            ArrowKind::Unfold(a) => a.fire(input, &self.ports, outputs, loc),
            ArrowKind::Fold(a) => a.fire(input, input_port, outputs),
        }
    }

    /// One-time setup before the first fire: opens sources, initializes
    /// processors, unfolders, and folders.
    pub fn initialize(&self) -> Result<()> {
        match &self.kind {
            ArrowKind::Source(a) => a.initialize(),
            ArrowKind::Map(a) => a.initialize(),
            ArrowKind::Tap(a) => a.initialize(),
            ArrowKind::Unfold(a) => a.initialize(),
            ArrowKind::Fold(a) => a.initialize(),
        }
    }

    /// End-of-run teardown, called once when the topology finishes.
    pub fn finalize(&self) -> Result<()> {
        match &self.kind {
            ArrowKind::Source(a) => a.finalize(),
            ArrowKind::Map(a) => a.finalize(),
            ArrowKind::Tap(a) => a.finalize(),
            ArrowKind::Unfold(a) => a.finalize(),
            ArrowKind::Fold(a) => a.finalize(),
        }
    }

    /// Events currently parked inside this arrow (unfold slots, fold
    /// buffers). Counted as in-flight by the conservation accounting.
    pub fn held_events(&self) -> usize {
        match &self.kind {
            ArrowKind::Unfold(a) => a.held_events(),
            ArrowKind::Fold(a) => a.held_events(),
            _ => 0,
        }
    }
}
