use crate::{Event, EventLevel, FactorySet, Result};

/// Outcome of one [`EventSource::emit`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitResult {
    /// The event was filled and should enter the pipeline.
    Success,
    /// Nothing available right now (e.g. waiting on external data); the
    /// engine will retry after a backoff interval.
    TryAgainLater,
    /// The source is exhausted and will never emit again.
    Finished,
}

/// A producer of events, pulled by a source arrow.
///
/// `emit` must not block indefinitely: return
/// [`EmitResult::TryAgainLater`] instead of waiting for external data, so
/// the worker keeps heartbeating.
pub trait EventSource: Send {
    /// Component name, used in logs and reports.
    fn name(&self) -> &str;

    /// The level of the events this source emits.
    fn level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    /// Called once before the first `emit`.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fills the next event. The framework has already assigned the event
    /// number (monotonically non-decreasing within the level); the source
    /// may override it, e.g. when replaying a file with embedded numbering.
    fn emit(&mut self, event: &mut Event) -> Result<EmitResult>;

    /// Called once after the source finishes or the run ends.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A per-event computation attached to the pipeline.
///
/// `process_parallel` runs on the parallel map arrow, possibly on many
/// events concurrently (one call per event; the event itself is exclusive).
/// `process` runs on the sequential tap arrow, in event-number order for
/// its level. Override whichever stages apply.
pub trait Processor: Send + Sync {
    /// Component name, used in logs and reports.
    fn name(&self) -> &str;

    /// The level this processor subscribes to.
    fn level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    /// Called once before the first event.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Parallel stage: enrich the event (compute collections, insert
    /// derived data). No ordering guarantees across events.
    fn process_parallel(&self, _event: &mut Event) -> Result<()> {
        Ok(())
    }

    /// Sequential stage: observe the finished event. Side-effects happen
    /// in event-number order at this processor's level.
    fn process(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    /// Called once when the topology finishes.
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of one [`Unfolder::unfold`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnfoldResult {
    /// The child was filled and is emitted; more children follow from the
    /// same parent.
    KeepParent,
    /// The parent is complete. The child passed to this call was *not*
    /// filled and is retained for the next parent.
    NextParent,
    /// The unfolder is done for good; the current parent is released and
    /// the arrow finishes.
    Finished,
}

/// Splits one parent event into N children, one `unfold` call at a time.
pub trait Unfolder: Send {
    /// Component name, used in logs and reports.
    fn name(&self) -> &str;

    /// Level of the events consumed.
    fn parent_level(&self) -> EventLevel;

    /// Level of the events produced.
    fn child_level(&self) -> EventLevel;

    /// Called once before the first parent.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Optional cache warm-up, called at most once per parent before the
    /// first `unfold`. Best-effort: implementations must not rely on it
    /// being called, and `unfold` must be self-sufficient.
    fn preprocess(&self, _parent: &Event) -> Result<()> {
        Ok(())
    }

    /// Produces the `item_idx`-th child of `parent`, or reports that the
    /// parent is complete. Children inherit the parent's run number and
    /// receive consecutive sub-ids starting at 0.
    fn unfold(&mut self, parent: &Event, child: &mut Event, item_idx: usize)
        -> Result<UnfoldResult>;

    /// Called once when the topology finishes.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Joins the processed children of one parent back into the parent.
///
/// The fold arrow collects children per parent and calls `fold` exactly
/// once per parent, with the children in sub-id order. Afterwards the
/// children are recycled and the parent continues downstream.
pub trait Folder: Send {
    /// Component name, used in logs and reports.
    fn name(&self) -> &str;

    /// Level of the children consumed (the unfolder's child level).
    fn child_level(&self) -> EventLevel;

    /// Called once before the first join.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Merges the children's results into the parent.
    fn fold(&mut self, _children: &mut [Box<Event>], _parent: &mut Event) -> Result<()> {
        Ok(())
    }

    /// Called once when the topology finishes.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Populates the factory set of every event created at one level.
pub trait FactoryGenerator: Send + Sync {
    /// The level whose events receive these factories.
    fn level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    /// Registers factory slots into a fresh set.
    fn generate(&self, set: &mut FactorySet) -> Result<()>;
}
