use std::sync::{Mutex, MutexGuard, PoisonError};

use jana_event::{Error, Event, Result, UnfoldResult, Unfolder};
use jana_log::trace;
use smallvec::SmallVec;

use super::{FireResult, Outputs, Port, PortIndex};

pub(crate) const PORT_PARENT_IN: PortIndex = 0;
pub(crate) const PORT_CHILD_POOL: PortIndex = 1;
pub(crate) const PORT_CHILD_OUT: PortIndex = 2;
pub(crate) const PORT_PARENT_OUT: PortIndex = 3;

struct UnfoldState {
    unfolder: Box<dyn Unfolder>,
    // The parent being unfolded. Owned here, not by any queue, until the
    // unfolder reports NextParent.
    parent: Option<Box<Event>>,
    // Child checked out for a call that ended the parent; reused for the
    // next parent instead of bouncing through the pool.
    spare_child: Option<Box<Event>>,
    next_item_idx: usize,
    emitted_children: usize,
    finished: bool,
}

/// The 1→N level-crossing split.
///
/// Holds one parent at a time. Each fire emits at most one child, drawn
/// from the child pool; when the unfolder reports `NextParent` the parent
/// is stamped with its final child count and forwarded to the matching
/// fold arrow, which uses it as the join terminator.
pub(crate) struct UnfoldArrow {
    plugin: String,
    state: Mutex<UnfoldState>,
}

impl UnfoldArrow {
    pub(crate) fn new(unfolder: Box<dyn Unfolder>, plugin: String) -> Self {
        Self {
            plugin,
            state: Mutex::new(UnfoldState {
                unfolder,
                parent: None,
                spare_child: None,
                next_item_idx: 0,
                emitted_children: 0,
                finished: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnfoldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn annotate(&self, err: Error, component: &str) -> Error {
        err.annotate(&self.plugin, component, "", "")
    }

    pub(crate) fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        let name = state.unfolder.name().to_owned();
        state.unfolder.init().map_err(|e| self.annotate(e, &name))
    }

    pub(crate) fn finalize(&self) -> Result<()> {
        let mut state = self.lock();
        let name = state.unfolder.name().to_owned();
        state.unfolder.finish().map_err(|e| self.annotate(e, &name))
    }

    /// Only accepts a new parent when the slot is free; with a parent in
    /// hand the arrow is ready without any input.
    pub(crate) fn next_input_ports(&self) -> SmallVec<[PortIndex; 2]> {
        if self.lock().parent.is_some() {
            SmallVec::new()
        } else {
            SmallVec::from_slice(&[PORT_PARENT_IN])
        }
    }

    pub(crate) fn held_events(&self) -> usize {
        let state = self.lock();
        state.parent.is_some() as usize + state.spare_child.is_some() as usize
    }

    pub(crate) fn fire(
        &self,
        input: Option<Box<Event>>,
        ports: &[Port],
        outputs: &mut Outputs,
        loc: usize,
    ) -> Result<FireResult> {
        let mut state = self.lock();
        if state.finished {
            if let Some(event) = input {
                outputs.push((event, PORT_PARENT_IN));
            }
            return Ok(FireResult::Finished);
        }

        if let Some(parent) = input {
            debug_assert!(state.parent.is_none(), "parent slot already occupied");
            let name = state.unfolder.name().to_owned();
            state
                .unfolder
                .preprocess(&parent)
                .map_err(|e| self.annotate(e, &name))?;
            state.parent = Some(parent);
            state.next_item_idx = 0;
            state.emitted_children = 0;
        }

        if state.parent.is_none() {
            // Raced with a pause between scheduling and firing.
            return Ok(FireResult::ComeBackLater);
        }

        // Check out a child before touching user code.
        let mut child = match state.spare_child.take() {
            Some(child) => child,
            None => match super::pull_from(ports, PORT_CHILD_POOL, loc) {
                Some(child) => child,
                None => return Ok(FireResult::ComeBackLater),
            },
        };

        let item_idx = state.next_item_idx;
        let UnfoldState {
            unfolder,
            parent,
            emitted_children,
            ..
        } = &mut *state;
        let parent_ref = parent.as_ref().expect("checked above");

        child.set_run_nr(parent_ref.run_nr());
        child.set_event_nr(parent_ref.event_nr());
        child.set_parent(parent_ref.event_nr(), *emitted_children);

        match unfolder.unfold(parent_ref, &mut child, item_idx) {
            Ok(UnfoldResult::KeepParent) => {
                trace!(
                    "unfolded child {} of parent {}",
                    *emitted_children,
                    parent_ref.event_nr()
                );
                outputs.push((child, PORT_CHILD_OUT));
                state.emitted_children += 1;
                state.next_item_idx += 1;
                Ok(FireResult::KeepGoing)
            }
            Ok(UnfoldResult::NextParent) => {
                child.reset();
                state.spare_child = Some(child);
                let mut parent = state.parent.take().expect("checked above");
                parent.set_child_count(state.emitted_children);
                outputs.push((parent, PORT_PARENT_OUT));
                Ok(FireResult::KeepGoing)
            }
            Ok(UnfoldResult::Finished) => {
                child.reset();
                outputs.push((child, PORT_CHILD_POOL));
                state.finished = true;
                // The current parent still joins whatever children it
                // already emitted.
                let mut parent = state.parent.take().expect("checked above");
                parent.set_child_count(state.emitted_children);
                outputs.push((parent, PORT_PARENT_OUT));
                Ok(FireResult::Finished)
            }
            Err(err) => {
                let name = state.unfolder.name().to_owned();
                outputs.push((child, PORT_CHILD_POOL));
                Err(self.annotate(err, &name))
            }
        }
    }
}
