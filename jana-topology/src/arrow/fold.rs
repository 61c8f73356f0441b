use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use jana_event::{Error, Event, Folder, Result};
use jana_log::trace;

use super::{FireResult, Outputs, PortIndex};

pub(crate) const PORT_CHILD_IN: PortIndex = 0;
pub(crate) const PORT_PARENT_IN: PortIndex = 1;
pub(crate) const PORT_CHILD_POOL: PortIndex = 2;
pub(crate) const PORT_PARENT_OUT: PortIndex = 3;

#[derive(Default)]
struct PendingJoin {
    children: Vec<Box<Event>>,
    parent: Option<Box<Event>>,
}

struct FoldState {
    folder: Box<dyn Folder>,
    pending: BTreeMap<u64, PendingJoin>,
}

/// The N→1 level-crossing join.
///
/// Buffers processed children per parent event number, in arrival order.
/// The parent itself arrives on a second input port, stamped with the
/// expected child count by the unfolder; its arrival (or the last child's,
/// whichever comes later) completes the join: the folder callback runs,
/// children are recycled to their pool, and the parent moves on.
pub(crate) struct FoldArrow {
    plugin: String,
    state: Mutex<FoldState>,
}

impl FoldArrow {
    pub(crate) fn new(folder: Box<dyn Folder>, plugin: String) -> Self {
        Self {
            plugin,
            state: Mutex::new(FoldState {
                folder,
                pending: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FoldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn annotate(&self, err: Error, component: &str) -> Error {
        err.annotate(&self.plugin, component, "", "")
    }

    pub(crate) fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        let name = state.folder.name().to_owned();
        state.folder.init().map_err(|e| self.annotate(e, &name))
    }

    pub(crate) fn finalize(&self) -> Result<()> {
        let mut state = self.lock();
        let name = state.folder.name().to_owned();
        state.folder.finish().map_err(|e| self.annotate(e, &name))
    }

    pub(crate) fn held_events(&self) -> usize {
        let state = self.lock();
        state
            .pending
            .values()
            .map(|join| join.children.len() + join.parent.is_some() as usize)
            .sum()
    }

    pub(crate) fn fire(
        &self,
        input: Option<Box<Event>>,
        input_port: Option<PortIndex>,
        outputs: &mut Outputs,
    ) -> Result<FireResult> {
        let mut state = self.lock();
        let event = input.expect("fold arrows are scheduled with an input event");

        let parent_nr = match input_port {
            Some(PORT_CHILD_IN) => {
                let Some(parent_nr) = event.parent_nr() else {
                    let nr = event.event_nr();
                    outputs.push((event, PORT_CHILD_POOL));
                    return Err(Error::user(format!(
                        "event #{nr} reached a fold arrow without a parent link"
                    )));
                };
                state.pending.entry(parent_nr).or_default().children.push(event);
                parent_nr
            }
            Some(PORT_PARENT_IN) => {
                let parent_nr = event.event_nr();
                if event.child_count().is_none() {
                    outputs.push((event, PORT_PARENT_OUT));
                    return Err(Error::user(format!(
                        "parent #{parent_nr} reached a fold arrow without a child count"
                    )));
                }
                state.pending.entry(parent_nr).or_default().parent = Some(event);
                parent_nr
            }
            other => {
                outputs.push((event, PORT_CHILD_POOL));
                return Err(Error::user(format!(
                    "fold arrow fired with unexpected input port {other:?}"
                )));
            }
        };

        let complete = {
            let join = &state.pending[&parent_nr];
            match &join.parent {
                Some(parent) => {
                    join.children.len() >= parent.child_count().unwrap_or(usize::MAX)
                }
                None => false,
            }
        };
        if !complete {
            return Ok(FireResult::KeepGoing);
        }

        let mut join = state.pending.remove(&parent_nr).expect("present above");
        let mut parent = join.parent.take().expect("checked above");
        // Children arrive in unfold order; enforce sub-id order anyway so
        // an order-scrambling child chain cannot corrupt the join.
        join.children
            .sort_by_key(|child| child.child_idx().unwrap_or(usize::MAX));
        trace!(
            "folding {} children into parent {}",
            join.children.len(),
            parent_nr
        );

        let name = state.folder.name().to_owned();
        let result = state
            .folder
            .fold(&mut join.children, &mut parent)
            .map_err(|e| self.annotate(e, &name));
        for child in join.children {
            outputs.push((child, PORT_CHILD_POOL));
        }
        outputs.push((parent, PORT_PARENT_OUT));
        result?;
        Ok(FireResult::KeepGoing)
    }
}
