use std::sync::Arc;

use jana_event::{Event, Result};

use super::map::ProcessorCell;
use super::{FireResult, Outputs, Port, PortIndex};

const PORT_IN: PortIndex = 0;
const PORT_OUT: PortIndex = 1;

/// The sequential observation stage: runs every processor's `process` on
/// events in arrival order, then retires or forwards them. Never parallel,
/// which is what gives `process` its total order over the level.
pub(crate) struct TapArrow {
    cells: Vec<Arc<ProcessorCell>>,
    chunksize: usize,
}

impl TapArrow {
    pub(crate) fn new(cells: Vec<Arc<ProcessorCell>>, chunksize: usize) -> Self {
        Self {
            cells,
            chunksize: chunksize.max(1),
        }
    }

    pub(crate) fn initialize(&self) -> Result<()> {
        for cell in &self.cells {
            cell.initialize()?;
        }
        Ok(())
    }

    pub(crate) fn finalize(&self) -> Result<()> {
        for cell in &self.cells {
            cell.finish()?;
        }
        Ok(())
    }

    fn process_one(&self, event: &Event) -> Result<()> {
        for cell in &self.cells {
            cell.processor
                .process(event)
                .map_err(|e| cell.annotate(e))?;
        }
        Ok(())
    }

    pub(crate) fn fire(
        &self,
        input: Option<Box<Event>>,
        ports: &[Port],
        outputs: &mut Outputs,
        loc: usize,
    ) -> Result<FireResult> {
        let event = input.expect("tap arrows are scheduled with an input event");
        let result = self.process_one(&event);
        outputs.push((event, PORT_OUT));
        result?;

        // Chunked draining: grab whatever else is already queued, up to the
        // configured chunk, to amortize the scheduler round-trip.
        if self.chunksize > 1 {
            if let super::PortBinding::Queue(queue) = &ports[PORT_IN].binding {
                for event in queue.try_pop_chunk(self.chunksize - 1, loc) {
                    let result = self.process_one(&event);
                    outputs.push((event, PORT_OUT));
                    result?;
                }
            }
        }
        Ok(FireResult::KeepGoing)
    }
}
