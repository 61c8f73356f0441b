use std::sync::{Arc, Mutex, PoisonError};

use jana_event::{Error, Processor, Result};

use super::{FireResult, Outputs, PortIndex};

const PORT_OUT: PortIndex = 1;

/// One registered processor, shared between the map and tap arrows of its
/// level. `initialize`/`finish` run exactly once no matter which arrow gets
/// there first.
pub(crate) struct ProcessorCell {
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) plugin: String,
    initialized: Mutex<bool>,
    finished: Mutex<bool>,
}

impl ProcessorCell {
    pub(crate) fn new(processor: Arc<dyn Processor>, plugin: String) -> Self {
        Self {
            processor,
            plugin,
            initialized: Mutex::new(false),
            finished: Mutex::new(false),
        }
    }

    pub(crate) fn annotate(&self, err: Error) -> Error {
        err.annotate(&self.plugin, self.processor.name(), "", "")
    }

    pub(crate) fn initialize(&self) -> Result<()> {
        let mut done = self
            .initialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*done {
            self.processor.init().map_err(|e| self.annotate(e))?;
            *done = true;
        }
        Ok(())
    }

    pub(crate) fn finish(&self) -> Result<()> {
        let mut done = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if !*done {
            self.processor.finish().map_err(|e| self.annotate(e))?;
            *done = true;
        }
        Ok(())
    }
}

/// The parallel enrichment stage: runs every processor's
/// `process_parallel` on one event, then forwards it. Many workers may
/// fire this arrow concurrently on different events.
pub(crate) struct MapArrow {
    cells: Vec<Arc<ProcessorCell>>,
}

impl MapArrow {
    pub(crate) fn new(cells: Vec<Arc<ProcessorCell>>) -> Self {
        Self { cells }
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

    pub(crate) fn fire(
        &self,
        input: Option<Box<jana_event::Event>>,
        outputs: &mut Outputs,
    ) -> Result<FireResult> {
        let mut event = input.expect("map arrows are scheduled with an input event");
        for cell in &self.cells {
            if let Err(err) = cell.processor.process_parallel(&mut event) {
                outputs.push((event, PORT_OUT));
                return Err(cell.annotate(err));
            }
        }
        outputs.push((event, PORT_OUT));
        Ok(FireResult::KeepGoing)
    }
}
