use std::sync::{Mutex, MutexGuard, PoisonError};

use jana_event::{EmitResult, Error, Event, EventSource, Result};
use jana_log::debug;

use super::{FireResult, Outputs, Port, PortIndex};

pub(crate) const PORT_POOL: PortIndex = 0;
pub(crate) const PORT_OUT: PortIndex = 1;

pub(crate) struct SourceConfig {
    pub nevents: Option<u64>,
    pub nskip: u64,
    pub chunksize: usize,
}

struct SourceState {
    source: Box<dyn EventSource>,
    emitted: u64,
    delivered: u64,
    finished: bool,
}

/// Wraps an [`EventSource`]: pulls fresh events from the level's pool,
/// fills them, and emits them on the level's entry queue. Sequential.
pub(crate) struct SourceArrow {
    plugin: String,
    nevents: Option<u64>,
    nskip: u64,
    chunksize: usize,
    state: Mutex<SourceState>,
}

impl SourceArrow {
    pub(crate) fn new(source: Box<dyn EventSource>, plugin: String, config: SourceConfig) -> Self {
        Self {
            plugin,
            nevents: config.nevents,
            nskip: config.nskip,
            chunksize: config.chunksize.max(1),
            state: Mutex::new(SourceState {
                source,
                emitted: 0,
                delivered: 0,
                finished: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn annotate(&self, err: Error, component: &str) -> Error {
        err.annotate(&self.plugin, component, "", "")
    }

    pub(crate) fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        let name = state.source.name().to_owned();
        state.source.open().map_err(|e| self.annotate(e, &name))
    }

    pub(crate) fn finalize(&self) -> Result<()> {
        let mut state = self.lock();
        if state.finished {
            // Self-terminated sources already closed inside fire.
            return Ok(());
        }
        state.finished = true;
        let name = state.source.name().to_owned();
        state.source.close().map_err(|e| self.annotate(e, &name))
    }

    pub(crate) fn fire(
        &self,
        input: Option<Box<Event>>,
        ports: &[Port],
        outputs: &mut Outputs,
        loc: usize,
    ) -> Result<FireResult> {
        let mut state = self.lock();
        let mut event = input.expect("source arrows are scheduled with a pool event");
        let name = state.source.name().to_owned();
        let mut produced = 0usize;

        loop {
            if state.finished {
                outputs.push((event, PORT_POOL));
                return Ok(FireResult::Finished);
            }
            if let Some(limit) = self.nevents {
                if state.delivered >= limit {
                    debug!("source '{name}' reached its event limit of {limit}");
                    state.finished = true;
                    outputs.push((event, PORT_POOL));
                    state.source.close().map_err(|e| self.annotate(e, &name))?;
                    return Ok(FireResult::Finished);
                }
            }

            // Assigned before user code runs; sources may override.
            event.set_event_nr(state.emitted);

            match state.source.emit(&mut event) {
                Ok(EmitResult::Success) => {
                    state.emitted += 1;
                    if state.emitted <= self.nskip {
                        // Inside the skip window: recycle in place and
                        // emit again. The event number still advances.
                        event.reset();
                        continue;
                    }
                    state.delivered += 1;
                    outputs.push((event, PORT_OUT));
                    produced += 1;
                    if produced >= self.chunksize {
                        return Ok(FireResult::KeepGoing);
                    }
                    // Room left in this chunk: try for another pool event.
                    match super::pull_from(ports, PORT_POOL, loc) {
                        Some(next) => event = next,
                        None => return Ok(FireResult::KeepGoing),
                    }
                }
                Ok(EmitResult::TryAgainLater) => {
                    outputs.push((event, PORT_POOL));
                    return Ok(if produced > 0 {
                        FireResult::KeepGoing
                    } else {
                        FireResult::ComeBackLater
                    });
                }
                Ok(EmitResult::Finished) => {
                    debug!("source '{name}' exhausted after {} events", state.delivered);
                    state.finished = true;
                    outputs.push((event, PORT_POOL));
                    state.source.close().map_err(|e| self.annotate(e, &name))?;
                    return Ok(FireResult::Finished);
                }
                Err(err) => {
                    outputs.push((event, PORT_POOL));
                    return Err(self.annotate(err, &name));
                }
            }
        }
    }
}
