//! Two-level demo: a timeslice source, an unfolder that slices each
//! timeslice into physics events, and a folder that reports the join.

use jana::prelude::*;

struct Window {
    start: u64,
    width: u64,
}

#[derive(Default)]
struct WindowSource;

impl EventSource for WindowSource {
    fn name(&self) -> &str {
        "WindowSource"
    }

    fn level(&self) -> EventLevel {
        EventLevel::Timeslice
    }

    fn emit(&mut self, event: &mut Event) -> Result<EmitResult> {
        let start = event.event_nr() * 1000;
        event.insert(vec![Window { start, width: 1000 }], "window");
        Ok(EmitResult::Success)
    }
}

struct WindowSlicer {
    slices: u64,
}

impl Unfolder for WindowSlicer {
    fn name(&self) -> &str {
        "WindowSlicer"
    }

    fn parent_level(&self) -> EventLevel {
        EventLevel::Timeslice
    }

    fn child_level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    fn unfold(&mut self, parent: &Event, child: &mut Event, item_idx: usize) -> Result<UnfoldResult> {
        if item_idx as u64 >= self.slices {
            return Ok(UnfoldResult::NextParent);
        }
        let window = parent.get::<Window>("window")?;
        let slice_width = window[0].width / self.slices;
        let start = window[0].start + item_idx as u64 * slice_width;
        drop(window);
        child.set_event_nr(parent.event_nr() * self.slices + item_idx as u64);
        child.insert(vec![Window { start, width: slice_width }], "slice");
        Ok(UnfoldResult::KeepParent)
    }
}

#[derive(Default)]
struct JoinReporter;

impl Folder for JoinReporter {
    fn name(&self) -> &str {
        "JoinReporter"
    }

    fn child_level(&self) -> EventLevel {
        EventLevel::PhysicsEvent
    }

    fn fold(&mut self, children: &mut [Box<Event>], parent: &mut Event) -> Result<()> {
        println!(
            "timeslice {} folded {} slices",
            parent.event_nr(),
            children.len()
        );
        Ok(())
    }
}

fn main() -> Result<()> {
    let mut registry = Registry::new();
    registry.add_source(WindowSource);
    registry.add_unfolder(WindowSlicer { slices: 4 });
    registry.add_folder(JoinReporter);

    let params = ParameterManager::new();
    params.set("nthreads", 2usize);
    params.set("jana:nevents", 10u64);
    params.set("jana:show_ticker", false);

    let topology = TopologyBuilder::from_params(registry, &params)?.build()?;
    let engine = ExecutionEngine::new(topology, &params)?;
    engine.run()?;
    engine.finish()
}
