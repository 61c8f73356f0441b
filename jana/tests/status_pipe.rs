#![cfg(unix)]

use jana::prelude::*;

#[derive(Default)]
struct OneShotSource;

impl EventSource for OneShotSource {
    fn name(&self) -> &str {
        "OneShotSource"
    }

    fn emit(&mut self, _event: &mut Event) -> Result<EmitResult> {
        Ok(EmitResult::Finished)
    }
}

#[test]
fn engine_creates_the_status_fifo() {
    use std::os::unix::fs::FileTypeExt;

    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("jana_status");

    let mut registry = Registry::new();
    registry.add_source(OneShotSource);

    let params = ParameterManager::new();
    params.set("jana:status_fname", fifo.display().to_string());
    params.set("jana:show_ticker", false);

    let topology = TopologyBuilder::from_params(registry, &params)
        .unwrap()
        .build()
        .unwrap();
    let _engine = ExecutionEngine::new(topology, &params).unwrap();

    let metadata = std::fs::metadata(&fifo).unwrap();
    assert!(metadata.file_type().is_fifo());
}
