use jana_log::Level;

#[test]
fn macros_compile_and_emit() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .try_init();

    jana_log::trace!("trace");
    jana_log::debug!("debug");
    jana_log::info!("info");
    jana_log::warn!("warn");
    jana_log::error!("error");
}
