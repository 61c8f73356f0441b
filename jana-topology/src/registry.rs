use std::sync::Arc;

use jana_event::{EventSource, FactoryGenerator, Folder, Processor, Unfolder};

/// The component lists consumed by the topology builder.
///
/// Plays the role of the plugin layer's component manager: each plugin's
/// init callback receives `&mut Registry` and registers its components,
/// tagged with the plugin name for error context. In-process registration
/// uses the same calls with an empty plugin name.
#[derive(Default)]
pub struct Registry {
    current_plugin: String,
    pub(crate) sources: Vec<(Box<dyn EventSource>, String)>,
    pub(crate) processors: Vec<(Arc<dyn Processor>, String)>,
    pub(crate) unfolders: Vec<(Box<dyn Unfolder>, String)>,
    pub(crate) folders: Vec<(Box<dyn Folder>, String)>,
    pub(crate) generators: Vec<(Box<dyn FactoryGenerator>, String)>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a plugin's registration callback; components registered inside
    /// carry the plugin name in their error context.
    pub fn install_plugin(&mut self, name: &str, init: impl FnOnce(&mut Registry)) {
        let previous = std::mem::replace(&mut self.current_plugin, name.to_owned());
        init(self);
        self.current_plugin = previous;
    }

    /// Registers an event source.
    pub fn add_source(&mut self, source: impl EventSource + 'static) {
        self.sources
            .push((Box::new(source), self.current_plugin.clone()));
    }

    /// Registers an event processor.
    pub fn add_processor(&mut self, processor: impl Processor + 'static) {
        self.processors
            .push((Arc::new(processor), self.current_plugin.clone()));
    }

    /// Registers an unfolder.
    pub fn add_unfolder(&mut self, unfolder: impl Unfolder + 'static) {
        self.unfolders
            .push((Box::new(unfolder), self.current_plugin.clone()));
    }

    /// Registers a folder, paired with the unfolder of the same child
    /// level at build time. Levels without a registered folder get a
    /// structural join with no user callback.
    pub fn add_folder(&mut self, folder: impl Folder + 'static) {
        self.folders
            .push((Box::new(folder), self.current_plugin.clone()));
    }

    /// Registers a factory generator.
    pub fn add_generator(&mut self, generator: impl FactoryGenerator + 'static) {
        self.generators
            .push((Box::new(generator), self.current_plugin.clone()));
    }

    /// True if no source has been registered.
    pub fn has_no_sources(&self) -> bool {
        self.sources.is_empty()
    }
}
