use std::collections::HashMap;
use std::sync::Arc;

use jana_event::{Error, EventLevel, FactoryGenerator, FactorySet, Folder, Result};
use jana_log::{debug, warn};
use jana_params::ParameterManager;

use crate::arrow::{
    Arrow, ArrowKind, FoldArrow, MapArrow, Port, PortBinding, ProcessorCell, SourceArrow,
    SourceConfig, TapArrow, UnfoldArrow,
};
use crate::mailbox::Mailbox;
use crate::mapping::{AffinityStrategy, LocalityStrategy, ProcessorMapping};
use crate::pool::Pool;
use crate::registry::Registry;
use crate::topology::Topology;

/// Tunables consumed by the builder, normally read from the parameter
/// store with [`TopologyConfig::from_params`].
pub struct TopologyConfig {
    /// Capacity of each event pool (`jana:event_pool_size`).
    pub pool_capacity: usize,
    /// If true, pool capacity caps the number of events in flight
    /// (`jana:limit_total_events_in_flight`).
    pub limit_in_flight: bool,
    /// Soft per-location queue capacity (`jana:event_queue_threshold`).
    pub queue_threshold: usize,
    /// Events emitted per source fire (`jana:event_source_chunksize`).
    pub source_chunksize: usize,
    /// Events drained per tap fire (`jana:event_processor_chunksize`).
    pub processor_chunksize: usize,
    /// Allow cross-location pops (`jana:enable_stealing`).
    pub enable_stealing: bool,
    /// Thread pinning policy (`jana:affinity`).
    pub affinity: AffinityStrategy,
    /// Location granularity (`jana:locality`).
    pub locality: LocalityStrategy,
    /// Per-source delivered-event limit (`jana:nevents`, 0 = unlimited).
    pub nevents: Option<u64>,
    /// Per-source skip count (`jana:nskip`).
    pub nskip: u64,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 4,
            limit_in_flight: true,
            queue_threshold: 80,
            source_chunksize: 40,
            processor_chunksize: 1,
            enable_stealing: false,
            affinity: AffinityStrategy::None,
            locality: LocalityStrategy::Global,
            nevents: None,
            nskip: 0,
        }
    }
}

impl TopologyConfig {
    /// Declares and reads every builder tunable from the parameter store.
    pub fn from_params(params: &ParameterManager) -> Result<Self> {
        let config_err = |e: jana_params::ParseError| Error::Configuration(e.to_string());

        let nthreads = params
            .set_default("nthreads", 1usize, "Initial worker count")
            .map_err(config_err)?;
        let pool_capacity = params
            .set_default(
                "jana:event_pool_size",
                nthreads.max(4),
                "Capacity of each event pool",
            )
            .map_err(config_err)?;
        let limit_in_flight = params
            .set_default(
                "jana:limit_total_events_in_flight",
                true,
                "If true, pool size caps concurrency",
            )
            .map_err(config_err)?;
        let queue_threshold = params
            .set_default(
                "jana:event_queue_threshold",
                80usize,
                "Per-location queue soft capacity",
            )
            .map_err(config_err)?;
        let source_chunksize = params
            .set_default(
                "jana:event_source_chunksize",
                40usize,
                "Events emitted per source fire",
            )
            .map_err(config_err)?;
        let processor_chunksize = params
            .set_default(
                "jana:event_processor_chunksize",
                1usize,
                "Events drained per processor fire",
            )
            .map_err(config_err)?;
        let enable_stealing = params
            .set_default(
                "jana:enable_stealing",
                false,
                "Allow cross-location queue pops",
            )
            .map_err(config_err)?;
        let affinity_raw = params
            .set_default(
                "jana:affinity",
                0i64,
                "Thread pinning: 0=None, 1=ComputeBound, 2=MemoryBound",
            )
            .map_err(config_err)?;
        let locality_raw = params
            .set_default(
                "jana:locality",
                0i64,
                "Locations: 0=Global, 1=SocketLocal, 2=NumaLocal, 3=CoreLocal",
            )
            .map_err(config_err)?;
        let nevents = params
            .set_default("jana:nevents", 0u64, "Event limit per source (0 = all)")
            .map_err(config_err)?;
        let nskip = params
            .set_default("jana:nskip", 0u64, "Events to skip per source")
            .map_err(config_err)?;

        let affinity = AffinityStrategy::try_from(affinity_raw)
            .map_err(|v| Error::Configuration(format!("unknown jana:affinity value {v}")))?;
        let locality = LocalityStrategy::try_from(locality_raw)
            .map_err(|v| Error::Configuration(format!("unknown jana:locality value {v}")))?;

        Ok(Self {
            pool_capacity: pool_capacity.max(1),
            limit_in_flight,
            queue_threshold: queue_threshold.max(1),
            // A chunk larger than the queue threshold could never reserve.
            source_chunksize: source_chunksize.clamp(1, queue_threshold.max(1)),
            processor_chunksize: processor_chunksize.clamp(1, queue_threshold.max(1)),
            enable_stealing,
            affinity,
            locality,
            nevents: (nevents > 0).then_some(nevents),
            nskip,
        })
    }
}

// Structural join used when no user folder was registered for a level.
struct NoopFolder {
    name: String,
    child_level: EventLevel,
}

impl Folder for NoopFolder {
    fn name(&self) -> &str {
        &self.name
    }

    fn child_level(&self) -> EventLevel {
        self.child_level
    }
}

/// Assembles the registered components into a validated [`Topology`].
///
/// Wiring is linear per level: `pool → source* → map → tap → retire`,
/// with an unfold/fold arrow pair spliced in wherever an unfolder bridges
/// to the next level down. Tap arrows host the sequential `process`
/// callbacks and are forced non-parallel.
pub struct TopologyBuilder {
    registry: Registry,
    config: TopologyConfig,
}

impl TopologyBuilder {
    /// Creates a builder with default tunables.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            config: TopologyConfig::default(),
        }
    }

    /// Creates a builder with tunables from the parameter store.
    pub fn from_params(registry: Registry, params: &ParameterManager) -> Result<Self> {
        Ok(Self {
            registry,
            config: TopologyConfig::from_params(params)?,
        })
    }

    /// Overrides the tunables wholesale.
    pub fn with_config(mut self, config: TopologyConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the topology.
    pub fn build(self) -> Result<Topology> {
        let Self { registry, config } = self;

        if registry.sources.is_empty() {
            return Err(Error::Configuration(
                "cannot build an empty topology: no event source registered".into(),
            ));
        }
        let source_level = registry.sources[0].0.level();
        for (source, _) in &registry.sources {
            if source.level() != source_level {
                return Err(Error::Configuration(format!(
                    "all sources must emit at the same level; '{}' emits {} but '{}' emits {}",
                    registry.sources[0].0.name(),
                    source_level,
                    source.name(),
                    source.level(),
                )));
            }
        }

        // Chain the levels: source level first, then one hop per unfolder.
        let mut unfolders: HashMap<EventLevel, (Box<dyn jana_event::Unfolder>, String)> =
            HashMap::new();
        for (unfolder, plugin) in registry.unfolders {
            let parent = unfolder.parent_level();
            if unfolder.child_level() == parent {
                return Err(Error::Configuration(format!(
                    "unfolder '{}' unfolds {} into itself",
                    unfolder.name(),
                    parent
                )));
            }
            if unfolders.insert(parent, (unfolder, plugin)).is_some() {
                return Err(Error::Configuration(format!(
                    "multiple unfolders registered for parent level {parent}"
                )));
            }
        }
        let mut levels = vec![source_level];
        while let Some((unfolder, _)) = unfolders.get(levels.last().unwrap()) {
            let child = unfolder.child_level();
            if levels.contains(&child) {
                return Err(Error::Configuration(format!(
                    "unfolder '{}' creates a level cycle at {child}",
                    unfolder.name()
                )));
            }
            levels.push(child);
        }
        let chained: Vec<(EventLevel, (Box<dyn jana_event::Unfolder>, String))> = levels
            .iter()
            .filter_map(|level| unfolders.remove_entry(level))
            .collect();
        if let Some(level) = unfolders.keys().next() {
            return Err(Error::Configuration(format!(
                "unfolder for parent level {level} is unreachable from the source level"
            )));
        }
        let mut unfolders: HashMap<_, _> = chained.into_iter().collect();

        let mut folders: HashMap<EventLevel, (Box<dyn jana_event::Folder>, String)> =
            HashMap::new();
        for (folder, plugin) in registry.folders {
            let child = folder.child_level();
            if !levels[1..].contains(&child) {
                return Err(Error::Configuration(format!(
                    "folder '{}' joins level {child}, but no unfolder produces that level",
                    folder.name()
                )));
            }
            if folders.insert(child, (folder, plugin)).is_some() {
                return Err(Error::Configuration(format!(
                    "multiple folders registered for child level {child}"
                )));
            }
        }

        let mapping = ProcessorMapping::new(config.affinity, config.locality);
        let locs = mapping.loc_count();

        // One pool per level, its events carrying the level's factories.
        let generators: Arc<Vec<(Box<dyn FactoryGenerator>, String)>> =
            Arc::new(registry.generators);
        let mut pools: HashMap<EventLevel, Arc<Pool>> = HashMap::new();
        for &level in &levels {
            let gens = generators.clone();
            let make_factories = move || {
                let mut set = FactorySet::new();
                for (generator, _) in gens.iter().filter(|(g, _)| g.level() == level) {
                    generator.generate(&mut set)?;
                }
                Ok(set)
            };
            // Pre-flight: surface init problems early, but let the
            // per-event factories re-raise them in context.
            let preflight = make_factories()?;
            if let Err(err) = preflight.preflight_init_all() {
                warn!("pre-flight factory init failed (will re-raise in context): {err}");
            }
            let pool = Pool::new(
                level,
                config.pool_capacity,
                locs,
                config.limit_in_flight,
                make_factories,
            )?;
            pools.insert(level, Arc::new(pool));
        }

        // Processor cells, shared between each level's map and tap arrows.
        let mut cells_by_level: HashMap<EventLevel, Vec<Arc<ProcessorCell>>> = HashMap::new();
        for (processor, plugin) in registry.processors {
            cells_by_level
                .entry(processor.level())
                .or_default()
                .push(Arc::new(ProcessorCell::new(processor, plugin)));
        }

        let mut arrows: Vec<Arc<Arrow>> = Vec::new();
        let mut queues: Vec<Arc<Mailbox>> = Vec::new();
        let new_queue = |queues: &mut Vec<Arc<Mailbox>>| {
            let queue = Arc::new(Mailbox::new(
                config.queue_threshold,
                locs,
                config.enable_stealing,
            ));
            queues.push(queue.clone());
            queue
        };

        let mut sources = registry.sources;
        // Filled by the parent iteration, consumed by the child's.
        let mut incoming_entry_q: Option<Arc<Mailbox>> = None;
        let mut pending_fold: Option<(Arc<Mailbox>, Arc<Mailbox>)> = None;

        for (i, &level) in levels.iter().enumerate() {
            let pool = pools[&level].clone();
            let cells = cells_by_level.remove(&level).unwrap_or_default();
            let is_top = i == 0;
            let has_lower = i + 1 < levels.len();
            // The fold pair handed down by the level above, taken before
            // this level registers its own for the level below.
            let upper_fold = pending_fold.take();

            let entry_q = match incoming_entry_q.take() {
                Some(queue) => queue,
                None => new_queue(&mut queues),
            };
            if is_top {
                let multiple = sources.len() > 1;
                for (idx, (source, plugin)) in sources.drain(..).enumerate() {
                    let name = if multiple {
                        format!("{level}Source{idx}")
                    } else {
                        format!("{level}Source")
                    };
                    debug!("wiring source arrow '{name}'");
                    arrows.push(Arc::new(Arrow::new(
                        name,
                        level,
                        false,
                        true,
                        false,
                        config.source_chunksize,
                        vec![
                            Port::input(PortBinding::Pool(pool.clone())),
                            Port::output(PortBinding::Queue(entry_q.clone())),
                        ],
                        ArrowKind::Source(SourceArrow::new(
                            source,
                            plugin,
                            SourceConfig {
                                nevents: config.nevents,
                                nskip: config.nskip,
                                chunksize: config.source_chunksize,
                            },
                        )),
                    )));
                }
            }

            let map_q = new_queue(&mut queues);
            arrows.push(Arc::new(Arrow::new(
                format!("{level}Map"),
                level,
                true,
                false,
                false,
                1,
                vec![
                    Port::input(PortBinding::Queue(entry_q.clone())),
                    Port::output(PortBinding::Queue(map_q.clone())),
                ],
                ArrowKind::Map(MapArrow::new(cells.clone())),
            )));

            // Where this level's tap reads from, and what the next levels
            // need from us.
            let tap_in_q = if has_lower {
                let child_level = levels[i + 1];
                let (unfolder, plugin) = unfolders.remove(&level).expect("chained above");
                let child_entry_q = new_queue(&mut queues);
                let parent_handoff_q = new_queue(&mut queues);
                let parent_return_q = new_queue(&mut queues);
                arrows.push(Arc::new(Arrow::new(
                    format!("{level}Unfold"),
                    level,
                    false,
                    false,
                    false,
                    1,
                    vec![
                        Port::input(PortBinding::Queue(map_q.clone())),
                        Port::input(PortBinding::Pool(pools[&child_level].clone())),
                        Port::output(PortBinding::Queue(child_entry_q.clone())),
                        Port::output(PortBinding::Queue(parent_handoff_q.clone())),
                    ],
                    ArrowKind::Unfold(UnfoldArrow::new(unfolder, plugin)),
                )));
                incoming_entry_q = Some(child_entry_q);
                let parent_return = parent_return_q.clone();
                pending_fold = Some((parent_handoff_q, parent_return_q));
                parent_return
            } else {
                map_q
            };

            // Tap output: retire to the pool at the top level, or feed the
            // fold that joins this level into the one above.
            let (tap_out, this_fold_child_q) = if is_top {
                (Port::retire(PortBinding::Pool(pool.clone())), None)
            } else {
                let fold_child_q = new_queue(&mut queues);
                (
                    Port::output(PortBinding::Queue(fold_child_q.clone())),
                    Some(fold_child_q),
                )
            };
            arrows.push(Arc::new(Arrow::new(
                format!("{level}Tap"),
                level,
                false,
                false,
                is_top,
                config.processor_chunksize,
                vec![Port::input(PortBinding::Queue(tap_in_q)), tap_out],
                ArrowKind::Tap(TapArrow::new(cells, config.processor_chunksize)),
            )));

            if let Some(fold_child_q) = this_fold_child_q {
                let (parent_handoff_q, parent_return_q) =
                    upper_fold.expect("set by the parent iteration");
                let (folder, plugin) = match folders.remove(&level) {
                    Some(found) => found,
                    None => (
                        Box::new(NoopFolder {
                            name: format!("{level}Folder"),
                            child_level: level,
                        }) as Box<dyn jana_event::Folder>,
                        String::new(),
                    ),
                };
                arrows.push(Arc::new(Arrow::new(
                    format!("{level}Fold"),
                    level,
                    false,
                    false,
                    true,
                    1,
                    vec![
                        Port::input(PortBinding::Queue(fold_child_q)),
                        Port::input(PortBinding::Queue(parent_handoff_q)),
                        Port::retire(PortBinding::Pool(pool.clone())),
                        Port::output(PortBinding::Queue(parent_return_q)),
                    ],
                    ArrowKind::Fold(FoldArrow::new(folder, plugin)),
                )));
            }
        }

        debug!(
            "topology built: {} arrows, {} queues, {} pools over {} levels",
            arrows.len(),
            queues.len(),
            pools.len(),
            levels.len()
        );

        let mut pools: Vec<Arc<Pool>> = pools.into_values().collect();
        pools.sort_by_key(|pool| pool.level());
        Ok(Topology {
            arrows,
            queues,
            pools,
            mapping,
        })
    }
}
