use jana_log::warn;
use once_cell::sync::Lazy;

// Detected once per process; CPU hotplug mid-run is not a concern the
// mapping tries to solve.
static CORE_IDS: Lazy<Vec<usize>> = Lazy::new(|| {
    let mut cpus: Vec<usize> = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|core| core.id)
        .collect();
    cpus.sort_unstable();
    if cpus.is_empty() {
        cpus.push(0);
    }
    cpus
});

/// Thread-to-CPU pinning policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityStrategy {
    /// No pinning; the OS scheduler places workers freely.
    None,
    /// Fill CPUs in id order, packing workers onto neighbouring cores.
    ComputeBound,
    /// Spread workers across the CPU range, interleaving halves to put
    /// neighbouring workers on distant cores.
    MemoryBound,
}

impl TryFrom<i64> for AffinityStrategy {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, i64> {
        match value {
            0 => Ok(AffinityStrategy::None),
            1 => Ok(AffinityStrategy::ComputeBound),
            2 => Ok(AffinityStrategy::MemoryBound),
            other => Err(other),
        }
    }
}

/// Granularity of queue/pool partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalityStrategy {
    /// One shared location for all workers.
    Global,
    /// One location per socket. Degrades to `Global` without a platform
    /// topology map.
    SocketLocal,
    /// One location per NUMA domain. Degrades to `Global` without a
    /// platform topology map.
    NumaLocal,
    /// One location per CPU.
    CoreLocal,
}

impl TryFrom<i64> for LocalityStrategy {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, i64> {
        match value {
            0 => Ok(LocalityStrategy::Global),
            1 => Ok(LocalityStrategy::SocketLocal),
            2 => Ok(LocalityStrategy::NumaLocal),
            3 => Ok(LocalityStrategy::CoreLocal),
            other => Err(other),
        }
    }
}

/// The worker-id → (cpu-id, location-id) table, fixed at build time.
pub struct ProcessorMapping {
    affinity: AffinityStrategy,
    locality: LocalityStrategy,
    cpus: Vec<usize>,
    loc_count: usize,
}

impl ProcessorMapping {
    /// Builds the table from the detected CPU set.
    pub fn new(affinity: AffinityStrategy, locality: LocalityStrategy) -> Self {
        let cpus = CORE_IDS.clone();
        let loc_count = match locality {
            LocalityStrategy::Global
            | LocalityStrategy::SocketLocal
            | LocalityStrategy::NumaLocal => 1,
            LocalityStrategy::CoreLocal => cpus.len(),
        };
        Self {
            affinity,
            locality,
            cpus,
            loc_count,
        }
    }

    /// The pinning policy.
    pub fn affinity(&self) -> AffinityStrategy {
        self.affinity
    }

    /// The partitioning policy.
    pub fn locality(&self) -> LocalityStrategy {
        self.locality
    }

    /// Number of locations every queue and pool is partitioned into.
    pub fn loc_count(&self) -> usize {
        self.loc_count
    }

    // Index into the cpu list for a worker, per the affinity strategy.
    fn cpu_slot(&self, worker_id: usize) -> usize {
        let n = self.cpus.len();
        match self.affinity {
            AffinityStrategy::None | AffinityStrategy::ComputeBound => worker_id % n,
            AffinityStrategy::MemoryBound => {
                let i = worker_id % n;
                (i % 2) * n.div_ceil(2) + i / 2
            }
        }
    }

    /// CPU id assigned to a worker.
    pub fn cpu_id(&self, worker_id: usize) -> usize {
        self.cpus[self.cpu_slot(worker_id) % self.cpus.len()]
    }

    /// Location id assigned to a worker.
    pub fn loc_id(&self, worker_id: usize) -> usize {
        match self.locality {
            LocalityStrategy::CoreLocal => self.cpu_slot(worker_id) % self.loc_count,
            _ => 0,
        }
    }

    /// Pins the calling thread to its assigned CPU. No-op under
    /// [`AffinityStrategy::None`].
    pub fn pin_current_thread(&self, worker_id: usize) {
        if self.affinity == AffinityStrategy::None {
            return;
        }
        let cpu = self.cpu_id(worker_id);
        let ok = core_affinity::set_for_current(core_affinity::CoreId { id: cpu });
        if !ok {
            warn!("cannot pin worker {worker_id} to cpu {cpu}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AffinityStrategy, LocalityStrategy, ProcessorMapping};

    #[test]
    fn global_locality_is_one_location() {
        let mapping = ProcessorMapping::new(AffinityStrategy::None, LocalityStrategy::Global);
        assert_eq!(mapping.loc_count(), 1);
        for worker in 0..16 {
            assert_eq!(mapping.loc_id(worker), 0);
        }
    }

    #[test]
    fn core_local_assigns_distinct_locations() {
        let mapping =
            ProcessorMapping::new(AffinityStrategy::ComputeBound, LocalityStrategy::CoreLocal);
        assert!(mapping.loc_count() >= 1);
        for worker in 0..mapping.loc_count() {
            assert_eq!(mapping.loc_id(worker), worker % mapping.loc_count());
        }
    }

    #[test]
    fn strategies_parse_from_parameter_integers() {
        assert_eq!(AffinityStrategy::try_from(2), Ok(AffinityStrategy::MemoryBound));
        assert!(AffinityStrategy::try_from(7).is_err());
        assert_eq!(LocalityStrategy::try_from(3), Ok(LocalityStrategy::CoreLocal));
        assert!(LocalityStrategy::try_from(-1).is_err());
    }
}
