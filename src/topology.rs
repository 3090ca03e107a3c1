//! Hardware target mapping.
//!
//! Executors place their worker threads on *processing units* (PUs), numbered
//! `0..hardware_concurrency()`. A [`Target`] names a set of PUs, typically a
//! NUMA domain. How PUs map onto real cores, and how the current thread's PU is
//! discovered, is up to the [`Topology`] implementation in use.

use std::{
    cell::Cell,
    fmt,
    sync::{Arc, OnceLock},
    thread,
};

// -----------------------------------------------------------------------------
// Cpu mask

const WORD_BITS: usize = u64::BITS as usize;

/// A set of processing units, stored as a bitmask.
#[derive(Clone, Default)]
pub struct CpuMask {
    words: Vec<u64>,
}

impl CpuMask {
    /// Creates an empty mask with room for `len` processing units. The mask
    /// grows on demand, so `len` is only a capacity hint.
    pub fn new(len: usize) -> CpuMask {
        CpuMask {
            words: vec![0; len.div_ceil(WORD_BITS)],
        }
    }

    /// Creates a mask containing exactly the given processing units.
    pub fn from_pus(pus: impl IntoIterator<Item = usize>) -> CpuMask {
        let mut mask = CpuMask::default();
        for pu in pus {
            mask.set(pu);
        }
        mask
    }

    /// Adds a processing unit to the mask.
    pub fn set(&mut self, pu: usize) {
        let word = pu / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (pu % WORD_BITS);
    }

    /// Removes a processing unit from the mask.
    pub fn unset(&mut self, pu: usize) {
        if let Some(word) = self.words.get_mut(pu / WORD_BITS) {
            *word &= !(1 << (pu % WORD_BITS));
        }
    }

    /// Returns `true` if the processing unit is in the mask.
    pub fn test(&self, pu: usize) -> bool {
        self.words
            .get(pu / WORD_BITS)
            .is_some_and(|word| (word & (1 << (pu % WORD_BITS))) != 0)
    }

    /// Returns the lowest-numbered processing unit in the mask.
    pub fn find_first(&self) -> Option<usize> {
        self.iter().next()
    }

    /// Returns the number of processing units in the mask.
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    /// Iterates over the processing units in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(index, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| (word & (1u64 << bit)) != 0)
                .map(move |bit| index * WORD_BITS + bit)
        })
    }

    /// Returns the union of two masks.
    pub fn union(&self, other: &CpuMask) -> CpuMask {
        let len = self.words.len().max(other.words.len());
        let words = (0..len)
            .map(|i| {
                self.words.get(i).copied().unwrap_or(0) | other.words.get(i).copied().unwrap_or(0)
            })
            .collect();
        CpuMask { words }
    }
}

impl PartialEq for CpuMask {
    fn eq(&self, other: &CpuMask) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for CpuMask {}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        CpuMask::from_pus(iter)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// -----------------------------------------------------------------------------
// Target

/// An immutable handle to a set of processing units used for placement.
/// Cloning a target is cheap.
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    mask: Arc<CpuMask>,
}

impl Target {
    pub fn new(mask: CpuMask) -> Target {
        Target {
            mask: Arc::new(mask),
        }
    }

    pub fn from_pus(pus: impl IntoIterator<Item = usize>) -> Target {
        Target::new(CpuMask::from_pus(pus))
    }

    /// Returns the processing units of this target.
    pub fn mask(&self) -> &CpuMask {
        &self.mask
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Target").field(&*self.mask).finish()
    }
}

// -----------------------------------------------------------------------------
// Topology

/// Resolves placement requests against the machine.
///
/// Implementations must number processing units consistently across calls.
pub trait Topology: Send + Sync {
    /// Returns the processing unit the calling thread runs on.
    fn current_pu(&self) -> usize;

    /// Binds the calling thread to a processing unit. Executors call this on
    /// each worker thread right after spawning it.
    fn bind_current_thread(&self, pu: usize);

    /// Returns the number of processing units.
    fn hardware_concurrency(&self) -> usize;

    /// Returns one target per NUMA domain.
    fn numa_domains(&self) -> Vec<Target>;
}

thread_local! {
    static CURRENT_PU: Cell<usize> = const { Cell::new(0) };
}

/// A topology of logical processing units.
///
/// The processing unit of a thread is whatever it was last bound to; threads
/// that were never bound report unit `0`. Binding is bookkeeping only: this
/// topology does not change the operating system's scheduling affinity.
#[derive(Debug, Clone)]
pub struct LogicalTopology {
    num_pus: usize,
    domains: Vec<Target>,
}

impl LogicalTopology {
    /// A topology sized to the machine's available parallelism, with a single
    /// domain spanning every unit.
    pub fn new() -> LogicalTopology {
        let num_pus = thread::available_parallelism()
            .map(|num| num.get())
            .unwrap_or(1);
        LogicalTopology::with_pus(num_pus)
    }

    /// A topology with `num_pus` units in a single domain.
    pub fn with_pus(num_pus: usize) -> LogicalTopology {
        let num_pus = num_pus.max(1);
        LogicalTopology {
            num_pus,
            domains: vec![Target::from_pus(0..num_pus)],
        }
    }

    /// A topology of `domains` domains with `pus_per_domain` consecutive units
    /// each.
    pub fn with_domains(domains: usize, pus_per_domain: usize) -> LogicalTopology {
        let domains = domains.max(1);
        let pus_per_domain = pus_per_domain.max(1);
        LogicalTopology {
            num_pus: domains * pus_per_domain,
            domains: (0..domains)
                .map(|d| Target::from_pus(d * pus_per_domain..(d + 1) * pus_per_domain))
                .collect(),
        }
    }
}

impl Default for LogicalTopology {
    fn default() -> Self {
        LogicalTopology::new()
    }
}

impl Topology for LogicalTopology {
    fn current_pu(&self) -> usize {
        CURRENT_PU.with(Cell::get)
    }

    fn bind_current_thread(&self, pu: usize) {
        CURRENT_PU.with(|current| current.set(pu));
    }

    fn hardware_concurrency(&self) -> usize {
        self.num_pus
    }

    fn numa_domains(&self) -> Vec<Target> {
        self.domains.clone()
    }
}

/// Returns the process-wide default topology.
pub fn default_topology() -> Arc<dyn Topology> {
    static DEFAULT: OnceLock<Arc<dyn Topology>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(LogicalTopology::new())))
}
