use std::{
    any::Any,
    collections::HashMap,
    fmt, ptr,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::debug;

use super::{AllReduce, CollectiveArgs};
use crate::error::{Error, Result};

// -----------------------------------------------------------------------------
// Fabric

/// An in-process set of localities that can rendezvous with each other.
/// Cloning a fabric is cheap and refers to the same localities.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricState>,
}

struct FabricState {
    num_localities: usize,
    /// Rendezvous objects by basename. An entry lives as long as some
    /// communicator or result handle refers to it.
    rendezvous: Mutex<HashMap<String, Weak<Rendezvous>>>,
}

impl Fabric {
    /// Creates a fabric of `num_localities` sites. Fails if there are none.
    pub fn new(num_localities: usize) -> Result<Fabric> {
        if num_localities == 0 {
            return Err(Error::bad_parameter(
                "Fabric::new",
                "a fabric needs at least one locality",
            ));
        }
        Ok(Fabric {
            inner: Arc::new(FabricState {
                num_localities,
                rendezvous: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn num_localities(&self) -> usize {
        self.inner.num_localities
    }

    /// Returns the handle of one locality.
    pub fn site(&self, locality: usize) -> Result<Site> {
        if locality >= self.inner.num_localities {
            return Err(Error::SiteOutOfRange {
                site: locality,
                num_sites: self.inner.num_localities,
            });
        }
        Ok(Site {
            fabric: self.clone(),
            locality,
        })
    }

    /// Returns the handles of every locality, in order.
    pub fn sites(&self) -> Vec<Site> {
        (0..self.inner.num_localities)
            .map(|locality| Site {
                fabric: self.clone(),
                locality,
            })
            .collect()
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("num_localities", &self.inner.num_localities)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Site

/// One locality of a fabric. Sites are cheap to clone and may move between
/// threads.
#[derive(Clone, Debug)]
pub struct Site {
    fabric: Fabric,
    locality: usize,
}

impl Site {
    pub fn locality_id(&self) -> usize {
        self.locality
    }

    pub fn num_localities(&self) -> usize {
        self.fabric.num_localities()
    }

    /// Creates the communicator `basename`, or attaches to it if another site
    /// created it first.
    ///
    /// Fails with a parameter error if the generation is zero, if the site
    /// count is zero, if the root site is out of range, or if the site count
    /// or root site differs from the ones the communicator was created with.
    pub fn create_communicator(&self, basename: &str, args: CollectiveArgs) -> Result<Communicator> {
        const OPERATION: &str = "create_communicator";

        let num_sites = args.num_sites.unwrap_or(self.num_localities());
        let this_site = args.this_site.unwrap_or(self.locality);
        let root_site = args.root_site.unwrap_or(0);

        if args.generation == Some(0) {
            return Err(Error::bad_parameter(
                OPERATION,
                "the generation number shouldn't be zero",
            ));
        }
        if num_sites == 0 {
            return Err(Error::bad_parameter(
                OPERATION,
                "a communicator needs at least one site",
            ));
        }
        if this_site >= num_sites {
            return Err(Error::SiteOutOfRange {
                site: this_site,
                num_sites,
            });
        }
        if root_site >= num_sites {
            return Err(Error::bad_parameter(
                OPERATION,
                format!("root site {root_site} is out of range for {num_sites} sites"),
            ));
        }

        let rendezvous = {
            let mut all = self.fabric.inner.rendezvous.lock();
            match all.get(basename).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    debug!(basename, num_sites, root_site, site = this_site, "communicator created");
                    let created = Arc::new(Rendezvous::new(
                        basename,
                        num_sites,
                        root_site,
                        Arc::downgrade(&self.fabric.inner),
                    ));
                    all.insert(basename.to_owned(), Arc::downgrade(&created));
                    created
                }
            }
        };

        if rendezvous.num_sites != num_sites {
            return Err(Error::bad_parameter(
                OPERATION,
                format!(
                    "communicator {basename} has {} sites, not {num_sites}",
                    rendezvous.num_sites
                ),
            ));
        }
        if args.root_site.is_some_and(|root_site| root_site != rendezvous.root_site) {
            return Err(Error::bad_parameter(
                OPERATION,
                format!(
                    "communicator {basename} has root site {}, not {root_site}",
                    rendezvous.root_site
                ),
            ));
        }

        Ok(Communicator {
            rendezvous,
            this_site,
            generation: args.generation,
        })
    }

    /// Combines `value` with the values of every other site using `op`. See
    /// [`Communicator::all_reduce`].
    pub fn all_reduce<T, F>(
        &self,
        basename: &str,
        value: T,
        op: F,
        args: CollectiveArgs,
    ) -> Result<AllReduce<T>>
    where
        T: Clone + Send + 'static,
        F: FnMut(T, T) -> T,
    {
        self.create_communicator(basename, args)?
            .all_reduce(value, op, CollectiveArgs::default())
    }
}

// -----------------------------------------------------------------------------
// Communicator

/// A handle to a rendezvous shared by a fixed number of sites. Cloning a
/// communicator is cheap.
#[derive(Clone)]
pub struct Communicator {
    pub(super) rendezvous: Arc<Rendezvous>,
    this_site: usize,
    generation: Option<u64>,
}

impl Communicator {
    pub fn basename(&self) -> &str {
        &self.rendezvous.basename
    }

    pub fn num_sites(&self) -> usize {
        self.rendezvous.num_sites
    }

    pub fn this_site(&self) -> usize {
        self.this_site
    }

    pub fn root_site(&self) -> usize {
        self.rendezvous.root_site
    }

    /// The generation fixed at creation, if any.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Returns the number of generations that are still live: some site has
    /// not deposited yet, or some result handle has not been dropped.
    pub fn active_generations(&self) -> usize {
        self.rendezvous.generations.lock().len()
    }

    /// Contributes `value` to an all-reduce on this communicator.
    ///
    /// `args` may name the site and generation of this call. Otherwise the
    /// site is the communicator's own, and the generation is the one fixed
    /// when the communicator was created, or else this site's next one. A
    /// site count or root site in `args` must match the communicator's.
    ///
    /// The returned handle resolves once every site has contributed, to the
    /// values of all sites folded with `op` in site order. A rejected deposit
    /// does not use up an automatic generation.
    pub fn all_reduce<T, F>(&self, value: T, op: F, args: CollectiveArgs) -> Result<AllReduce<T>>
    where
        T: Clone + Send + 'static,
        F: FnMut(T, T) -> T,
    {
        const OPERATION: &str = "all_reduce";

        if args.num_sites.is_some_and(|num_sites| num_sites != self.num_sites()) {
            return Err(Error::bad_parameter(
                OPERATION,
                format!("communicator {} has {} sites", self.basename(), self.num_sites()),
            ));
        }
        if args.root_site.is_some_and(|root_site| root_site != self.root_site()) {
            return Err(Error::bad_parameter(
                OPERATION,
                format!("communicator {} has root site {}", self.basename(), self.root_site()),
            ));
        }

        let site = args.this_site.unwrap_or(self.this_site);
        if let Some(generation) = args.generation.or(self.generation) {
            return self.deposit_and_maybe_finalize(site, generation, value, op);
        }

        if site >= self.num_sites() {
            return Err(Error::SiteOutOfRange {
                site,
                num_sites: self.num_sites(),
            });
        }
        let generation = self.rendezvous.next_generation(site);
        let deposit = self.deposit_and_maybe_finalize(site, generation, value, op);
        if deposit.is_err() {
            self.rendezvous.rewind_generation(site, generation);
        }
        deposit
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("basename", &self.basename())
            .field("num_sites", &self.num_sites())
            .field("this_site", &self.this_site)
            .field("generation", &self.generation)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Rendezvous

/// The shared side of a communicator.
pub(super) struct Rendezvous {
    pub(super) basename: String,
    pub(super) num_sites: usize,
    root_site: usize,
    /// Live generations. Each has its own lock, so generations do not contend
    /// beyond this lookup.
    generations: Mutex<HashMap<u64, Arc<Generation>>>,
    /// The last generation each site used without naming one.
    auto_generations: Mutex<Vec<u64>>,
    fabric: Weak<FabricState>,
}

/// One use of a communicator.
pub(super) struct Generation {
    pub(super) number: u64,
    pub(super) state: Mutex<GenerationState>,
}

pub(super) struct GenerationState {
    /// The typed exchange buffer, created by the first deposit.
    pub(super) exchange: Option<Box<dyn Any + Send>>,
    /// The number of result handles dropped so far.
    pub(super) released: usize,
}

impl Rendezvous {
    fn new(
        basename: &str,
        num_sites: usize,
        root_site: usize,
        fabric: Weak<FabricState>,
    ) -> Rendezvous {
        Rendezvous {
            basename: basename.to_owned(),
            num_sites,
            root_site,
            generations: Mutex::new(HashMap::new()),
            auto_generations: Mutex::new(vec![0; num_sites]),
            fabric,
        }
    }

    fn next_generation(&self, site: usize) -> u64 {
        let mut auto = self.auto_generations.lock();
        auto[site] += 1;
        auto[site]
    }

    /// Gives back `generation` if it is still the last one `site` took.
    fn rewind_generation(&self, site: usize, generation: u64) {
        let mut auto = self.auto_generations.lock();
        if auto[site] == generation {
            auto[site] -= 1;
        }
    }

    /// Returns the live generation `number`, creating it if needed.
    pub(super) fn generation(&self, number: u64) -> Arc<Generation> {
        let mut generations = self.generations.lock();
        let generation = generations.entry(number).or_insert_with(|| {
            debug!(basename = %self.basename, generation = number, "generation opened");
            Arc::new(Generation {
                number,
                state: Mutex::new(GenerationState {
                    exchange: None,
                    released: 0,
                }),
            })
        });
        Arc::clone(generation)
    }

    /// Records that one result handle of `generation` was dropped, and tears
    /// the generation down after the last one.
    pub(super) fn release(&self, generation: &Arc<Generation>) {
        let finished = {
            let mut state = generation.state.lock();
            state.released += 1;
            state.released == self.num_sites
        };
        if !finished {
            return;
        }
        let mut generations = self.generations.lock();
        if generations
            .get(&generation.number)
            .is_some_and(|live| Arc::ptr_eq(live, generation))
        {
            generations.remove(&generation.number);
            debug!(basename = %self.basename, generation = generation.number, "generation closed");
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        let Some(fabric) = self.fabric.upgrade() else {
            return;
        };
        let mut all = fabric.rendezvous.lock();
        // The entry may already belong to a newer rendezvous of the same name.
        if all
            .get(&self.basename)
            .is_some_and(|entry| ptr::eq(entry.as_ptr(), &*self))
        {
            all.remove(&self.basename);
            debug!(basename = %self.basename, "communicator closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sites_attach_to_the_same_communicator() {
        let fabric = Fabric::new(3).unwrap();
        let a = fabric.site(0).unwrap().create_communicator("x", CollectiveArgs::default()).unwrap();
        let b = fabric.site(2).unwrap().create_communicator("x", CollectiveArgs::default()).unwrap();
        assert!(Arc::ptr_eq(&a.rendezvous, &b.rendezvous));
        assert_eq!(a.num_sites(), 3);
        assert_eq!(b.this_site(), 2);
        assert_eq!(a.root_site(), 0);
        assert_eq!(a.basename(), "x");
    }

    #[test]
    fn invalid_arguments_are_rejected() {
        let fabric = Fabric::new(2).unwrap();
        let site = fabric.site(0).unwrap();
        let args = CollectiveArgs::default();
        assert!(site
            .create_communicator("x", args.generation(0))
            .unwrap_err()
            .is_bad_parameter());
        assert!(site
            .create_communicator("x", args.num_sites(0))
            .unwrap_err()
            .is_bad_parameter());
        assert!(site
            .create_communicator("x", args.root_site(2))
            .unwrap_err()
            .is_bad_parameter());
        assert!(matches!(
            site.create_communicator("x", args.this_site(5)),
            Err(Error::SiteOutOfRange { site: 5, num_sites: 2 })
        ));
        assert!(matches!(fabric.site(2), Err(Error::SiteOutOfRange { .. })));

        site.create_communicator("y", args).unwrap();
        assert!(site
            .create_communicator("y", args.num_sites(1))
            .unwrap_err()
            .is_bad_parameter());
    }

    #[test]
    fn automatic_generations_count_per_site() {
        let rendezvous = Rendezvous::new("x", 2, 0, Weak::new());
        assert_eq!(rendezvous.next_generation(0), 1);
        assert_eq!(rendezvous.next_generation(0), 2);
        assert_eq!(rendezvous.next_generation(1), 1);
        rendezvous.rewind_generation(0, 2);
        assert_eq!(rendezvous.next_generation(0), 2);
        // Only the last generation taken can be given back.
        rendezvous.rewind_generation(0, 1);
        assert_eq!(rendezvous.next_generation(0), 3);
    }

    #[test]
    fn attaching_with_another_root_site_fails() {
        let fabric = Fabric::new(3).unwrap();
        let args = CollectiveArgs::default();
        let first = fabric.site(0).unwrap().create_communicator("root", args.root_site(1)).unwrap();
        assert_eq!(first.root_site(), 1);

        let site = fabric.site(1).unwrap();
        assert!(site
            .create_communicator("root", args.root_site(2))
            .unwrap_err()
            .is_bad_parameter());
        // Leaving the root unset attaches to whatever the communicator has.
        assert_eq!(site.create_communicator("root", args).unwrap().root_site(), 1);
    }

    #[test]
    fn fabrics_need_a_locality() {
        assert!(Fabric::new(0).unwrap_err().is_bad_parameter());
        assert_eq!(Fabric::new(1).unwrap().sites().len(), 1);
    }

    #[test]
    fn unused_basenames_are_forgotten() {
        let fabric = Fabric::new(2).unwrap();
        let site = fabric.site(0).unwrap();
        let live = |name: &str| fabric.inner.rendezvous.lock().contains_key(name);

        let first = site.create_communicator("temp", CollectiveArgs::default()).unwrap();
        let second = first.clone();
        assert!(live("temp"));
        drop(first);
        assert!(live("temp"));
        drop(second);
        assert!(!live("temp"));

        // A new communicator of the same name starts afresh.
        let again = site
            .create_communicator("temp", CollectiveArgs::default().num_sites(1))
            .unwrap();
        assert_eq!(again.num_sites(), 1);
        assert!(live("temp"));
    }
}
