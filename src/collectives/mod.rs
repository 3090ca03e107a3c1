//! Collective operations across sites that share no memory.
//!
//! Sites meet at a *communicator*, a rendezvous identified by a basename. Each
//! use of a communicator is a *generation*: every one of the `num_sites` sites
//! deposits one value into the generation, and the deposit that completes the
//! set computes the result for all of them.
//!
//! The locality namespace and the transport between sites are provided by a
//! [`Fabric`]. The fabric in this module connects sites living in one process,
//! which is what tests and single-node runs need.

mod all_reduce;
mod communicator;

pub use all_reduce::AllReduce;
pub use communicator::{Communicator, Fabric, Site};

/// Optional arguments of collective operations. Unset fields fall back to
/// defaults derived from the calling site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectiveArgs {
    /// The number of participating sites. Defaults to every locality of the
    /// fabric.
    pub num_sites: Option<usize>,
    /// The index of the calling site. Defaults to its locality id.
    pub this_site: Option<usize>,
    /// The generation to use. Generations are numbered from 1; when unset,
    /// each site counts its own uses of a communicator.
    pub generation: Option<u64>,
    /// The site responsible for the rendezvous. Defaults to site 0.
    pub root_site: Option<usize>,
}

impl CollectiveArgs {
    pub fn num_sites(mut self, num_sites: usize) -> Self {
        self.num_sites = Some(num_sites);
        self
    }

    pub fn this_site(mut self, this_site: usize) -> Self {
        self.this_site = Some(this_site);
        self
    }

    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn root_site(mut self, root_site: usize) -> Self {
        self.root_site = Some(root_site);
        self
    }
}
