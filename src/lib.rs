//! Generational garbage collection core for embedding in managed runtimes.
//!
//! The crate implements the collection machinery only: a copying
//! young-generation collector (the scavenger), a mark-sweep-compact global
//! collector, a non-moving segregated global collector, and the shared
//! infrastructure underneath them (mark map, remembered set, copy-scan
//! caches, parallel task dispatch). Object layout knowledge is supplied by
//! the embedding runtime through [`object_model::ObjectModel`].

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            eprintln!($($t)*);
        }
    };
}

pub mod copy_cache;
pub mod cycle;
pub mod events;
pub mod global_collector;
pub mod globals;
pub mod header;
pub mod heap;
pub mod mark_map;
pub mod object_model;
pub mod region;
pub mod remembered;
pub mod scavenger;
pub mod segregated;
pub mod stats;
pub mod task;
pub mod tenured;
pub mod utils;

#[cfg(test)]
mod tests;

/// Heap and policy configuration. All tuning values here are placeholder
/// defaults; embedders are expected to override them.
#[derive(Clone)]
pub struct GcConfig {
    /// Size of each young-generation semispace.
    pub semispace_size: usize,
    /// Initially committed tenured-space size.
    pub tenure_size: usize,
    /// Maximum tenured-space size; the mark map is sized for this.
    pub tenure_capacity: usize,
    /// Number of parallel GC worker threads.
    pub workers: usize,
    /// Copy-scan cache size carved from survivor/tenure memory.
    pub cache_size: usize,
    /// Remembered-set capacity; growth past this point overflows the set.
    pub remembered_set_capacity: usize,
    /// Shared mark-stack bound; overflow falls back to a mark-map rescan.
    pub mark_stack_capacity: usize,
    /// Consecutive scavenges allowed before percolating to a global cycle.
    pub max_scavenges: usize,
    /// Tenure-age selection strategy for the scavenger.
    pub tenure_strategy: scavenger::TenureStrategy,
    /// Free-space ratio below which the allocator is considered desperate
    /// and sweep requests a compaction.
    pub desperate_free_ratio: f64,
    /// Fragmentation ratio (free bytes not in the largest extent) above
    /// which sweep requests a compaction.
    pub compact_fragmentation_ratio: f64,
    /// Enables verbose `[gc]` event printing.
    pub verbose: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            semispace_size: 2 * 1024 * 1024,
            tenure_size: 16 * 1024 * 1024,
            tenure_capacity: 64 * 1024 * 1024,
            workers: 4,
            cache_size: 32 * 1024,
            remembered_set_capacity: 16 * 1024,
            mark_stack_capacity: 16 * 1024,
            max_scavenges: 64,
            tenure_strategy: scavenger::TenureStrategy::Fixed(10),
            desperate_free_ratio: 0.03,
            compact_fragmentation_ratio: 0.25,
            verbose: false,
        }
    }
}
