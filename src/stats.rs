use crate::utils::formatted_size;

/// Statistics snapshot carried by cycle events.
#[derive(Clone, Copy, Default, Debug)]
pub struct CycleStats {
    pub bytes_copied_survivor: usize,
    pub bytes_copied_tenure: usize,
    pub objects_copied: usize,
    pub objects_marked: usize,
    pub bytes_swept: usize,
    pub bytes_compacted: usize,
    pub caches_scanned: usize,
    pub mark_stack_overflows: usize,
}

/// Per-age survival history feeding the tenure-age policy. Slot `n`
/// holds bytes that survived their n-th scavenge in the previous cycle.
#[derive(Clone)]
pub struct SurvivalHistory {
    pub survived_by_age: [usize; crate::globals::MAX_OBJECT_AGE as usize + 1],
    pub flip_bytes: usize,
    pub tenure_bytes: usize,
}

impl Default for SurvivalHistory {
    fn default() -> Self {
        Self {
            survived_by_age: [0; crate::globals::MAX_OBJECT_AGE as usize + 1],
            flip_bytes: 0,
            tenure_bytes: 0,
        }
    }
}

impl SurvivalHistory {
    pub fn record_copy(&mut self, age: u8, bytes: usize, tenured: bool) {
        self.survived_by_age[age as usize] += bytes;
        if tenured {
            self.tenure_bytes += bytes;
        } else {
            self.flip_bytes += bytes;
        }
    }

    /// Fraction of copied bytes that stayed in the survivor semispace.
    pub fn flip_ratio(&self) -> f64 {
        let total = self.flip_bytes + self.tenure_bytes;
        if total == 0 {
            return 1.0;
        }
        self.flip_bytes as f64 / total as f64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Whole-heap statistics, printable with `{}`.
#[derive(Clone, Copy, Default)]
pub struct HeapStatistics {
    pub semispace_size: usize,
    pub survivor_in_use: usize,
    pub tenure_size: usize,
    pub tenure_in_use: usize,
    pub total_scavenges: usize,
    pub total_global_collections: usize,
    pub total_percolations: usize,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Survivor semispace: {} of {}",
            formatted_size(self.survivor_in_use),
            formatted_size(self.semispace_size)
        )?;
        writeln!(
            f,
            "  Tenured space: {} of {}",
            formatted_size(self.tenure_in_use),
            formatted_size(self.tenure_size)
        )?;
        writeln!(f, "  Scavenges: {}", self.total_scavenges)?;
        writeln!(
            f,
            "  Global collections: {}",
            self.total_global_collections
        )?;
        writeln!(f, "  Percolations: {}", self.total_percolations)?;
        Ok(())
    }
}
