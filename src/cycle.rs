use crate::stats::CycleStats;

/// What kind of cycle is running.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionKind {
    Scavenge,
    Global,
}

/// Why a cycle was started.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectReason {
    AllocationFailure,
    RequestedByUser,
    Percolation(PercolateReason),
}

/// Why a scavenge escalated to a global collection. None of these are
/// fatal; all resolve by running the global collector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PercolateReason {
    InsufficientTenureSpace,
    FailedTenureAllocation,
    MaxScavenges,
    RememberedSetOverflow,
    AbortedScavenge,
    CriticalRegionConflict,
}

/// Global-collector phase machine: Idle → Mark → Sweep → (Compact) → Idle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GlobalPhase {
    Idle,
    Mark,
    Sweep,
    Compact,
}

/// Why this cycle's sweep decided against compacting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompactPreventedReason {
    CriticalRegionPin,
    NotRequired,
}

/// Transient per-collection metadata. Exclusively owned by the thread
/// that starts the cycle; worker tasks hold a shared reference for the
/// cycle's duration and the state is cleared when post-collection
/// bookkeeping completes.
pub struct CycleState {
    pub kind: CollectionKind,
    pub reason: CollectReason,
    pub global_phase: GlobalPhase,
    pub stats: CycleStats,
    /// Outstanding allocation request that triggered the cycle, if any.
    /// Consulted by the sweep→compact decision.
    pub requested_bytes: usize,
    pub compact_forced: bool,
    pub compact_prevented: Option<CompactPreventedReason>,
}

impl CycleState {
    pub fn new(kind: CollectionKind, reason: CollectReason, requested_bytes: usize) -> Self {
        Self {
            kind,
            reason,
            global_phase: GlobalPhase::Idle,
            stats: CycleStats::default(),
            requested_bytes,
            compact_forced: false,
            compact_prevented: None,
        }
    }
}
