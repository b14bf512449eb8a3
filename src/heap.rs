use parking_lot::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cycle::{CollectReason, CollectionKind, CycleState, PercolateReason};
use crate::events::{EventBus, GcEvent, GcEventListener};
use crate::global_collector::{GlobalArgs, GlobalCollector};
use crate::globals::GRANULE;
use crate::header::ObjectHeader;
use crate::mark_map::MarkMap;
use crate::object_model::{ObjectModel, SlotVisitor};
use crate::region::{RegionKind, RegionTable};
use crate::remembered::{RememberedSet, RememberedSetFragment};
use crate::scavenger::{ConcurrentPhase, ConcurrentScavenger, ScavengeArgs, Scavenger};
use crate::segregated::{SegregatedArgs, SegregatedCollector, SegregatedSpace};
use crate::stats::{CycleStats, HeapStatistics};
use crate::task::Dispatcher;
use crate::tenured::TenuredSpace;
use crate::utils::mmap::Mmap;
use crate::GcConfig;

// Post-cycle resize thresholds: grow when less than a fifth of the
// tenured pool is free, shrink when more than three quarters is.
const EXPAND_FREE_RATIO: f64 = 0.2;
const CONTRACT_FREE_RATIO: f64 = 0.75;

struct GenerationalBackend {
    scavenger: Scavenger,
    tenured: TenuredSpace,
    remembered: RememberedSet,
    global: GlobalCollector,
    concurrent: ConcurrentScavenger,
}

struct SegregatedBackend {
    space: SegregatedSpace,
    collector: SegregatedCollector,
}

enum Backend {
    Generational(GenerationalBackend),
    Segregated(SegregatedBackend),
}

type RootConstraint = Box<dyn FnMut(&mut dyn SlotVisitor) + Send>;

/// The heap coordinator: owns the reservation, the spaces, both
/// collectors and the policy that routes between them. One `Heap` per
/// embedding runtime.
///
/// Built in one of two shapes: generational (scavenger over a semispace
/// pair, mark-sweep-compact over the tenured pool) or segregated
/// (non-moving cell regions, mark-sweep only) for embedders whose
/// objects must never change address.
pub struct Heap {
    config: GcConfig,
    model: Box<dyn ObjectModel>,
    backend: Backend,
    mark_map: MarkMap,
    regions: Mutex<RegionTable>,
    roots: Mutex<Vec<RootConstraint>>,
    dispatcher: Mutex<Dispatcher>,
    events: EventBus,
    gc_lock: Mutex<()>,
    critical_depth: AtomicUsize,
    total_scavenges: AtomicUsize,
    total_globals: AtomicUsize,
    total_percolations: AtomicUsize,
    reservation: Mmap,
}

// Shared by mutator threads and a collector driver. All interior
// mutability is behind locks or atomics, collection entry points
// serialize on `gc_lock`, and the raw space pointers never leave the
// reservation this struct owns. The embedder carries the remaining
// obligation: mutator threads must be parked at safe points for the
// duration of any collection entry point; the crate does not suspend
// threads itself.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    /// Builds a generational heap: `[tenured | evacuate | survivor]` in
    /// one contiguous reservation, mark map sized for the maximum
    /// tenured footprint.
    pub fn generational(config: GcConfig, model: Box<dyn ObjectModel>) -> Self {
        assert!(crate::utils::is_aligned(config.semispace_size, GRANULE));
        assert!(crate::utils::is_aligned(config.tenure_size, GRANULE));
        assert!(config.tenure_size <= config.tenure_capacity);

        let total = config.tenure_capacity + 2 * config.semispace_size;
        let reservation = Mmap::new(total);
        let begin = reservation.start();

        let tenured = TenuredSpace::new(begin, config.tenure_size, config.tenure_capacity);
        // The slack between the committed size and the capacity is not
        // needed until the pool grows into it.
        if config.tenure_size < config.tenure_capacity {
            reservation.decommit(
                unsafe { begin.add(config.tenure_size) },
                config.tenure_capacity - config.tenure_size,
            );
        }
        let young_begin = begin as usize + config.tenure_capacity;
        let scavenger = Scavenger::new(young_begin, &config);

        let mut regions = RegionTable::new();
        regions.add_range(RegionKind::Old, begin as usize, begin as usize + config.tenure_size);
        regions.add_range(
            RegionKind::New,
            young_begin,
            young_begin + 2 * config.semispace_size,
        );

        let mark_map = MarkMap::new(begin, total);
        let remembered = RememberedSet::new(config.remembered_set_capacity);
        let dispatcher = Dispatcher::new(config.workers);

        let mut events = EventBus::new();
        if config.verbose {
            events.add_listener(Box::new(crate::events::VerboseListener));
        }

        Self {
            backend: Backend::Generational(GenerationalBackend {
                scavenger,
                tenured,
                remembered,
                global: GlobalCollector::new(),
                concurrent: ConcurrentScavenger::new(),
            }),
            mark_map,
            regions: Mutex::new(regions),
            roots: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(dispatcher),
            events,
            gc_lock: Mutex::new(()),
            critical_depth: AtomicUsize::new(0),
            total_scavenges: AtomicUsize::new(0),
            total_globals: AtomicUsize::new(0),
            total_percolations: AtomicUsize::new(0),
            model,
            config,
            reservation,
        }
    }

    /// Builds a non-moving heap served entirely by the segregated space.
    pub fn segregated(config: GcConfig, model: Box<dyn ObjectModel>) -> Self {
        let reservation = Mmap::new(config.tenure_capacity);
        let begin = reservation.start();
        let space = SegregatedSpace::new(begin, config.tenure_capacity);

        let mut regions = RegionTable::new();
        regions.add_range(RegionKind::Old, space.begin(), space.end());
        let mark_map = MarkMap::new(begin, config.tenure_capacity);
        let dispatcher = Dispatcher::new(config.workers);

        let mut events = EventBus::new();
        if config.verbose {
            events.add_listener(Box::new(crate::events::VerboseListener));
        }

        Self {
            backend: Backend::Segregated(SegregatedBackend {
                space,
                collector: SegregatedCollector::new(),
            }),
            mark_map,
            regions: Mutex::new(regions),
            roots: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(dispatcher),
            events,
            gc_lock: Mutex::new(()),
            critical_depth: AtomicUsize::new(0),
            total_scavenges: AtomicUsize::new(0),
            total_globals: AtomicUsize::new(0),
            total_percolations: AtomicUsize::new(0),
            model,
            config,
            reservation,
        }
    }

    /// Registers a root constraint: a callback handed every collection's
    /// root-slot visitor. Slots it reports may be rewritten in place.
    pub fn add_constraint(&self, constraint: impl FnMut(&mut dyn SlotVisitor) + Send + 'static) {
        self.roots.lock().push(Box::new(constraint));
    }

    pub fn add_listener(&mut self, listener: Box<dyn GcEventListener>) {
        self.events.add_listener(listener);
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a fresh object and installs its header word. Young in a
    /// generational heap, a size-class cell otherwise. Null only when
    /// even collection cannot free enough memory.
    pub fn allocate(&self, size: usize, embedder: usize) -> *mut ObjectHeader {
        let size = crate::utils::align_usize(size, GRANULE);
        match &self.backend {
            Backend::Generational(g) => {
                for attempt in 0..2 {
                    let memory = g.scavenger.young.allocate_space().bump_alloc(size);
                    if !memory.is_null() {
                        return Self::install_header(memory, embedder);
                    }
                    if attempt == 0 {
                        self.collect_young_internal(CollectReason::AllocationFailure, size);
                    }
                }
                // Too big for the young generation, or it stayed full.
                self.allocate_tenured(size, embedder)
            }
            Backend::Segregated(s) => {
                for attempt in 0..2 {
                    let memory = s.space.alloc(size);
                    if !memory.is_null() {
                        return Self::install_header(memory, embedder);
                    }
                    if attempt == 0 {
                        self.collect_garbage_reason(CollectReason::AllocationFailure, size, false);
                    }
                }
                null_mut()
            }
        }
    }

    /// Allocates directly in the old space, bypassing the nursery.
    pub fn allocate_tenured(&self, size: usize, embedder: usize) -> *mut ObjectHeader {
        let size = crate::utils::align_usize(size, GRANULE);
        match &self.backend {
            Backend::Generational(g) => {
                for attempt in 0..3 {
                    let memory = g.tenured.alloc(size);
                    if !memory.is_null() {
                        return Self::install_header(memory, embedder);
                    }
                    match attempt {
                        0 => self.collect_garbage_reason(
                            CollectReason::AllocationFailure,
                            size,
                            false,
                        ),
                        1 => {
                            if !self.expand_tenured(size.max(g.tenured.size() / 8)) {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
                null_mut()
            }
            Backend::Segregated(_) => self.allocate(size, embedder),
        }
    }

    fn install_header(memory: *mut u8, embedder: usize) -> *mut ObjectHeader {
        let object = memory as *mut ObjectHeader;
        unsafe {
            (*object).store_word(ObjectHeader::new_word(embedder));
        }
        object
    }

    /// Generational store barrier. Call after writing `child` into a
    /// slot of `parent`; the fragment is the mutator thread's private
    /// remembered-set buffer.
    pub fn write_barrier(
        &self,
        fragment: &mut RememberedSetFragment,
        parent: *mut ObjectHeader,
        child: *mut ObjectHeader,
    ) {
        if let Backend::Generational(g) = &self.backend {
            if child.is_null() {
                return;
            }
            if g.tenured.contains(parent.cast()) && g.scavenger.young.contains(child.cast()) {
                g.remembered.remember(fragment, parent);
            }
        }
    }

    /// Creates a remembered-set fragment for a mutator thread. Fragments
    /// from here are registered with the heap's remembered set, so any
    /// batched entries still in them are picked up when a collection
    /// starts; an explicit flush is only an optimization.
    pub fn new_fragment(&self) -> RememberedSetFragment {
        match &self.backend {
            Backend::Generational(g) => g.remembered.new_fragment(),
            Backend::Segregated(_) => RememberedSetFragment::new(),
        }
    }

    /// Flushes a mutator's remembered-set fragment, e.g. when its thread
    /// detaches.
    pub fn flush_fragment(&self, fragment: &mut RememberedSetFragment) {
        if let Backend::Generational(g) = &self.backend {
            g.remembered.flush(fragment);
        }
    }

    // ------------------------------------------------------------------
    // Collection entry points
    // ------------------------------------------------------------------

    /// Runs a young-generation collection. On a segregated heap, or when
    /// the scavenger percolates, a full collection runs instead.
    pub fn collect_young(&self) {
        self.collect_young_internal(CollectReason::RequestedByUser, 0);
    }

    /// Runs a full collection.
    pub fn collect_garbage(&self) {
        self.collect_garbage_reason(CollectReason::RequestedByUser, 0, false);
    }

    /// Runs a full collection with compaction forced on (unless a
    /// critical region pins the heap).
    pub fn collect_and_compact(&self) {
        self.collect_garbage_reason(CollectReason::RequestedByUser, 0, true);
    }

    fn collect_young_internal(&self, reason: CollectReason, requested: usize) {
        match &self.backend {
            Backend::Generational(g) => {
                let _guard = self.gc_lock.lock();
                if self.critical_depth.load(Ordering::Acquire) > 0 {
                    // Pinned objects cannot move; go straight to a global
                    // cycle, which will also skip compaction.
                    self.percolate(g, PercolateReason::CriticalRegionConflict, requested);
                    return;
                }
                self.scavenge_cycle(g, reason, requested);
            }
            Backend::Segregated(_) => {
                self.collect_garbage_reason(reason, requested, false);
            }
        }
    }

    fn collect_garbage_reason(&self, reason: CollectReason, requested: usize, force_compact: bool) {
        let _guard = self.gc_lock.lock();
        match &self.backend {
            Backend::Generational(g) => {
                self.global_cycle(g, reason, requested, force_compact);
            }
            Backend::Segregated(s) => {
                self.segregated_cycle(s, reason, requested);
            }
        }
    }

    /// One scavenge, with percolation on failure. Caller holds gc_lock.
    fn scavenge_cycle(&self, g: &GenerationalBackend, reason: CollectReason, requested: usize) {
        let started = std::time::Instant::now();
        self.events.emit(GcEvent::CycleStart {
            kind: CollectionKind::Scavenge,
            reason,
        });
        let mut roots = self.roots.lock();
        let mut dispatcher = self.dispatcher.lock();
        let mut args = ScavengeArgs {
            model: &*self.model,
            tenured: &g.tenured,
            remembered: &g.remembered,
            dispatcher: &mut dispatcher,
            roots: &mut roots[..],
            config: &self.config,
        };
        let result = g.scavenger.scavenge(&mut args);
        drop(dispatcher);
        drop(roots);

        match result {
            Ok(outcome) => {
                self.total_scavenges.fetch_add(1, Ordering::Relaxed);
                let stats = CycleStats {
                    bytes_copied_survivor: outcome.bytes_copied_survivor,
                    bytes_copied_tenure: outcome.bytes_copied_tenure,
                    objects_copied: outcome.objects_copied,
                    ..CycleStats::default()
                };
                self.events.emit(GcEvent::CycleEnd {
                    kind: CollectionKind::Scavenge,
                    stats,
                });
                logln_if!(
                    self.config.verbose,
                    "[gc] scavenge took {:.3}ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
            Err(percolate_reason) => {
                logln_if!(
                    self.config.verbose,
                    "[gc] scavenge percolated: {:?}",
                    percolate_reason
                );
                self.percolate(g, percolate_reason, requested);
            }
        }
    }

    fn percolate(&self, g: &GenerationalBackend, reason: PercolateReason, requested: usize) {
        self.total_percolations.fetch_add(1, Ordering::Relaxed);
        self.global_cycle(g, CollectReason::Percolation(reason), requested, false);
        g.scavenger.note_global_collection();
    }

    /// One global mark-sweep-compact cycle. Caller holds gc_lock.
    fn global_cycle(
        &self,
        g: &GenerationalBackend,
        reason: CollectReason,
        requested: usize,
        force_compact: bool,
    ) {
        let started = std::time::Instant::now();
        self.events.emit(GcEvent::CycleStart {
            kind: CollectionKind::Global,
            reason,
        });
        let mut cycle = CycleState::new(CollectionKind::Global, reason, requested);
        cycle.compact_forced = force_compact;

        {
            let mut roots = self.roots.lock();
            let mut dispatcher = self.dispatcher.lock();
            let mut args = GlobalArgs {
                model: &*self.model,
                tenured: &g.tenured,
                remembered: &g.remembered,
                mark_map: &self.mark_map,
                young: Some(&g.scavenger.young),
                dispatcher: &mut dispatcher,
                roots: &mut roots[..],
                config: &self.config,
                events: &self.events,
                critical_depth: self.critical_depth.load(Ordering::Acquire),
            };
            g.global.collect(&mut args, &mut cycle);
        }

        self.resize_after_global(g);
        self.total_globals.fetch_add(1, Ordering::Relaxed);
        self.events.emit(GcEvent::CycleEnd {
            kind: CollectionKind::Global,
            stats: cycle.stats,
        });
        logln_if!(
            self.config.verbose,
            "[gc] global collection took {:.3}ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
    }

    fn segregated_cycle(&self, s: &SegregatedBackend, reason: CollectReason, requested: usize) {
        let started = std::time::Instant::now();
        self.events.emit(GcEvent::CycleStart {
            kind: CollectionKind::Global,
            reason,
        });
        let mut cycle = CycleState::new(CollectionKind::Global, reason, requested);
        {
            let mut roots = self.roots.lock();
            let mut dispatcher = self.dispatcher.lock();
            let mut args = SegregatedArgs {
                model: &*self.model,
                space: &s.space,
                mark_map: &self.mark_map,
                dispatcher: &mut dispatcher,
                roots: &mut roots[..],
                config: &self.config,
                events: &self.events,
            };
            s.collector.collect(&mut args, &mut cycle);
        }
        self.total_globals.fetch_add(1, Ordering::Relaxed);
        self.events.emit(GcEvent::CycleEnd {
            kind: CollectionKind::Global,
            stats: cycle.stats,
        });
        logln_if!(
            self.config.verbose,
            "[gc] segregated collection took {:.3}ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
    }

    // ------------------------------------------------------------------
    // Concurrent young-generation mode
    // ------------------------------------------------------------------

    /// Advances the concurrent scavenge phase machine by one step. The
    /// embedder's scheduler calls this between mutator bursts. Returns
    /// None on a segregated heap.
    pub fn concurrent_scavenge_step(&self) -> Option<Result<ConcurrentPhase, PercolateReason>> {
        let g = match &self.backend {
            Backend::Generational(g) => g,
            Backend::Segregated(_) => return None,
        };
        let _guard = self.gc_lock.lock();
        let result = {
            let mut roots = self.roots.lock();
            let mut dispatcher = self.dispatcher.lock();
            let mut args = ScavengeArgs {
                model: &*self.model,
                tenured: &g.tenured,
                remembered: &g.remembered,
                dispatcher: &mut dispatcher,
                roots: &mut roots[..],
                config: &self.config,
            };
            g.concurrent.step(&g.scavenger, &mut args)
        };
        if let Err(reason) = result {
            self.percolate(g, reason, 0);
        } else if matches!(result, Ok(ConcurrentPhase::Complete)) {
            self.total_scavenges.fetch_add(1, Ordering::Relaxed);
        }
        Some(result)
    }

    /// Asks an in-flight concurrent scavenge to wind down at the next
    /// phase boundary.
    pub fn request_concurrent_terminate(&self) {
        if let Backend::Generational(g) = &self.backend {
            g.concurrent.request_terminate();
        }
    }

    // ------------------------------------------------------------------
    // Critical regions
    // ------------------------------------------------------------------

    /// Enters a region during which no object may move. Collections may
    /// still run but will neither scavenge nor compact.
    pub fn enter_critical_region(&self) {
        self.critical_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn exit_critical_region(&self) {
        let prev = self.critical_depth.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unbalanced critical region exit");
    }

    // ------------------------------------------------------------------
    // Resize interface
    // ------------------------------------------------------------------

    /// Grows the committed tenured pool by at least `bytes`. Returns
    /// false when the capacity reservation is exhausted.
    pub fn expand_tenured(&self, bytes: usize) -> bool {
        let g = match &self.backend {
            Backend::Generational(g) => g,
            Backend::Segregated(_) => return false,
        };
        let prev_end = g.tenured.end();
        match g.tenured.expand(bytes) {
            Some((range_begin, range_end)) => {
                self.reservation
                    .commit(range_begin as *mut u8, range_end - range_begin);
                let mut regions = self.regions.lock();
                regions.remove_range(g.tenured.begin(), prev_end);
                regions.add_range(RegionKind::Old, g.tenured.begin(), range_end);
                true
            }
            None => false,
        }
    }

    /// Shrinks the committed tenured pool by `bytes` off its tail. Fails
    /// when the tail is not entirely free.
    pub fn contract_tenured(&self, bytes: usize) -> bool {
        let g = match &self.backend {
            Backend::Generational(g) => g,
            Backend::Segregated(_) => return false,
        };
        let end = g.tenured.end();
        let begin = match end.checked_sub(bytes) {
            Some(begin) if begin > g.tenured.begin() => begin,
            _ => return false,
        };
        if !g.tenured.contract(begin, end) {
            return false;
        }
        self.reservation.decommit(begin as *mut u8, bytes);
        let mut regions = self.regions.lock();
        regions.remove_range(g.tenured.begin(), end);
        regions.add_range(RegionKind::Old, g.tenured.begin(), begin);
        true
    }

    fn resize_after_global(&self, g: &GenerationalBackend) {
        let size = g.tenured.size();
        let free = g.tenured.free_bytes();
        if (free as f64) < EXPAND_FREE_RATIO * size as f64 {
            self.expand_tenured((size / 4).max(GRANULE));
        } else if (free as f64) > CONTRACT_FREE_RATIO * size as f64 {
            // Best effort: succeeds only when the candidate tail is one
            // free extent.
            self.contract_tenured(crate::utils::align_down(free / 2, GRANULE));
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn region_kind_of(&self, object: *const ObjectHeader) -> Option<RegionKind> {
        self.regions.lock().kind_of_object(object)
    }

    /// Walks every live-or-dead entity of the old space in address
    /// order. The heap must be walkable: directly after a global
    /// collection, or after [`Heap::fix_heap_for_walk`].
    pub fn walk_tenured(&self, f: impl FnMut(*mut ObjectHeader)) {
        match &self.backend {
            Backend::Generational(g) => g.tenured.walk(&*self.model, f),
            Backend::Segregated(_) => {}
        }
    }

    /// Writes dead-object placeholders into unswept gaps so the old
    /// space can be walked mid-epoch. Requires a valid mark map.
    pub fn fix_heap_for_walk(&self) {
        if let Backend::Generational(g) = &self.backend {
            g.global
                .fix_heap_for_walk(&*self.model, &g.tenured, &self.mark_map);
        }
    }

    pub fn statistics(&self) -> HeapStatistics {
        match &self.backend {
            Backend::Generational(g) => HeapStatistics {
                semispace_size: self.config.semispace_size,
                survivor_in_use: g.scavenger.young.allocate_space().bytes_in_use(),
                tenure_size: g.tenured.size(),
                tenure_in_use: g.tenured.bytes_in_use(),
                total_scavenges: self.total_scavenges.load(Ordering::Relaxed),
                total_global_collections: self.total_globals.load(Ordering::Relaxed),
                total_percolations: self.total_percolations.load(Ordering::Relaxed),
            },
            Backend::Segregated(s) => HeapStatistics {
                semispace_size: 0,
                survivor_in_use: 0,
                tenure_size: s.space.end() - s.space.begin(),
                tenure_in_use: s.space.bytes_in_use(),
                total_scavenges: 0,
                total_global_collections: self.total_globals.load(Ordering::Relaxed),
                total_percolations: 0,
            },
        }
    }

    pub fn remembered_set_len(&self) -> usize {
        match &self.backend {
            Backend::Generational(g) => g.remembered.len(),
            Backend::Segregated(_) => 0,
        }
    }

    pub fn remembered_set_overflowed(&self) -> bool {
        match &self.backend {
            Backend::Generational(g) => g.remembered.is_overflowed(),
            Backend::Segregated(_) => false,
        }
    }
}
