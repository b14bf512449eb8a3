use atomic::{Atomic, Ordering};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::copy_cache::{CachePool, CopyScanCache, Destination, ScanQueue, ScanWork};
use crate::cycle::PercolateReason;
use crate::globals::{GRANULE, SPLIT_SLICE_SLOTS, SPLIT_SLICE_THRESHOLD};
use crate::header::ObjectHeader;
use crate::object_model::{ObjectModel, SlotVisitor};
use crate::remembered::RememberedSet;
use crate::stats::SurvivalHistory;
use crate::task::Dispatcher;
use crate::tenured::{DeadEntry, TenuredSpace};
use crate::GcConfig;

/// How the per-cycle tenure age is chosen. Affects throughput only,
/// never correctness.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TenureStrategy {
    /// Promote objects whose age reached the given threshold.
    Fixed(u8),
    /// Adjust the threshold each cycle from survivor-space pressure.
    AdaptiveHistory,
    /// Walk the survival-by-age diagonal looking for the first age whose
    /// survival collapsed, and tenure everything older.
    LookBack,
}

/// One half of the young generation. The bump cursor sits on its own
/// cache line; every worker contends on it when refilling copy caches.
pub struct SemiSpace {
    begin: usize,
    end: usize,
    cursor: CachePadded<AtomicUsize>,
}

impl SemiSpace {
    pub fn new(begin: usize, size: usize) -> Self {
        Self {
            begin,
            end: begin + size,
            cursor: CachePadded::new(AtomicUsize::new(begin)),
        }
    }

    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        (addr as usize) >= self.begin && (addr as usize) < self.end
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn bytes_in_use(&self) -> usize {
        self.cursor.load(std::sync::atomic::Ordering::Relaxed) - self.begin
    }

    pub fn free_bytes(&self) -> usize {
        self.end - self.cursor.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.cursor
            .store(self.begin, std::sync::atomic::Ordering::Release);
    }

    #[inline]
    pub fn bump_alloc(&self, size: usize) -> *mut u8 {
        let mut old = self.cursor.load(std::sync::atomic::Ordering::Relaxed);
        loop {
            let new = old + size;
            if new > self.end {
                return null_mut();
            }
            match self.cursor.compare_exchange_weak(
                old,
                new,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::Relaxed,
            ) {
                Ok(_) => return old as *mut u8,
                Err(x) => old = x,
            }
        }
    }
}

/// The two semispaces plus the flip state. Mutator allocation goes into
/// the allocate side; a scavenge evacuates that side into the other.
pub struct YoungGeneration {
    spaces: [SemiSpace; 2],
    allocate_side: AtomicUsize,
}

impl YoungGeneration {
    pub fn new(begin: usize, semispace_size: usize) -> Self {
        Self {
            spaces: [
                SemiSpace::new(begin, semispace_size),
                SemiSpace::new(begin + semispace_size, semispace_size),
            ],
            allocate_side: AtomicUsize::new(0),
        }
    }

    fn side(&self) -> usize {
        self.allocate_side.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn allocate_space(&self) -> &SemiSpace {
        &self.spaces[self.side()]
    }

    /// The semispace being vacated this cycle (the allocate side until
    /// the post-cycle flip).
    pub fn evacuate_space(&self) -> &SemiSpace {
        &self.spaces[self.side()]
    }

    pub fn survivor_space(&self) -> &SemiSpace {
        &self.spaces[1 - self.side()]
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        self.spaces[0].contains(addr) || self.spaces[1].contains(addr)
    }

    /// Completes a successful cycle: the vacated side is recycled and
    /// allocation continues in the space holding the survivors.
    pub fn flip(&self) {
        self.evacuate_space().reset();
        self.allocate_side
            .store(1 - self.side(), std::sync::atomic::Ordering::Release);
    }

    pub fn begin(&self) -> usize {
        self.spaces[0].begin()
    }

    pub fn end(&self) -> usize {
        self.spaces[1].end()
    }
}

struct BackoutEntry {
    old: *mut ObjectHeader,
    new: *mut ObjectHeader,
    preserved_word: usize,
}

unsafe impl Send for BackoutEntry {}

/// Everything the scavenger needs from the surrounding heap for one
/// cycle. Assembled by the coordinator.
pub struct ScavengeArgs<'a> {
    pub model: &'a dyn ObjectModel,
    pub tenured: &'a TenuredSpace,
    pub remembered: &'a RememberedSet,
    pub dispatcher: &'a mut Dispatcher,
    pub roots: &'a mut [Box<dyn FnMut(&mut dyn SlotVisitor) + Send>],
    pub config: &'a GcConfig,
}

/// Outcome of one scavenge cycle.
pub struct ScavengeOutcome {
    pub bytes_copied_survivor: usize,
    pub bytes_copied_tenure: usize,
    pub objects_copied: usize,
}

/// The young-generation copying collector. Reclaims the evacuate
/// semispace by copying everything reachable from roots and the
/// remembered set into the survivor semispace or the tenured space.
pub struct Scavenger {
    pub young: YoungGeneration,
    scan_queue: ScanQueue,
    cache_pool: CachePool,
    abort: AtomicBool,
    abort_reason: Mutex<Option<PercolateReason>>,
    backout: Mutex<Vec<BackoutEntry>>,
    tenure_age: AtomicUsize,
    scavenges_since_global: AtomicUsize,
    history: Mutex<SurvivalHistory>,
    copied_survivor: AtomicUsize,
    copied_tenure: AtomicUsize,
    copied_objects: AtomicUsize,
}

impl Scavenger {
    pub fn new(young_begin: usize, config: &GcConfig) -> Self {
        let initial_age = match config.tenure_strategy {
            TenureStrategy::Fixed(age) => age,
            _ => crate::globals::MAX_OBJECT_AGE / 2,
        };
        Self {
            young: YoungGeneration::new(young_begin, config.semispace_size),
            scan_queue: ScanQueue::new(config.workers),
            cache_pool: CachePool::new(2 * config.workers),
            abort: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            backout: Mutex::new(Vec::new()),
            tenure_age: AtomicUsize::new(initial_age as usize),
            scavenges_since_global: AtomicUsize::new(0),
            history: Mutex::new(SurvivalHistory::default()),
            copied_survivor: AtomicUsize::new(0),
            copied_tenure: AtomicUsize::new(0),
            copied_objects: AtomicUsize::new(0),
        }
    }

    pub fn tenure_age(&self) -> u8 {
        self.tenure_age.load(std::sync::atomic::Ordering::Relaxed) as u8
    }

    pub fn note_global_collection(&self) {
        self.scavenges_since_global
            .store(0, std::sync::atomic::Ordering::Relaxed);
    }

    fn is_aborting(&self) -> bool {
        self.abort.load(std::sync::atomic::Ordering::Acquire)
    }

    fn raise_abort(&self, reason: PercolateReason) {
        let mut slot = self.abort_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.abort.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Runs one scavenge. On success the evacuate semispace is entirely
    /// reusable afterwards; on failure the heap is restored to its
    /// pre-cycle state and the returned reason tells the coordinator why
    /// it must percolate to the global collector.
    pub fn scavenge(&self, args: &mut ScavengeArgs<'_>) -> Result<ScavengeOutcome, PercolateReason> {
        let drained = self.begin_scavenge(args)?;
        self.process_roots(args, &drained);
        self.drain_scan_work(args);
        self.complete_scavenge(args, drained)
    }

    /// Entry checks and cycle setup. Outstanding mutator fragments are
    /// flushed into the remembered set first, then the set is drained
    /// and the search phase begins.
    pub(crate) fn begin_scavenge(
        &self,
        args: &mut ScavengeArgs<'_>,
    ) -> Result<Vec<*mut ObjectHeader>, PercolateReason> {
        args.remembered.flush_all_fragments();
        let count = self
            .scavenges_since_global
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if count + 1 > args.config.max_scavenges {
            return Err(PercolateReason::MaxScavenges);
        }
        if args.remembered.is_overflowed() {
            // The set's contents must be ignored; only a full collection
            // can rebuild the exact cross-generational picture.
            return Err(PercolateReason::RememberedSetOverflow);
        }

        self.select_tenure_age(args.config);
        self.begin_cycle();
        args.remembered.begin_search();
        Ok(args.remembered.take_all())
    }

    /// Master phase: roots and drained remembered-set entries are
    /// processed on the initiating thread, seeding the shared scan lists.
    pub(crate) fn process_roots(&self, args: &mut ScavengeArgs<'_>, drained: &[*mut ObjectHeader]) {
        let mut master = ScavengerWorker::new(self, args.model, args.tenured, args.config);
        for constraint in args.roots.iter_mut() {
            constraint(&mut CopyForwardVisitor {
                worker: &mut master,
            });
        }
        for &object in drained.iter() {
            master.scan_object(object);
        }
        master.finish();
    }

    /// Parallel phase: the scan lists drain across the worker pool.
    pub(crate) fn drain_scan_work(&self, args: &mut ScavengeArgs<'_>) {
        let model = args.model;
        let tenured = args.tenured;
        let config = args.config;
        args.dispatcher.dispatch(|_worker_id| {
            let mut worker = ScavengerWorker::new(self, model, tenured, config);
            worker.run();
            worker.finish();
        });
    }

    /// Cycle teardown: backout on abort, otherwise remembered-set
    /// rebuild and the semispace flip.
    pub(crate) fn complete_scavenge(
        &self,
        args: &mut ScavengeArgs<'_>,
        drained: Vec<*mut ObjectHeader>,
    ) -> Result<ScavengeOutcome, PercolateReason> {
        if self.is_aborting() {
            self.backout(args, &drained);
            args.remembered.end_search();
            self.restore_remembered(args, &drained);
            let reason = self
                .abort_reason
                .lock()
                .take()
                .unwrap_or(PercolateReason::AbortedScavenge);
            return Err(reason);
        }

        args.remembered.end_search();
        self.rebuild_remembered_after_flip(args, &drained);
        self.young.flip();

        Ok(ScavengeOutcome {
            bytes_copied_survivor: self.copied_survivor.load(std::sync::atomic::Ordering::Relaxed),
            bytes_copied_tenure: self.copied_tenure.load(std::sync::atomic::Ordering::Relaxed),
            objects_copied: self.copied_objects.load(std::sync::atomic::Ordering::Relaxed),
        })
    }

    fn begin_cycle(&self) {
        self.scan_queue.reset();
        self.abort.store(false, std::sync::atomic::Ordering::Release);
        *self.abort_reason.lock() = None;
        self.backout.lock().clear();
        self.copied_survivor
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.copied_tenure
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.copied_objects
            .store(0, std::sync::atomic::Ordering::Relaxed);
        self.history.lock().reset();
        self.young.survivor_space().reset();
    }

    fn select_tenure_age(&self, config: &GcConfig) {
        let age = match config.tenure_strategy {
            TenureStrategy::Fixed(age) => age,
            TenureStrategy::AdaptiveHistory => {
                // Survivor pressure drives the threshold: heavy flipping
                // lowers the age so more is promoted, light flipping
                // raises it so young garbage gets more time to die.
                let history = self.history.lock();
                let current = self.tenure_age();
                let survivor_load =
                    history.flip_bytes as f64 / config.semispace_size.max(1) as f64;
                if survivor_load > 0.7 {
                    current.saturating_sub(1).max(1)
                } else {
                    (current + 1).min(crate::globals::MAX_OBJECT_AGE)
                }
            }
            TenureStrategy::LookBack => {
                let history = self.history.lock();
                let mut age = crate::globals::MAX_OBJECT_AGE;
                let mut prev = usize::MAX;
                for (i, &survived) in history.survived_by_age.iter().enumerate().skip(1) {
                    // The first age whose survival collapsed relative to
                    // the previous diagonal is old enough to tenure.
                    if prev != usize::MAX && prev > 0 && survived * 2 > prev {
                        age = i as u8;
                        break;
                    }
                    prev = survived;
                }
                age.max(1)
            }
        };
        self.tenure_age
            .store(age as usize, std::sync::atomic::Ordering::Relaxed);
    }

    /// Single-threaded reversal of an aborted cycle. Restores every
    /// forwarded header in the evacuate semispace, installs reverse
    /// forwarding in the copies, then repairs the slots that were
    /// rewritten to point at now-reversed copies.
    fn backout(&self, args: &mut ScavengeArgs<'_>, drained: &[*mut ObjectHeader]) {
        let entries = std::mem::take(&mut *self.backout.lock());
        unsafe {
            for entry in entries.iter() {
                (*entry.old).store_word(entry.preserved_word);
                // The copy now routes anyone still holding it back to the
                // pre-cycle location.
                let _ = (*entry.new).try_forward(entry.old);
            }
        }

        let mut repair = BackoutRepairVisitor { scavenger: self };
        for constraint in args.roots.iter_mut() {
            constraint(&mut repair);
        }
        for &object in drained.iter() {
            args.model.scan(object, &mut repair);
        }

        // Copies in the survivor semispace are dropped wholesale; copies
        // already promoted to tenure become unreachable holes that the
        // percolated global collection reclaims.
        self.young.survivor_space().reset();
    }

    fn restore_remembered(&self, args: &mut ScavengeArgs<'_>, drained: &[*mut ObjectHeader]) {
        // The drained entries are put back verbatim: the cycle was undone,
        // so the pre-cycle set is exact again.
        unsafe {
            for &object in drained.iter() {
                (*object).clear_remembered();
            }
        }
        for &object in drained.iter() {
            args.remembered.remember_unbatched(object);
        }
    }

    /// After a successful cycle, recomputes remembered-set membership
    /// for the previously remembered holders and for every object this
    /// cycle promoted to tenure: exactly the ones that still reference
    /// the young generation stay in the set.
    fn rebuild_remembered_after_flip(
        &self,
        args: &mut ScavengeArgs<'_>,
        drained: &[*mut ObjectHeader],
    ) {
        let survivor = self.young.survivor_space();
        let mut candidates: Vec<*mut ObjectHeader> = drained.to_vec();
        for entry in self.backout.lock().iter() {
            if args.tenured.contains(entry.new.cast()) {
                candidates.push(entry.new);
            }
        }

        unsafe {
            for &object in candidates.iter() {
                (*object).clear_remembered();
            }
        }
        for &object in candidates.iter() {
            let mut holds_young = false;
            args.model.scan(object, &mut |slot: *mut *mut ObjectHeader| {
                let value = unsafe { *slot };
                if !value.is_null() && survivor.contains(value.cast()) {
                    holds_young = true;
                }
            });
            if holds_young {
                args.remembered.remember_unbatched(object);
            }
        }
    }
}

/// Per-worker scavenge state: the private survivor and tenure copy
/// caches plus the thread-local result lists merged on finish.
struct ScavengerWorker<'a> {
    scavenger: &'a Scavenger,
    model: &'a dyn ObjectModel,
    tenured: &'a TenuredSpace,
    config: &'a GcConfig,
    survivor_cache: Option<Box<CopyScanCache>>,
    tenure_cache: Option<Box<CopyScanCache>>,
    backout: Vec<BackoutEntry>,
    history: SurvivalHistory,
    copied_survivor: usize,
    copied_tenure: usize,
    copied_objects: usize,
}

impl<'a> ScavengerWorker<'a> {
    fn new(
        scavenger: &'a Scavenger,
        model: &'a dyn ObjectModel,
        tenured: &'a TenuredSpace,
        config: &'a GcConfig,
    ) -> Self {
        Self {
            scavenger,
            model,
            tenured,
            config,
            survivor_cache: None,
            tenure_cache: None,
            backout: Vec::new(),
            history: SurvivalHistory::default(),
            copied_survivor: 0,
            copied_tenure: 0,
            copied_objects: 0,
        }
    }

    /// Main worker loop: drain private caches, then take shared work,
    /// until the termination barrier declares the phase complete.
    fn run(&mut self) {
        loop {
            while self.scan_own_caches() {}
            match self.scavenger.scan_queue.pop() {
                Some(work) => self.do_shared_work(work),
                None => break,
            }
        }
    }

    fn do_shared_work(&mut self, work: ScanWork) {
        match work {
            ScanWork::Cache(mut cache) => {
                self.scan_span(&mut cache);
                if cache.has_scan_work() {
                    self.scavenger.scan_queue.push(ScanWork::Cache(cache));
                } else {
                    self.discard_cache(cache);
                }
            }
            ScanWork::Slice { object, from, to } => {
                self.model.scan_slice(
                    object,
                    from,
                    to,
                    &mut CopyForwardVisitor { worker: self },
                );
            }
        }
    }

    /// Scans whatever spans accumulated in the private caches. Returns
    /// true if any object was scanned (new copies may have landed).
    fn scan_own_caches(&mut self) -> bool {
        let mut did_work = false;
        for which in [Destination::Survivor, Destination::Tenure] {
            loop {
                let (scan, alloc) = match self.cache_ref(which) {
                    Some(cache) => (cache.scan_cursor(), cache.alloc_cursor()),
                    None => break,
                };
                if scan >= alloc {
                    break;
                }
                let object = scan as *mut ObjectHeader;
                let size = self.model.size_of(object);
                // The cursor moves past the object before scanning so a
                // mid-scan retire hands the correct remainder to the
                // shared list.
                if let Some(cache) = self.cache_mut(which) {
                    cache.advance_scan(unsafe { scan.add(size) });
                }
                self.scan_object(object);
                did_work = true;
            }
        }
        did_work
    }

    fn cache_ref(&self, which: Destination) -> Option<&CopyScanCache> {
        match which {
            Destination::Survivor => self.survivor_cache.as_deref(),
            Destination::Tenure => self.tenure_cache.as_deref(),
        }
    }

    fn cache_mut(&mut self, which: Destination) -> Option<&mut CopyScanCache> {
        match which {
            Destination::Survivor => self.survivor_cache.as_deref_mut(),
            Destination::Tenure => self.tenure_cache.as_deref_mut(),
        }
    }

    fn scan_span(&mut self, cache: &mut CopyScanCache) {
        loop {
            let scan = cache.scan_cursor();
            if scan >= cache.alloc_cursor() {
                return;
            }
            let object = scan as *mut ObjectHeader;
            let size = self.model.size_of(object);
            cache.advance_scan(unsafe { scan.add(size) });
            self.scan_object(object);
        }
    }

    /// Applies copy-and-forward to every reference slot of `object`.
    /// Large indexable objects have their tail split into sub-range work
    /// units so other workers can share the load.
    fn scan_object(&mut self, object: *mut ObjectHeader) {
        if self.model.is_indexable(object) {
            let slots = self.model.slot_count(object);
            if slots > SPLIT_SLICE_THRESHOLD {
                let mut from = SPLIT_SLICE_SLOTS;
                while from < slots {
                    let to = (from + SPLIT_SLICE_SLOTS).min(slots);
                    self.scavenger
                        .scan_queue
                        .push(ScanWork::Slice { object, from, to });
                    from = to;
                }
                self.model.scan_slice(
                    object,
                    0,
                    SPLIT_SLICE_SLOTS,
                    &mut CopyForwardVisitor { worker: self },
                );
                return;
            }
        }
        self.model
            .scan(object, &mut CopyForwardVisitor { worker: self });
    }

    /// The heart of the scavenger. Exactly one concurrent caller wins
    /// the forwarding-pointer installation for a given referent; losers
    /// observe and follow the winner's pointer.
    fn copy_and_forward(&mut self, slot: *mut *mut ObjectHeader) {
        unsafe {
            let object = *slot;
            if object.is_null() {
                return;
            }
            if !self.scavenger.young.evacuate_space().contains(object.cast()) {
                return;
            }
            let header = &*object;
            if header.is_forwarded() {
                *slot = header.forwarding_pointer();
                return;
            }
            if self.scavenger.is_aborting() {
                // No new copies once the cycle is doomed; already-queued
                // scan work still drains so the heap stays consistent.
                return;
            }

            let size = self.model.size_of(object);
            let age = header.age();
            let tenure = age >= self.scavenger.tenure_age();
            let (memory, dest) = match self.reserve(tenure, size) {
                Some(pair) => pair,
                None => return,
            };

            match header.try_forward(memory.cast()) {
                Ok(preserved) => {
                    std::ptr::copy_nonoverlapping(object.cast::<u8>(), memory, size);
                    let copy = memory.cast::<ObjectHeader>();
                    (*copy).store_word(ObjectHeader::word_with_bumped_age(preserved));
                    *slot = copy;

                    self.backout.push(BackoutEntry {
                        old: object,
                        new: copy,
                        preserved_word: preserved,
                    });
                    self.history.record_copy(
                        ObjectHeader::age_of_word(preserved),
                        size,
                        dest == Destination::Tenure,
                    );
                    self.copied_objects += 1;
                    match dest {
                        Destination::Survivor => self.copied_survivor += size,
                        Destination::Tenure => self.copied_tenure += size,
                    }
                }
                Err(winner) => {
                    // Lost the race: hand the reservation back and follow.
                    if let Some(cache) = self.cache_mut(dest) {
                        cache.undo_alloc(memory, size);
                    }
                    *slot = winner;
                }
            }
        }
    }

    /// Reserves `size` bytes in the private cache for `tenure`-or-not,
    /// refilling from the backing space as needed. Raises the shared
    /// abort flag when neither space can provide memory.
    fn reserve(&mut self, tenure: bool, size: usize) -> Option<(*mut u8, Destination)> {
        let dest = if tenure {
            Destination::Tenure
        } else {
            Destination::Survivor
        };
        if let Some(memory) = self.try_reserve_in(dest, size) {
            return Some((memory, dest));
        }
        // Survivor exhaustion redirects to tenure before giving up; the
        // reverse direction makes no sense.
        if dest == Destination::Survivor {
            if let Some(memory) = self.try_reserve_in(Destination::Tenure, size) {
                return Some((memory, Destination::Tenure));
            }
            self.scavenger
                .raise_abort(PercolateReason::InsufficientTenureSpace);
            return None;
        }
        self.scavenger
            .raise_abort(PercolateReason::FailedTenureAllocation);
        None
    }

    fn try_reserve_in(&mut self, dest: Destination, size: usize) -> Option<*mut u8> {
        loop {
            if let Some(cache) = self.cache_mut(dest) {
                let memory = cache.alloc(size);
                if !memory.is_null() {
                    return Some(memory);
                }
                self.retire_cache(dest);
            }

            let chunk_len = self.config.cache_size.max(size);
            let (base, len) = match dest {
                Destination::Survivor => {
                    let base = self.scavenger.young.survivor_space().bump_alloc(chunk_len);
                    if base.is_null() {
                        return None;
                    }
                    (base, chunk_len)
                }
                Destination::Tenure => match self.tenured.alloc_chunk(size, chunk_len) {
                    Some(pair) => pair,
                    None => return None,
                },
            };
            let mut cache = self.scavenger.cache_pool.acquire();
            cache.assign(base, len, dest);
            match dest {
                Destination::Survivor => self.survivor_cache = Some(cache),
                Destination::Tenure => self.tenure_cache = Some(cache),
            }
        }
    }

    /// Detaches the active cache for `dest`. Unscanned content goes to
    /// the shared scan list; fully scanned caches give their tail back.
    fn retire_cache(&mut self, dest: Destination) {
        let cache = match dest {
            Destination::Survivor => self.survivor_cache.take(),
            Destination::Tenure => self.tenure_cache.take(),
        };
        if let Some(cache) = cache {
            if cache.has_scan_work() {
                self.scavenger.scan_queue.push(ScanWork::Cache(cache));
            } else {
                self.discard_cache(cache);
            }
        }
    }

    fn discard_cache(&mut self, mut cache: Box<CopyScanCache>) {
        let dest = cache.dest;
        let (tail, tail_len) = cache.retire();
        if dest == Destination::Tenure && tail_len > 0 {
            if tail_len >= crate::globals::MIN_CACHE_REMAINDER {
                self.tenured.release_range(tail, tail_len);
            } else {
                // Too small to reuse, but the pool must stay walkable;
                // the next sweep reclaims it.
                unsafe { DeadEntry::write(tail, tail_len) };
            }
        }
        self.scavenger.cache_pool.release(cache);
    }

    /// Publishes this worker's results and returns its caches.
    fn finish(&mut self) {
        self.retire_cache(Destination::Survivor);
        self.retire_cache(Destination::Tenure);

        self.scavenger
            .backout
            .lock()
            .append(&mut self.backout);
        let mut history = self.scavenger.history.lock();
        for (i, &bytes) in self.history.survived_by_age.iter().enumerate() {
            history.survived_by_age[i] += bytes;
        }
        history.flip_bytes += self.history.flip_bytes;
        history.tenure_bytes += self.history.tenure_bytes;
        self.history.reset();

        self.scavenger
            .copied_survivor
            .fetch_add(self.copied_survivor, std::sync::atomic::Ordering::Relaxed);
        self.scavenger
            .copied_tenure
            .fetch_add(self.copied_tenure, std::sync::atomic::Ordering::Relaxed);
        self.scavenger
            .copied_objects
            .fetch_add(self.copied_objects, std::sync::atomic::Ordering::Relaxed);
        self.copied_survivor = 0;
        self.copied_tenure = 0;
        self.copied_objects = 0;
    }
}

struct CopyForwardVisitor<'w, 'a> {
    worker: &'w mut ScavengerWorker<'a>,
}

impl SlotVisitor for CopyForwardVisitor<'_, '_> {
    fn visit_slot(&mut self, slot: *mut *mut ObjectHeader) {
        self.worker.copy_and_forward(slot);
    }
}

/// Rewrites slots pointing at reversed copies back to their pre-cycle
/// addresses during backout.
struct BackoutRepairVisitor<'a> {
    scavenger: &'a Scavenger,
}

impl SlotVisitor for BackoutRepairVisitor<'_> {
    fn visit_slot(&mut self, slot: *mut *mut ObjectHeader) {
        unsafe {
            let value = *slot;
            if value.is_null() {
                return;
            }
            if (*value).is_forwarded() {
                let target = (*value).forwarding_pointer();
                if self.scavenger.young.contains(target.cast()) {
                    *slot = target;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Concurrent mode: the cycle split into explicit phases that a scheduler
// loop advances between bursts of mutator execution.
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConcurrentPhase {
    Idle,
    Init,
    Roots,
    Scan,
    Complete,
}

struct DrainedList(Vec<*mut ObjectHeader>);

unsafe impl Send for DrainedList {}

/// Phase machine for the optional concurrent young-generation mode.
/// `step` advances one phase at a time; the embedder's scheduler loop
/// (or a dedicated background thread) drives it and lets mutators run
/// between steps, synchronizing only at allocation and safe points.
///
/// While a cycle is in flight (phase past `Roots`) the remembered set is
/// in its search phase and copies exist in the survivor semispace; the
/// embedder must keep mutators from touching the heap until `Complete`
/// finishes, and no other collection entry point may run.
pub struct ConcurrentScavenger {
    phase: Atomic<ConcurrentPhase>,
    terminate_requested: AtomicBool,
    in_flight: Mutex<DrainedList>,
}

impl ConcurrentScavenger {
    pub fn new() -> Self {
        Self {
            phase: Atomic::new(ConcurrentPhase::Idle),
            terminate_requested: AtomicBool::new(false),
            in_flight: Mutex::new(DrainedList(Vec::new())),
        }
    }

    pub fn phase(&self) -> ConcurrentPhase {
        self.phase.load(Ordering::Acquire)
    }

    /// Advisory early-termination request. Checked only at phase
    /// boundaries and honored once the heap is consistent; never used to
    /// kill a worker mid-copy.
    pub fn request_terminate(&self) {
        self.terminate_requested
            .store(true, std::sync::atomic::Ordering::Release);
    }

    fn take_terminate(&self) -> bool {
        self.terminate_requested
            .swap(false, std::sync::atomic::Ordering::AcqRel)
    }

    /// Advances the cycle one phase. Returns the phase that was just
    /// completed; a terminate request honored at a boundary returns
    /// `Idle` to signal the wind-down.
    ///
    /// Termination is honored at the `Init` and `Roots` boundaries,
    /// where no copies exist yet. Once roots are processed the cycle
    /// runs through `Complete`; tearing it down earlier would need a
    /// full backout for nothing gained.
    pub fn step(
        &self,
        scavenger: &Scavenger,
        args: &mut ScavengeArgs<'_>,
    ) -> Result<ConcurrentPhase, PercolateReason> {
        match self.phase() {
            ConcurrentPhase::Idle => {
                self.phase.store(ConcurrentPhase::Init, Ordering::Release);
                Ok(ConcurrentPhase::Idle)
            }
            ConcurrentPhase::Init => {
                if self.take_terminate() {
                    self.phase.store(ConcurrentPhase::Idle, Ordering::Release);
                    return Ok(ConcurrentPhase::Idle);
                }
                self.phase.store(ConcurrentPhase::Roots, Ordering::Release);
                Ok(ConcurrentPhase::Init)
            }
            ConcurrentPhase::Roots => {
                if self.take_terminate() {
                    self.phase.store(ConcurrentPhase::Idle, Ordering::Release);
                    return Ok(ConcurrentPhase::Idle);
                }
                match scavenger.begin_scavenge(args) {
                    Err(reason) => {
                        self.phase.store(ConcurrentPhase::Idle, Ordering::Release);
                        Err(reason)
                    }
                    Ok(drained) => {
                        scavenger.process_roots(args, &drained);
                        self.in_flight.lock().0 = drained;
                        self.phase.store(ConcurrentPhase::Scan, Ordering::Release);
                        Ok(ConcurrentPhase::Roots)
                    }
                }
            }
            ConcurrentPhase::Scan => {
                scavenger.drain_scan_work(args);
                self.phase
                    .store(ConcurrentPhase::Complete, Ordering::Release);
                Ok(ConcurrentPhase::Scan)
            }
            ConcurrentPhase::Complete => {
                let drained = std::mem::take(&mut self.in_flight.lock().0);
                let result = scavenger.complete_scavenge(args, drained);
                self.phase.store(ConcurrentPhase::Idle, Ordering::Release);
                match result {
                    Ok(_) => Ok(ConcurrentPhase::Complete),
                    Err(reason) => Err(reason),
                }
            }
        }
    }
}

impl Default for ConcurrentScavenger {
    fn default() -> Self {
        Self::new()
    }
}
