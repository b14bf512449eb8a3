use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cycle::{CompactPreventedReason, CycleState, GlobalPhase};
use crate::events::{EventBus, GcEvent};
use crate::globals::MIN_REUSABLE_EXTENT;
use crate::header::ObjectHeader;
use crate::mark_map::MarkMap;
use crate::object_model::{ObjectModel, SlotVisitor};
use crate::remembered::RememberedSet;
use crate::scavenger::YoungGeneration;
use crate::task::{Dispatcher, Terminator};
use crate::tenured::{DeadEntry, TenuredSpace};
use crate::GcConfig;

/// Everything the global collector needs from the surrounding heap for
/// one cycle.
pub struct GlobalArgs<'a> {
    pub model: &'a dyn ObjectModel,
    pub tenured: &'a TenuredSpace,
    pub remembered: &'a RememberedSet,
    pub mark_map: &'a MarkMap,
    /// Absent when the heap runs without a young generation.
    pub young: Option<&'a YoungGeneration>,
    pub dispatcher: &'a mut Dispatcher,
    pub roots: &'a mut [Box<dyn FnMut(&mut dyn SlotVisitor) + Send>],
    pub config: &'a GcConfig,
    pub events: &'a EventBus,
    /// Critical-region nesting depth at cycle start. Nonzero pins every
    /// object in place and forbids compaction.
    pub critical_depth: usize,
}

pub struct GlobalOutcome {
    pub objects_marked: usize,
    pub bytes_swept: usize,
    pub bytes_compacted: usize,
    pub compacted: bool,
    pub mark_stack_overflows: usize,
}

pub(crate) struct MarkOutcome {
    pub objects_marked: usize,
    pub overflows: usize,
}

/// The stop-the-world mark-sweep-compact collector for the whole heap.
/// Marking is parallel over work-stealing deques; sweep and compact run
/// on the master thread against the completed mark map.
pub struct GlobalCollector;

impl GlobalCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn collect(&self, args: &mut GlobalArgs<'_>, cycle: &mut CycleState) -> GlobalOutcome {
        cycle.global_phase = GlobalPhase::Mark;
        args.events.emit(GcEvent::MarkStart);
        let mut rescan = vec![(args.tenured.begin(), args.tenured.end())];
        if let Some(young) = args.young {
            rescan.push((young.begin(), young.end()));
        }
        let mark = parallel_mark(
            args.model,
            args.mark_map,
            args.roots,
            &rescan,
            args.dispatcher,
            args.config.mark_stack_capacity,
        );
        args.events.emit(GcEvent::MarkEnd {
            objects_marked: mark.objects_marked,
        });
        logln_if!(
            args.config.verbose && mark.overflows > 0,
            "[gc] mark stack overflowed {} time(s), rescan fixpoint ran",
            mark.overflows
        );

        cycle.global_phase = GlobalPhase::Sweep;
        args.events.emit(GcEvent::SweepStart);
        let bytes_swept = self.sweep(args);
        args.events.emit(GcEvent::SweepEnd { bytes_swept });

        let compact = self.should_compact(args, cycle);
        let bytes_compacted = if compact {
            cycle.global_phase = GlobalPhase::Compact;
            args.events.emit(GcEvent::CompactStart);
            let moved = self.compact(args);
            args.events.emit(GcEvent::CompactEnd {
                bytes_compacted: moved,
            });
            moved
        } else {
            0
        };

        self.rebuild_remembered_set(args);
        cycle.global_phase = GlobalPhase::Idle;

        cycle.stats.objects_marked = mark.objects_marked;
        cycle.stats.bytes_swept = bytes_swept;
        cycle.stats.bytes_compacted = bytes_compacted;
        cycle.stats.mark_stack_overflows = mark.overflows;

        GlobalOutcome {
            objects_marked: mark.objects_marked,
            bytes_swept,
            bytes_compacted,
            compacted: compact,
            mark_stack_overflows: mark.overflows,
        }
    }

    /// Walks the mark map over the tenured range, writes a dead-object
    /// placeholder into every gap and hands the reusable gaps to the pool
    /// as its new free list. Returns the total reclaimed extent.
    fn sweep(&self, args: &mut GlobalArgs<'_>) -> usize {
        let begin = args.tenured.begin();
        let end = args.tenured.end();
        let model = args.model;

        let mut cursor = begin;
        let mut live_bytes = 0usize;
        let mut free_bytes = 0usize;
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        args.mark_map
            .visit_marked_range(begin as _, end as _, |object| {
                let addr = object as usize;
                if addr > cursor {
                    let gap = addr - cursor;
                    unsafe {
                        DeadEntry::write(cursor as *mut u8, gap);
                    }
                    if gap >= MIN_REUSABLE_EXTENT {
                        ranges.push((cursor, gap));
                    }
                    free_bytes += gap;
                }
                let size = model.size_of(object);
                live_bytes += size;
                cursor = addr + size;
            });
        if cursor < end {
            let gap = end - cursor;
            unsafe {
                DeadEntry::write(cursor as *mut u8, gap);
            }
            if gap >= MIN_REUSABLE_EXTENT {
                ranges.push((cursor, gap));
            }
            free_bytes += gap;
        }

        args.tenured.rebuild_free_list(&ranges, live_bytes);
        free_bytes
    }

    fn should_compact(&self, args: &mut GlobalArgs<'_>, cycle: &mut CycleState) -> bool {
        if args.critical_depth > 0 {
            cycle.compact_prevented = Some(CompactPreventedReason::CriticalRegionPin);
            return false;
        }
        if cycle.compact_forced {
            return true;
        }
        let free = args.tenured.free_bytes();
        let size = args.tenured.size();
        let largest = args.tenured.largest_free_extent();
        if cycle.requested_bytes > 0 && largest < cycle.requested_bytes {
            return true;
        }
        if (free as f64) < args.config.desperate_free_ratio * size as f64 {
            return true;
        }
        let scattered = free.saturating_sub(largest);
        if free > 0 && scattered as f64 / free as f64 > args.config.compact_fragmentation_ratio {
            return true;
        }
        cycle.compact_prevented = Some(CompactPreventedReason::NotRequired);
        false
    }

    /// Slides every live tenured object towards the low end, in address
    /// order. Runs on the master thread with a valid mark map; afterwards
    /// the map's positions are stale and its validity flag is cleared.
    fn compact(&self, args: &mut GlobalArgs<'_>) -> usize {
        struct Relocation {
            src: usize,
            dest: usize,
            size: usize,
        }

        let begin = args.tenured.begin();
        let end = args.tenured.end();
        let model = args.model;

        let mut relocations: Vec<Relocation> = Vec::new();
        let mut dest = begin;
        args.mark_map
            .visit_marked_range(begin as _, end as _, |object| {
                let size = model.size_of(object);
                relocations.push(Relocation {
                    src: object as usize,
                    dest,
                    size,
                });
                dest += size;
            });

        // Slot fixup precedes the moves: values are rewritten through a
        // src-ordered table lookup, so no forwarding state ever touches
        // the object headers.
        let mut fixup = |slot: *mut *mut ObjectHeader| unsafe {
            let value = *slot;
            if value.is_null() {
                return;
            }
            let addr = value as usize;
            if addr < begin || addr >= end {
                return;
            }
            if let Ok(i) = relocations.binary_search_by_key(&addr, |r| r.src) {
                *slot = relocations[i].dest as *mut ObjectHeader;
            }
        };
        for constraint in args.roots.iter_mut() {
            constraint(&mut fixup);
        }
        for i in 0..relocations.len() {
            let src = relocations[i].src as *mut ObjectHeader;
            model.scan(src, &mut fixup);
        }
        if let Some(young) = args.young {
            args.mark_map
                .visit_marked_range(young.begin() as _, young.end() as _, |object| {
                    model.scan(object, &mut fixup);
                });
        }

        let mut moved = 0usize;
        let mut live_bytes = 0usize;
        unsafe {
            for relocation in relocations.iter() {
                live_bytes += relocation.size;
                if relocation.dest != relocation.src {
                    // Slides overlap; copy handles that.
                    std::ptr::copy(
                        relocation.src as *const u8,
                        relocation.dest as *mut u8,
                        relocation.size,
                    );
                    moved += relocation.size;
                }
            }
            let free_begin = begin + live_bytes;
            if free_begin < end {
                DeadEntry::write(free_begin as *mut u8, end - free_begin);
                args.tenured
                    .rebuild_free_list(&[(free_begin, end - free_begin)], live_bytes);
            } else {
                args.tenured.rebuild_free_list(&[], live_bytes);
            }
        }

        args.mark_map.set_valid(false);
        moved
    }

    /// Repopulates the remembered set exactly by scanning every live
    /// tenured object. This is the authoritative recovery from overflow;
    /// it also clears the overflow flag.
    fn rebuild_remembered_set(&self, args: &mut GlobalArgs<'_>) {
        let young = match args.young {
            Some(young) => young,
            None => return,
        };
        let model = args.model;
        let remembered = args.remembered;
        remembered.reset_for_rebuild();
        args.tenured.walk(model, |object| {
            unsafe {
                (*object).clear_remembered();
            }
            let mut holds_young = false;
            model.scan(object, &mut |slot: *mut *mut ObjectHeader| {
                let value = unsafe { *slot };
                if !value.is_null() && young.contains(value.cast()) {
                    holds_young = true;
                }
            });
            if holds_young {
                remembered.remember_unbatched(object);
            }
        });
    }

    /// Makes the tenured space walkable without sweeping: every gap
    /// between marked objects gets a dead-object placeholder, the free
    /// list is left alone. Requires a valid mark map.
    pub fn fix_heap_for_walk(
        &self,
        model: &dyn ObjectModel,
        tenured: &TenuredSpace,
        mark_map: &MarkMap,
    ) {
        assert!(mark_map.is_valid(), "mark map positions are stale");
        let begin = tenured.begin();
        let end = tenured.end();

        let mut cursor = begin;
        mark_map
            .visit_marked_range(begin as _, end as _, |object| {
                let addr = object as usize;
                if addr > cursor {
                    unsafe {
                        DeadEntry::write(cursor as *mut u8, addr - cursor);
                    }
                }
                cursor = addr + model.size_of(object);
            });
        if cursor < end {
            unsafe {
                DeadEntry::write(cursor as *mut u8, end - cursor);
            }
        }
    }
}

impl Default for GlobalCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Parallel marking over work-stealing deques. The shared stack is
/// bounded: a push past `capacity` sets the overflow flag instead, and a
/// mark-map rescan fixpoint completes the closure afterwards. Shared by
/// the mark-sweep-compact and segregated collectors.
pub(crate) fn parallel_mark(
    model: &dyn ObjectModel,
    mark_map: &MarkMap,
    roots: &mut [Box<dyn FnMut(&mut dyn SlotVisitor) + Send>],
    rescan_ranges: &[(usize, usize)],
    dispatcher: &mut Dispatcher,
    capacity: usize,
) -> MarkOutcome {
    mark_map.set_valid(false);
    mark_map.clear_all();

    let n_workers = dispatcher.workers();
    let injector: Injector<usize> = Injector::new();
    let depth = AtomicUsize::new(0);
    let overflowed = AtomicBool::new(false);
    let overflow_events = AtomicUsize::new(0);
    let marked = AtomicUsize::new(0);

    {
        let mut root_visitor = |slot: *mut *mut ObjectHeader| {
            let object = unsafe { *slot };
            mark_and_push(
                object,
                mark_map,
                &marked,
                &depth,
                capacity,
                &overflowed,
                &overflow_events,
                |addr| injector.push(addr),
            );
        };
        for constraint in roots.iter_mut() {
            constraint(&mut root_visitor);
        }
    }

    let mut workers = Vec::with_capacity(n_workers);
    let mut stealers = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        let w: Worker<usize> = Worker::new_lifo();
        stealers.push(w.stealer());
        workers.push(w);
    }
    let terminator = Terminator::new(n_workers);

    dispatcher.scoped(|scoped| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let terminator = &terminator;
            let depth = &depth;
            let overflowed = &overflowed;
            let overflow_events = &overflow_events;
            let marked = &marked;
            scoped.execute(move || {
                let mut marker = MarkWorker {
                    task_id,
                    worker,
                    injector,
                    stealers,
                    terminator,
                    model,
                    mark_map,
                    depth,
                    capacity,
                    overflowed,
                    overflow_events,
                    marked,
                };
                marker.run();
            });
        }
    });

    // Overflow recovery: objects already carry their mark bit, only the
    // scan was dropped. Rescanning every marked object until no new bit
    // appears completes the closure with zero stack space.
    if overflowed.load(Ordering::Acquire) {
        loop {
            let mut progress = false;
            for &(begin, end) in rescan_ranges {
                mark_map.visit_marked_range(begin as _, end as _, |object| {
                    model.scan(object, &mut |slot: *mut *mut ObjectHeader| {
                        let child = unsafe { *slot };
                        if child.is_null() || !mark_map.has_address(child.cast()) {
                            return;
                        }
                        if !mark_map.atomic_test_and_set(child.cast()) {
                            marked.fetch_add(1, Ordering::Relaxed);
                            progress = true;
                        }
                    });
                });
            }
            if !progress {
                break;
            }
        }
    }

    mark_map.set_valid(true);
    MarkOutcome {
        objects_marked: marked.load(Ordering::Relaxed),
        overflows: overflow_events.load(Ordering::Relaxed),
    }
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn mark_and_push(
    object: *mut ObjectHeader,
    mark_map: &MarkMap,
    marked: &AtomicUsize,
    depth: &AtomicUsize,
    capacity: usize,
    overflowed: &AtomicBool,
    overflow_events: &AtomicUsize,
    push: impl FnOnce(usize),
) {
    if object.is_null() || !mark_map.has_address(object.cast()) {
        return;
    }
    if mark_map.atomic_test_and_set(object.cast()) {
        return;
    }
    marked.fetch_add(1, Ordering::Relaxed);
    if depth.load(Ordering::Relaxed) >= capacity {
        // The bit stays set; the rescan fixpoint picks the scan up.
        overflowed.store(true, Ordering::Release);
        overflow_events.fetch_add(1, Ordering::Relaxed);
        return;
    }
    depth.fetch_add(1, Ordering::Relaxed);
    push(object as usize);
}

struct MarkWorker<'a> {
    task_id: usize,
    worker: Worker<usize>,
    injector: &'a Injector<usize>,
    stealers: &'a [Stealer<usize>],
    terminator: &'a Terminator,
    model: &'a dyn ObjectModel,
    mark_map: &'a MarkMap,
    depth: &'a AtomicUsize,
    capacity: usize,
    overflowed: &'a AtomicBool,
    overflow_events: &'a AtomicUsize,
    marked: &'a AtomicUsize,
}

impl MarkWorker<'_> {
    fn run(&mut self) {
        loop {
            while let Some(addr) = self.pop() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                self.scan_object(addr as *mut ObjectHeader);
            }
            if self.terminator.try_terminate() {
                break;
            }
        }
    }

    fn scan_object(&mut self, object: *mut ObjectHeader) {
        let worker = &self.worker;
        let mut visitor = |slot: *mut *mut ObjectHeader| {
            let child = unsafe { *slot };
            mark_and_push(
                child,
                self.mark_map,
                self.marked,
                self.depth,
                self.capacity,
                self.overflowed,
                self.overflow_events,
                |addr| worker.push(addr),
            );
        };
        self.model.scan(object, &mut visitor);
    }

    fn pop(&mut self) -> Option<usize> {
        self.pop_worker()
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_worker(&mut self) -> Option<usize> {
        self.worker.pop()
    }

    fn pop_global(&mut self) -> Option<usize> {
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }
        None
    }

    fn steal(&self) -> Option<usize> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;
            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            loop {
                match self.stealers[stealer_id].steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(address) => return Some(address),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}
