use parking_lot::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cycle::{CycleState, GlobalPhase};
use crate::events::{EventBus, GcEvent};
use crate::global_collector::parallel_mark;
use crate::mark_map::MarkMap;
use crate::object_model::{ObjectModel, SlotVisitor};
use crate::task::Dispatcher;
use crate::GcConfig;

/// Cell sizes served by the segregated space, granule multiples in a
/// roughly geometric progression. Requests above the largest class are
/// not served; embedders with pinned large objects split them.
pub const SIZE_CLASSES: [usize; 15] = [
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 2048, 4096, 8192,
];

const REGION_SIZE: usize = 64 * 1024;

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&c| c >= size)
}

#[derive(Clone, Copy)]
struct SegregatedRegion {
    begin: usize,
    /// Cell size this region is carved into; zero while unassigned.
    cell_size: usize,
    /// High-water mark of carved cells. Memory above this inside the
    /// region has never held an object.
    carved_end: usize,
}

struct ClassAlloc {
    free_cells: Vec<usize>,
    /// Region currently being carved for this class, if any.
    current: Option<usize>,
}

/// Alternative global space for heaps whose objects may never move:
/// fixed-size regions assigned to size classes on demand, cells carved
/// sequentially and recycled through per-class free lists. Reclamation
/// is mark-sweep only; there is no compaction and no young generation.
pub struct SegregatedSpace {
    begin: usize,
    end: usize,
    regions: Mutex<Vec<SegregatedRegion>>,
    classes: Vec<Mutex<ClassAlloc>>,
    unassigned: Mutex<Vec<usize>>,
    bytes_in_use: AtomicUsize,
}

impl SegregatedSpace {
    pub fn new(begin: *mut u8, size: usize) -> Self {
        let begin = begin as usize;
        let region_count = size / REGION_SIZE;
        assert!(region_count > 0, "segregated space smaller than one region");
        let regions = (0..region_count)
            .map(|i| SegregatedRegion {
                begin: begin + i * REGION_SIZE,
                cell_size: 0,
                carved_end: begin + i * REGION_SIZE,
            })
            .collect();
        Self {
            begin,
            end: begin + region_count * REGION_SIZE,
            regions: Mutex::new(regions),
            classes: SIZE_CLASSES
                .iter()
                .map(|_| {
                    Mutex::new(ClassAlloc {
                        free_cells: Vec::new(),
                        current: None,
                    })
                })
                .collect(),
            unassigned: Mutex::new((0..region_count).rev().collect()),
            bytes_in_use: AtomicUsize::new(0),
        }
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn contains(&self, addr: *const u8) -> bool {
        (addr as usize) >= self.begin && (addr as usize) < self.end
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    /// Allocates one cell of the class covering `size`. Null when the
    /// request is larger than every class or the space is exhausted.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let class = match class_index(size) {
            Some(class) => class,
            None => return null_mut(),
        };
        let cell_size = SIZE_CLASSES[class];
        let mut alloc = self.classes[class].lock();
        if let Some(cell) = alloc.free_cells.pop() {
            self.bytes_in_use.fetch_add(cell_size, Ordering::Relaxed);
            return cell as *mut u8;
        }
        if let Some((cell, _)) = self.carve(&mut alloc, class, 1) {
            self.bytes_in_use.fetch_add(cell_size, Ordering::Relaxed);
            return cell as *mut u8;
        }
        null_mut()
    }

    /// Allocates up to `count` contiguous cells of the class covering
    /// `size`, returning the run base and the number actually carved.
    /// Contiguity lets the caller mark the whole batch through one
    /// bulk mark-map update.
    pub fn alloc_batch(&self, size: usize, count: usize) -> Option<(*mut u8, usize)> {
        let class = class_index(size)?;
        let cell_size = SIZE_CLASSES[class];
        let mut alloc = self.classes[class].lock();
        let (base, carved) = self.carve(&mut alloc, class, count)?;
        self.bytes_in_use
            .fetch_add(carved * cell_size, Ordering::Relaxed);
        Some((base as *mut u8, carved))
    }

    /// Marks a contiguous cell batch in one bulk bitmap update.
    pub fn mark_batch(&self, mark_map: &MarkMap, base: *const u8, size: usize, count: usize) {
        let cell_size = SIZE_CLASSES[class_index(size).expect("oversized cell")];
        let end = unsafe { base.add(cell_size * count) };
        mark_map.set_range_atomic(base, end);
    }

    /// Carves up to `wanted` contiguous cells from the class's current
    /// region, assigning a fresh region when the current one is
    /// exhausted. Returns the run base and the cell count that fit.
    fn carve(&self, alloc: &mut ClassAlloc, class: usize, wanted: usize) -> Option<(usize, usize)> {
        let cell_size = SIZE_CLASSES[class];
        loop {
            if let Some(index) = alloc.current {
                let mut regions = self.regions.lock();
                let region = &mut regions[index];
                let region_end = region.begin + REGION_SIZE;
                let room = (region_end - region.carved_end) / cell_size;
                if room > 0 {
                    let take = wanted.min(room);
                    let base = region.carved_end;
                    region.carved_end += take * cell_size;
                    return Some((base, take));
                }
                alloc.current = None;
            }
            let index = self.unassigned.lock().pop()?;
            let mut regions = self.regions.lock();
            regions[index].cell_size = cell_size;
            regions[index].carved_end = regions[index].begin;
            alloc.current = Some(index);
        }
    }

    /// Rebuilds every class free list from the mark map: carved cells
    /// without a mark bit become free, regions with no survivors at all
    /// go back to the unassigned pool. Regions are swept in parallel.
    /// Returns the reclaimed byte count.
    pub fn sweep(&self, mark_map: &MarkMap, dispatcher: &mut Dispatcher) -> usize {
        struct RegionSweep {
            index: usize,
            cell_size: usize,
            free_cells: Vec<usize>,
            live_cells: usize,
        }

        let snapshot: Vec<SegregatedRegion> = self.regions.lock().clone();
        let cursor = AtomicUsize::new(0);
        let results: Mutex<Vec<RegionSweep>> = Mutex::new(Vec::new());

        dispatcher.dispatch(|_worker_id| {
            let mut local: Vec<RegionSweep> = Vec::new();
            loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                if index >= snapshot.len() {
                    break;
                }
                let region = &snapshot[index];
                if region.cell_size == 0 {
                    continue;
                }
                let mut sweep = RegionSweep {
                    index,
                    cell_size: region.cell_size,
                    free_cells: Vec::new(),
                    live_cells: 0,
                };
                let mut cell = region.begin;
                while cell < region.carved_end {
                    if mark_map.test(cell as *const u8) {
                        sweep.live_cells += 1;
                    } else {
                        sweep.free_cells.push(cell);
                    }
                    cell += region.cell_size;
                }
                local.push(sweep);
            }
            results.lock().append(&mut local);
        });

        // Master applies the results: free lists are rebuilt wholesale,
        // fully dead regions get recycled. Class locks come before the
        // region locks, the same order carve uses; the two groups are
        // never held together.
        let mut freed = 0usize;
        let mut in_use = 0usize;
        let mut recycled: Vec<usize> = Vec::new();
        let mut per_class: Vec<Vec<usize>> = SIZE_CLASSES.iter().map(|_| Vec::new()).collect();
        for sweep in results.into_inner() {
            freed += sweep.free_cells.len() * sweep.cell_size;
            if sweep.live_cells == 0 {
                recycled.push(sweep.index);
                continue;
            }
            in_use += sweep.live_cells * sweep.cell_size;
            per_class[class_index(sweep.cell_size).unwrap()].extend_from_slice(&sweep.free_cells);
        }
        for (class, free_cells) in per_class.into_iter().enumerate() {
            let mut alloc = self.classes[class].lock();
            alloc.free_cells = free_cells;
            // A recycled region may still be some class's current
            // carving target; detach it.
            if let Some(current) = alloc.current {
                if recycled.contains(&current) {
                    alloc.current = None;
                }
            }
        }
        let mut regions = self.regions.lock();
        let mut unassigned = self.unassigned.lock();
        for &index in recycled.iter() {
            let region = &mut regions[index];
            region.cell_size = 0;
            region.carved_end = region.begin;
            unassigned.push(index);
        }
        self.bytes_in_use.store(in_use, Ordering::Relaxed);
        freed
    }
}

pub struct SegregatedArgs<'a> {
    pub model: &'a dyn ObjectModel,
    pub space: &'a SegregatedSpace,
    pub mark_map: &'a MarkMap,
    pub dispatcher: &'a mut Dispatcher,
    pub roots: &'a mut [Box<dyn FnMut(&mut dyn SlotVisitor) + Send>],
    pub config: &'a GcConfig,
    pub events: &'a EventBus,
}

pub struct SegregatedOutcome {
    pub objects_marked: usize,
    pub bytes_swept: usize,
    pub mark_stack_overflows: usize,
}

/// Mark-sweep collector over a [`SegregatedSpace`]. Marking is the same
/// parallel tracing the moving collector uses; sweep rebuilds cell free
/// lists instead of a free-entry chain, and nothing ever moves.
pub struct SegregatedCollector;

impl SegregatedCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn collect(
        &self,
        args: &mut SegregatedArgs<'_>,
        cycle: &mut CycleState,
    ) -> SegregatedOutcome {
        cycle.global_phase = GlobalPhase::Mark;
        args.events.emit(GcEvent::MarkStart);
        let rescan = [(args.space.begin(), args.space.end())];
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

        cycle.global_phase = GlobalPhase::Sweep;
        args.events.emit(GcEvent::SweepStart);
        let bytes_swept = args.space.sweep(args.mark_map, args.dispatcher);
        args.events.emit(GcEvent::SweepEnd { bytes_swept });
        logln_if!(
            args.config.verbose,
            "[gc] segregated collection: {} marked, {} reclaimed",
            mark.objects_marked,
            crate::utils::formatted_size(bytes_swept)
        );
        cycle.global_phase = GlobalPhase::Idle;

        cycle.stats.objects_marked = mark.objects_marked;
        cycle.stats.bytes_swept = bytes_swept;
        cycle.stats.mark_stack_overflows = mark.overflows;

        SegregatedOutcome {
            objects_marked: mark.objects_marked,
            bytes_swept,
            mark_stack_overflows: mark.overflows,
        }
    }
}

impl Default for SegregatedCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapMut;

    #[test]
    fn size_class_lookup_rounds_up() {
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(16), Some(0));
        assert_eq!(class_index(17), Some(1));
        assert_eq!(class_index(8192), Some(SIZE_CLASSES.len() - 1));
        assert_eq!(class_index(8193), None);
    }

    #[test]
    fn cells_of_one_class_come_from_one_region() {
        let backing = MmapMut::map_anon(4 * REGION_SIZE).unwrap();
        let space = SegregatedSpace::new(backing.as_ptr() as *mut u8, 4 * REGION_SIZE);

        let a = space.alloc(48);
        let b = space.alloc(40);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(b as usize - a as usize, 48, "same class carves adjacent cells");
        assert_eq!(space.bytes_in_use(), 96);

        // A different class carves from a different region.
        let c = space.alloc(500);
        assert!(!c.is_null());
        assert!((c as usize - a as usize) >= REGION_SIZE);
    }

    #[test]
    fn batch_is_contiguous_and_bulk_markable() {
        let backing = MmapMut::map_anon(2 * REGION_SIZE).unwrap();
        let space = SegregatedSpace::new(backing.as_ptr() as *mut u8, 2 * REGION_SIZE);
        let map = MarkMap::new(backing.as_ptr() as *mut u8, 2 * REGION_SIZE);

        let (base, carved) = space.alloc_batch(64, 8).unwrap();
        assert_eq!(carved, 8);
        space.mark_batch(&map, base, 64, carved);
        for i in 0..carved {
            assert!(map.test(unsafe { base.add(i * 64) }));
        }
        assert!(!map.test(unsafe { base.add(carved * 64) }));
    }

    #[test]
    fn sweep_frees_unmarked_cells_and_recycles_dead_regions() {
        let backing = MmapMut::map_anon(4 * REGION_SIZE).unwrap();
        let space = SegregatedSpace::new(backing.as_ptr() as *mut u8, 4 * REGION_SIZE);
        let map = MarkMap::new(backing.as_ptr() as *mut u8, 4 * REGION_SIZE);
        let mut dispatcher = Dispatcher::new(2);

        let live = space.alloc(128);
        let dead = space.alloc(128);
        let doomed_class = space.alloc(1024);
        assert!(!live.is_null() && !dead.is_null() && !doomed_class.is_null());

        map.atomic_test_and_set(live);
        let freed = space.sweep(&map, &mut dispatcher);
        assert_eq!(freed, 128 + 1024);
        assert_eq!(space.bytes_in_use(), 128);

        // The freed sibling cell is reused before any new carving.
        let again = space.alloc(128);
        assert_eq!(again, dead);
    }
}
