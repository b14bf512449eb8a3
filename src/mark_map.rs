use atomic::{Atomic, Ordering};
use memmap2::MmapMut;
use std::mem::size_of;
use std::sync::atomic::AtomicBool;

use crate::globals::GRANULE;
use crate::header::ObjectHeader;

const BITS_PER_WORD: usize = size_of::<usize>() * 8;

/// One bit per granule over the maximum configured heap footprint.
///
/// Bits are set atomically because sibling bits in the same word are set
/// concurrently by different workers. Positional validity is a separate
/// flag: after compaction the bits are stale but not yet cleared, and the
/// flag is the only thing that says so. The flag is toggled only by the
/// master thread outside parallel phases.
pub struct MarkMap {
    // Owns the bitmap pages; accessed only through `bitmap_begin`.
    _mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    valid: AtomicBool,
}

unsafe impl Send for MarkMap {}
unsafe impl Sync for MarkMap {}

impl MarkMap {
    pub fn new(heap_begin: *mut u8, heap_capacity: usize) -> Self {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mem_map = MmapMut::map_anon(bitmap_size).expect("mark map reservation failed");
        let bitmap_begin = mem_map.as_ptr() as *mut u8;
        Self {
            bitmap_begin: bitmap_begin.cast(),
            bitmap_size,
            _mem_map: mem_map,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
            valid: AtomicBool::new(false),
        }
    }

    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = GRANULE * BITS_PER_WORD;
        crate::utils::align_up(capacity, bytes_covered_per_word) / bytes_covered_per_word
            * size_of::<usize>()
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        (obj as usize) >= self.heap_begin && (obj as usize) < self.heap_limit
    }

    /// Whether bit positions currently describe live objects. Cleared by
    /// compaction, re-established by the next mark phase.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, std::sync::atomic::Ordering::Release);
    }

    #[inline]
    fn offset_to_index(offset: usize) -> usize {
        offset / GRANULE / BITS_PER_WORD
    }

    #[inline]
    fn index_to_offset(index: usize) -> usize {
        index * GRANULE * BITS_PER_WORD
    }

    #[inline]
    fn offset_bit_index(offset: usize) -> usize {
        (offset / GRANULE) % BITS_PER_WORD
    }

    #[inline]
    fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(index < self.bitmap_size / size_of::<usize>());
        unsafe { &*self.bitmap_begin.add(index) }
    }

    /// Atomically sets the bit for `obj`; returns true if it was already
    /// set. The single CAS loop is the serialization point for concurrent
    /// marking of siblings within one word.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(addr >= self.heap_begin);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let atomic_entry = self.word(index);

        let mut old_word;
        while {
            old_word = atomic_entry.load(Ordering::Relaxed);
            if (old_word & mask) != 0 {
                return true;
            }
            atomic_entry
                .compare_exchange_weak(
                    old_word,
                    old_word | mask,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
        } {}

        false
    }

    #[inline]
    pub fn test(&self, obj: *const u8) -> bool {
        let addr = obj as usize;
        debug_assert!(self.has_address(obj), "invalid object address {:p}", obj);
        let offset = addr.wrapping_sub(self.heap_begin);
        (self.word(Self::offset_to_index(offset)).load(Ordering::Relaxed)
            & Self::offset_to_mask(offset))
            != 0
    }

    #[inline]
    pub fn clear(&self, obj: *const u8) {
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        let mask = Self::offset_to_mask(offset);
        self.word(Self::offset_to_index(offset))
            .fetch_and(!mask, Ordering::Relaxed);
    }

    /// Bulk-sets the bits covering `begin..end` with whole-word atomic
    /// OR operations. Used by the segregated collector to mark a
    /// contiguous cell run from one allocation batch in one go.
    pub fn set_range_atomic(&self, begin: *const u8, end: *const u8) {
        let mut offset = (begin as usize).wrapping_sub(self.heap_begin);
        let end_offset = (end as usize).wrapping_sub(self.heap_begin);
        debug_assert!(offset <= end_offset && end as usize <= self.heap_limit);

        while offset < end_offset {
            let index = Self::offset_to_index(offset);
            let bit = Self::offset_bit_index(offset);
            let word_end_offset = Self::index_to_offset(index + 1);
            let run_end = end_offset.min(word_end_offset);
            let bit_count = (run_end - offset) / GRANULE;

            let mask = if bit_count == BITS_PER_WORD {
                usize::MAX
            } else {
                ((1usize << bit_count) - 1) << bit
            };
            self.word(index).fetch_or(mask, Ordering::Relaxed);
            offset = run_end;
        }
    }

    pub fn clear_range(&self, begin: *const u8, end: *const u8) {
        let mut offset = (begin as usize).wrapping_sub(self.heap_begin);
        let end_offset = (end as usize).wrapping_sub(self.heap_begin);

        while offset < end_offset {
            let index = Self::offset_to_index(offset);
            let bit = Self::offset_bit_index(offset);
            let word_end_offset = Self::index_to_offset(index + 1);
            let run_end = end_offset.min(word_end_offset);
            let bit_count = (run_end - offset) / GRANULE;

            let mask = if bit_count == BITS_PER_WORD {
                usize::MAX
            } else {
                ((1usize << bit_count) - 1) << bit
            };
            self.word(index).fetch_and(!mask, Ordering::Relaxed);
            offset = run_end;
        }
    }

    pub fn clear_all(&self) {
        let words = self.bitmap_size / size_of::<usize>();
        for i in 0..words {
            self.word(i).store(0, Ordering::Relaxed);
        }
    }

    /// Visits every marked granule in `visit_begin..visit_end` in address
    /// order. Loads each word once, so bits may be changed concurrently
    /// while visiting.
    pub fn visit_marked_range(
        &self,
        visit_begin: *const u8,
        visit_end: *const u8,
        mut visitor: impl FnMut(*mut ObjectHeader),
    ) {
        let offset_start = (visit_begin as usize).wrapping_sub(self.heap_begin);
        let offset_end = (visit_end as usize).wrapping_sub(self.heap_begin);
        if offset_start >= offset_end {
            return;
        }

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end.saturating_sub(1)) + 1;
        let bit_start = Self::offset_bit_index(offset_start);

        for index in index_start..index_end {
            let mut w = self.word(index).load(Ordering::Relaxed);
            if index == index_start {
                w &= !((1usize << bit_start) - 1);
            }
            let ptr_base = Self::index_to_offset(index) + self.heap_begin;
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                let addr = ptr_base + shift * GRANULE;
                if addr >= visit_end as usize {
                    return;
                }
                visitor(addr as *mut ObjectHeader);
                w &= w - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_over(capacity: usize) -> (MmapMut, MarkMap) {
        let heap = MmapMut::map_anon(capacity).unwrap();
        let begin = heap.as_ptr() as *mut u8;
        (heap, MarkMap::new(begin, capacity))
    }

    #[test]
    fn test_and_set_is_idempotent() {
        let (heap, map) = map_over(64 * 1024);
        let obj = unsafe { heap.as_ptr().add(5 * GRANULE) };
        assert!(!map.atomic_test_and_set(obj));
        assert!(map.atomic_test_and_set(obj));
        assert!(map.test(obj));
        map.clear(obj);
        assert!(!map.test(obj));
    }

    #[test]
    fn range_set_matches_individual_bits() {
        let (heap, map) = map_over(64 * 1024);
        let begin = unsafe { heap.as_ptr().add(3 * GRANULE) };
        // Spans multiple bitmap words.
        let end = unsafe { begin.add(200 * GRANULE) };
        map.set_range_atomic(begin, end);

        let mut scan = begin;
        while scan < end {
            assert!(map.test(scan));
            scan = unsafe { scan.add(GRANULE) };
        }
        assert!(!map.test(unsafe { heap.as_ptr().add(2 * GRANULE) }));
        assert!(!map.test(end));

        map.clear_range(begin, end);
        let mut scan = begin;
        while scan < end {
            assert!(!map.test(scan));
            scan = unsafe { scan.add(GRANULE) };
        }
    }

    #[test]
    fn marked_range_walk_is_ordered_and_exact() {
        let (heap, map) = map_over(64 * 1024);
        let base = heap.as_ptr() as usize;
        let offsets = [0usize, 7, 64, 65, 130, 1000];
        for &o in &offsets {
            map.atomic_test_and_set((base + o * GRANULE) as _);
        }

        let mut seen = vec![];
        map.visit_marked_range(base as _, (base + 64 * 1024) as _, |obj| {
            seen.push((obj as usize - base) / GRANULE)
        });
        assert_eq!(seen, offsets);
    }

    #[test]
    fn validity_flag_is_independent_of_bits() {
        let (heap, map) = map_over(16 * 1024);
        assert!(!map.is_valid());
        map.atomic_test_and_set(heap.as_ptr());
        map.set_valid(true);
        assert!(map.is_valid());
        map.set_valid(false);
        // Bits survive invalidation; only the flag changed.
        assert!(map.test(heap.as_ptr()));
    }
}
