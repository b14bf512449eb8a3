use parking_lot::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::globals::{GRANULE, MIN_REUSABLE_EXTENT};
use crate::header::ObjectHeader;
use crate::object_model::ObjectModel;

// Dead-object placeholders make every gap in the tenured space
// self-describing so heap walkers never read unrecoverable garbage. The
// tag occupies the two low header bits; a forwarding pointer is granule
// aligned and can only carry tag 0b01, a live header only 0b00/0b10, so
// 0b11 is unambiguous.
pub const DEAD_ENTRY_TAG: usize = 0b11;

#[repr(C)]
pub struct DeadEntry {
    word: usize,
    next: *mut DeadEntry,
}

impl DeadEntry {
    /// Writes a placeholder of `size` bytes at `at`. `size` must be at
    /// least one granule.
    pub unsafe fn write(at: *mut u8, size: usize) -> *mut DeadEntry {
        debug_assert!(size >= GRANULE && crate::utils::is_aligned(size, GRANULE));
        let entry = at.cast::<DeadEntry>();
        (*entry).word = (size / GRANULE) << 2 | DEAD_ENTRY_TAG;
        (*entry).next = null_mut();
        entry
    }

    #[inline]
    pub fn is_dead(word: usize) -> bool {
        word & 0b11 == DEAD_ENTRY_TAG
    }

    #[inline]
    pub fn size(&self) -> usize {
        (self.word >> 2) * GRANULE
    }

    #[inline]
    pub fn next(&self) -> *mut DeadEntry {
        self.next
    }
}

struct FreeListInner {
    head: *mut DeadEntry,
    free_bytes: usize,
    largest_extent: usize,
}

unsafe impl Send for FreeListInner {}

/// The tenured space: one contiguous pool with a free list of dead
/// entries. Sweep rebuilds the list in address order; interim releases
/// and expansion push at the head, so between sweeps the order is only
/// approximate. Grown and shrunk in place through the resize interface.
pub struct TenuredSpace {
    begin: usize,
    end: AtomicUsize,
    capacity_end: usize,
    free: Mutex<FreeListInner>,
    bytes_in_use: AtomicUsize,
}

impl TenuredSpace {
    pub fn new(begin: *mut u8, size: usize, capacity: usize) -> Self {
        assert!(size <= capacity);
        let this = Self {
            begin: begin as usize,
            end: AtomicUsize::new(begin as usize + size),
            capacity_end: begin as usize + capacity,
            free: Mutex::new(FreeListInner {
                head: null_mut(),
                free_bytes: 0,
                largest_extent: 0,
            }),
            bytes_in_use: AtomicUsize::new(0),
        };
        unsafe {
            let mut inner = this.free.lock();
            let entry = DeadEntry::write(begin, size);
            inner.head = entry;
            inner.free_bytes = size;
            inner.largest_extent = size;
        }
        this
    }

    #[inline]
    pub fn begin(&self) -> usize {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end.load(Ordering::Acquire)
    }

    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        (addr as usize) >= self.begin && (addr as usize) < self.end()
    }

    pub fn size(&self) -> usize {
        self.end() - self.begin
    }

    pub fn free_bytes(&self) -> usize {
        self.free.lock().free_bytes
    }

    pub fn largest_free_extent(&self) -> usize {
        self.free.lock().largest_extent
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    /// First-fit allocation from the free list. The remainder of a carved
    /// entry stays linked when reusable, otherwise it becomes unlinked
    /// dark matter that sweep will reclaim.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        debug_assert!(crate::utils::is_aligned(size, GRANULE));
        let mut inner = self.free.lock();
        unsafe {
            let mut prev: *mut DeadEntry = null_mut();
            let mut entry = inner.head;
            while !entry.is_null() {
                let extent = (*entry).size();
                if extent >= size {
                    let remainder = extent - size;
                    let result = entry.cast::<u8>();
                    let replacement = if remainder >= MIN_REUSABLE_EXTENT {
                        let tail = DeadEntry::write(result.add(size), remainder);
                        (*tail).next = (*entry).next;
                        tail
                    } else if remainder > 0 {
                        // Too small to reuse; keep it walkable.
                        DeadEntry::write(result.add(size), remainder);
                        (*entry).next
                    } else {
                        (*entry).next
                    };
                    if prev.is_null() {
                        inner.head = replacement;
                    } else {
                        (*prev).next = replacement;
                    }
                    inner.free_bytes -= extent;
                    if remainder >= MIN_REUSABLE_EXTENT {
                        inner.free_bytes += remainder;
                    }
                    self.recompute_largest(&mut inner);
                    self.bytes_in_use.fetch_add(size, Ordering::Relaxed);
                    return result;
                }
                prev = entry;
                entry = (*entry).next;
            }
        }
        null_mut()
    }

    /// Carves a chunk of `min..=preferred` bytes for a copy-scan cache.
    pub fn alloc_chunk(&self, min: usize, preferred: usize) -> Option<(*mut u8, usize)> {
        let mut take = preferred;
        loop {
            let mem = self.alloc(take);
            if !mem.is_null() {
                return Some((mem, take));
            }
            if take == min {
                return None;
            }
            take = (take / 2).max(min);
        }
    }

    /// Returns the unused tail of a copy cache to the pool.
    pub fn release_range(&self, begin: *mut u8, size: usize) {
        if size == 0 {
            return;
        }
        unsafe {
            let entry = DeadEntry::write(begin, size);
            let mut inner = self.free.lock();
            (*entry).next = inner.head;
            inner.head = entry;
            inner.free_bytes += size;
            inner.largest_extent = inner.largest_extent.max(size);
        }
        self.bytes_in_use.fetch_sub(size, Ordering::Relaxed);
    }

    fn recompute_largest(&self, inner: &mut FreeListInner) {
        let mut largest = 0;
        let mut entry = inner.head;
        unsafe {
            while !entry.is_null() {
                largest = largest.max((*entry).size());
                entry = (*entry).next;
            }
        }
        inner.largest_extent = largest;
    }

    /// Replaces the free list wholesale; used by sweep after it has
    /// walked the mark map and written dead entries into every gap.
    /// `ranges` must be address ordered.
    pub fn rebuild_free_list(&self, ranges: &[(usize, usize)], live_bytes: usize) {
        let mut inner = self.free.lock();
        inner.head = null_mut();
        inner.free_bytes = 0;
        inner.largest_extent = 0;
        unsafe {
            let mut tail: *mut DeadEntry = null_mut();
            for &(begin, size) in ranges {
                let entry = DeadEntry::write(begin as *mut u8, size);
                if tail.is_null() {
                    inner.head = entry;
                } else {
                    (*tail).next = entry;
                }
                tail = entry;
                inner.free_bytes += size;
                inner.largest_extent = inner.largest_extent.max(size);
            }
        }
        self.bytes_in_use.store(live_bytes, Ordering::Relaxed);
    }

    /// Grows the committed pool by `bytes`, returning the added range.
    pub fn expand(&self, bytes: usize) -> Option<(usize, usize)> {
        let bytes = crate::utils::align_up(bytes, GRANULE);
        let old_end = self.end();
        if old_end + bytes > self.capacity_end {
            return None;
        }
        self.end.store(old_end + bytes, Ordering::Release);
        unsafe {
            let entry = DeadEntry::write(old_end as *mut u8, bytes);
            let mut inner = self.free.lock();
            (*entry).next = inner.head;
            inner.head = entry;
            inner.free_bytes += bytes;
            inner.largest_extent = inner.largest_extent.max(bytes);
        }
        Some((old_end, old_end + bytes))
    }

    /// Shrinks the pool by retiring `begin..end` off the committed tail.
    /// Fails unless that exact range is the free tail of the pool.
    pub fn contract(&self, begin: usize, end: usize) -> bool {
        if end != self.end() || begin >= end {
            return false;
        }
        let bytes = end - begin;
        let mut inner = self.free.lock();
        unsafe {
            // Find a free entry that covers the tail exactly.
            let mut prev: *mut DeadEntry = null_mut();
            let mut entry = inner.head;
            while !entry.is_null() {
                let e_begin = entry as usize;
                let e_end = e_begin + (*entry).size();
                if e_end == end && e_begin <= begin {
                    let leading = begin - e_begin;
                    if leading > 0 && leading < GRANULE {
                        return false;
                    }
                    let replacement = if leading >= GRANULE {
                        let head_entry = DeadEntry::write(e_begin as *mut u8, leading);
                        (*head_entry).next = (*entry).next;
                        head_entry
                    } else {
                        (*entry).next
                    };
                    if prev.is_null() {
                        inner.head = replacement;
                    } else {
                        (*prev).next = replacement;
                    }
                    inner.free_bytes -= bytes;
                    self.recompute_largest(&mut inner);
                    self.end.store(begin, Ordering::Release);
                    return true;
                }
                prev = entry;
                entry = (*entry).next;
            }
        }
        false
    }

    /// Walks every entity in the pool in address order: live objects are
    /// reported through `f`, dead entries are skipped by their recorded
    /// size. Only meaningful when every gap carries a dead entry.
    pub fn walk(&self, model: &dyn ObjectModel, mut f: impl FnMut(*mut ObjectHeader)) {
        let mut scan = self.begin;
        let end = self.end();
        unsafe {
            while scan < end {
                let word = *(scan as *const usize);
                if DeadEntry::is_dead(word) {
                    scan += (*(scan as *const DeadEntry)).size();
                } else {
                    let object = scan as *mut ObjectHeader;
                    f(object);
                    scan += model.size_of(object);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memmap2::MmapMut;

    #[test]
    fn first_fit_and_release_round_trip() {
        let backing = MmapMut::map_anon(64 * 1024).unwrap();
        let pool = TenuredSpace::new(backing.as_ptr() as *mut u8, 64 * 1024, 64 * 1024);

        assert_eq!(pool.free_bytes(), 64 * 1024);
        let a = pool.alloc(256);
        assert!(!a.is_null());
        assert_eq!(pool.bytes_in_use(), 256);
        let b = pool.alloc(512);
        assert!(!b.is_null());
        assert!(b > a);

        pool.release_range(a, 256);
        assert_eq!(pool.bytes_in_use(), 512);

        // First fit reuses the released front extent.
        let c = pool.alloc(128);
        assert_eq!(c, a);
    }

    #[test]
    fn chunk_allocation_degrades_to_minimum() {
        let backing = MmapMut::map_anon(4 * 1024).unwrap();
        let pool = TenuredSpace::new(backing.as_ptr() as *mut u8, 4 * 1024, 4 * 1024);

        let (_, len) = pool.alloc_chunk(GRANULE, 64 * 1024).unwrap();
        assert!(len <= 4 * 1024 && len >= GRANULE);
        assert!(pool.alloc_chunk(8 * 1024, 8 * 1024).is_none());
    }

    #[test]
    fn expand_then_contract_restores_footprint() {
        let backing = MmapMut::map_anon(64 * 1024).unwrap();
        let pool = TenuredSpace::new(backing.as_ptr() as *mut u8, 32 * 1024, 64 * 1024);
        let free_before = pool.free_bytes();
        let end_before = pool.end();

        let (begin, end) = pool.expand(16 * 1024).unwrap();
        assert_eq!(begin, end_before);
        assert_eq!(pool.free_bytes(), free_before + 16 * 1024);

        assert!(pool.contract(begin, end));
        assert_eq!(pool.end(), end_before);
        assert_eq!(pool.free_bytes(), free_before);
    }
}
