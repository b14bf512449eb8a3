use parking_lot::{Condvar, Mutex};
use std::ptr::null_mut;

use crate::header::ObjectHeader;

/// Where a copy-scan cache's memory came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Destination {
    Survivor,
    Tenure,
}

/// A fixed-size buffer that is simultaneously a bump-allocation target
/// and a unit of scan work. At any instant a cache is owned by exactly
/// one worker or sits on a shared list; ownership moves only through
/// list operations.
pub struct CopyScanCache {
    base: *mut u8,
    alloc: *mut u8,
    scan: *mut u8,
    limit: *mut u8,
    pub dest: Destination,
}

unsafe impl Send for CopyScanCache {}

impl CopyScanCache {
    pub fn empty(dest: Destination) -> Self {
        Self {
            base: null_mut(),
            alloc: null_mut(),
            scan: null_mut(),
            limit: null_mut(),
            dest,
        }
    }

    /// Re-arms the cache over a freshly carved memory chunk.
    pub fn assign(&mut self, base: *mut u8, len: usize, dest: Destination) {
        self.base = base;
        self.alloc = base;
        self.scan = base;
        self.limit = unsafe { base.add(len) };
        self.dest = dest;
    }

    #[inline]
    pub fn is_assigned(&self) -> bool {
        !self.base.is_null()
    }

    /// Bump-allocates `size` bytes for an incoming copy; null when the
    /// remaining extent is too small.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let result = self.alloc;
        let new_alloc = unsafe { result.add(size) };
        if new_alloc > self.limit {
            return null_mut();
        }
        self.alloc = new_alloc;
        result
    }

    /// Rewinds the most recent allocation; only the owning worker may
    /// call this, and only with the pointer `alloc` just returned.
    #[inline]
    pub fn undo_alloc(&mut self, memory: *mut u8, size: usize) {
        debug_assert_eq!(unsafe { memory.add(size) }, self.alloc);
        debug_assert!(self.scan <= memory);
        self.alloc = memory;
    }

    #[inline]
    pub fn has_scan_work(&self) -> bool {
        self.scan < self.alloc
    }

    #[inline]
    pub fn scan_cursor(&self) -> *mut u8 {
        self.scan
    }

    #[inline]
    pub fn alloc_cursor(&self) -> *mut u8 {
        self.alloc
    }

    pub fn advance_scan(&mut self, to: *mut u8) {
        debug_assert!(to >= self.scan && to <= self.alloc);
        self.scan = to;
    }

    /// Unused tail extent left in the cache.
    #[inline]
    pub fn remainder(&self) -> usize {
        self.limit as usize - self.alloc as usize
    }

    pub fn alloc_base(&self) -> *mut u8 {
        self.base
    }

    /// Detaches the chunk, returning `(unused_tail, tail_len)` so the
    /// caller can give the remainder back to its memory pool.
    pub fn retire(&mut self) -> (*mut u8, usize) {
        let tail = self.alloc;
        let tail_len = self.remainder();
        self.base = null_mut();
        self.alloc = null_mut();
        self.scan = null_mut();
        self.limit = null_mut();
        (tail, tail_len)
    }
}

/// A unit of pending scan work: a cache with unscanned copies, or a
/// slot sub-range of one large indexable object.
pub enum ScanWork {
    Cache(Box<CopyScanCache>),
    Slice {
        object: *mut ObjectHeader,
        from: usize,
        to: usize,
    },
}

unsafe impl Send for ScanWork {}

struct QueueInner {
    pending: Vec<ScanWork>,
    waiting: usize,
    complete: bool,
}

/// Monitor-guarded pending-scan list shared by all workers of a scavenge
/// phase. A worker with nothing to do blocks here; the phase is complete
/// only when every worker is blocked and nothing is pending, a
/// termination barrier rather than a counter, because scanning generates
/// new work.
pub struct ScanQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    workers: usize,
}

impl ScanQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: Vec::new(),
                waiting: 0,
                complete: false,
            }),
            cond: Condvar::new(),
            workers,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.pending.is_empty(), "scan work leaked across cycles");
        inner.waiting = 0;
        inner.complete = false;
    }

    pub fn push(&self, work: ScanWork) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.complete, "push after phase completion");
        inner.pending.push(work);
        drop(inner);
        self.cond.notify_one();
    }

    /// Pops the next unit of scan work, blocking while the list is empty
    /// and other workers may still generate more. Returns None exactly
    /// once per worker, when the phase has terminated.
    pub fn pop(&self) -> Option<ScanWork> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(work) = inner.pending.pop() {
                return Some(work);
            }
            inner.waiting += 1;
            if inner.waiting == self.workers {
                inner.complete = true;
                drop(inner);
                self.cond.notify_all();
                return None;
            }
            while inner.pending.is_empty() && !inner.complete {
                self.cond.wait(&mut inner);
            }
            inner.waiting -= 1;
            if inner.complete {
                return None;
            }
        }
    }
}

/// Recycles cache structures across cycles so the copy path never
/// allocates. Uses its own lock, separate from the scan queue's, to
/// avoid a single point of contention.
pub struct CachePool {
    free: Mutex<Vec<Box<CopyScanCache>>>,
}

impl CachePool {
    pub fn new(prealloc: usize) -> Self {
        let mut free = Vec::with_capacity(prealloc);
        for _ in 0..prealloc {
            free.push(Box::new(CopyScanCache::empty(Destination::Survivor)));
        }
        Self {
            free: Mutex::new(free),
        }
    }

    pub fn acquire(&self) -> Box<CopyScanCache> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(CopyScanCache::empty(Destination::Survivor)))
    }

    pub fn release(&self, cache: Box<CopyScanCache>) {
        debug_assert!(!cache.is_assigned(), "cache released with live chunk");
        self.free.lock().push(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bump_allocation_respects_limit() {
        let mut backing = [0u8; 256];
        let mut cache = CopyScanCache::empty(Destination::Survivor);
        cache.assign(backing.as_mut_ptr(), 256, Destination::Tenure);

        let a = cache.alloc(128);
        assert!(!a.is_null());
        assert!(cache.has_scan_work());
        assert!(cache.alloc(256).is_null());
        assert_eq!(cache.remainder(), 128);

        cache.advance_scan(cache.alloc_cursor());
        assert!(!cache.has_scan_work());
        let (tail, len) = cache.retire();
        assert_eq!(tail as usize, a as usize + 128);
        assert_eq!(len, 128);
    }

    #[test]
    fn scan_queue_terminates_only_when_all_workers_block() {
        const WORKERS: usize = 4;
        let queue = ScanQueue::new(WORKERS);
        let scanned = AtomicUsize::new(0);

        // Seed with slices that fan out into more work while workers are
        // already draining, exercising the barrier rather than a counter.
        for i in 0..16 {
            queue.push(ScanWork::Slice {
                object: std::ptr::null_mut(),
                from: 0,
                to: i,
            });
        }

        let mut pool = scoped_threadpool::Pool::new(WORKERS as u32);
        pool.scoped(|scope| {
            for _ in 0..WORKERS {
                scope.execute(|| {
                    while let Some(work) = queue.pop() {
                        if let ScanWork::Slice { to, .. } = work {
                            if to > 0 && to % 3 == 0 {
                                queue.push(ScanWork::Slice {
                                    object: std::ptr::null_mut(),
                                    from: 0,
                                    to: to / 3,
                                });
                            }
                        }
                        scanned.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        // 16 seeds plus the re-pushed thirds of 3, 6, 9, 12, 15 plus the
        // third of the re-pushed 3 (from 9) etc.
        let inner = queue.inner.lock();
        assert!(inner.complete);
        assert!(inner.pending.is_empty());
        assert!(scanned.load(Ordering::Relaxed) >= 16);
    }

    #[test]
    fn pool_recycles_caches() {
        let pool = CachePool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire(); // beyond prealloc
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.free.lock().len(), 3);
    }
}
