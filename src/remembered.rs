use atomic::{Atomic, Ordering};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use crate::globals::REMEMBERED_FRAGMENT_SLOTS;
use crate::header::ObjectHeader;

/// Two-phase access protocol. Additions are legal only while the set is
/// in `Modify`; iterating results happens in `Search`. An addition after
/// the search phase has begun is a programming error, not a runtime
/// condition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RsState {
    Modify,
    Search,
}

struct FragmentSlots(Vec<*mut ObjectHeader>);

unsafe impl Send for FragmentSlots {}

/// Buffer of unflushed additions, owned by one mutator thread. Created
/// through [`RememberedSet::new_fragment`] so the set can reach every
/// outstanding fragment and flush it when a collection starts; a mutator
/// never has to flush before a GC-triggering allocation.
pub struct RememberedSetFragment {
    slots: Arc<Mutex<FragmentSlots>>,
}

impl RememberedSetFragment {
    /// A standalone, unregistered fragment. Only useful where the caller
    /// guarantees an explicit flush; collections cannot see it.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(FragmentSlots(Vec::with_capacity(
                REMEMBERED_FRAGMENT_SLOTS,
            )))),
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.lock().0.len() == REMEMBERED_FRAGMENT_SLOTS
    }

    pub fn len(&self) -> usize {
        self.slots.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().0.is_empty()
    }
}

impl Default for RememberedSetFragment {
    fn default() -> Self {
        Self::new()
    }
}

/// The set of tenured objects known to hold references into the young
/// generation.
///
/// Invariant: either the list plus the registered fragments is an exact
/// superset of all true cross-generational holders, or the overflow flag
/// is set, the list contents must be ignored, and the next global
/// collection's full-heap scan is authoritative. The two states are
/// mutually exclusive and globally visible; once overflow is signaled it
/// stays signaled until an explicit rebuild completes.
pub struct RememberedSet {
    list: Mutex<Vec<*mut ObjectHeader>>,
    fragments: Mutex<Vec<Weak<Mutex<FragmentSlots>>>>,
    overflowed: AtomicBool,
    state: Atomic<RsState>,
    capacity: usize,
}

unsafe impl Send for RememberedSet {}
unsafe impl Sync for RememberedSet {}

impl RememberedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            fragments: Mutex::new(Vec::new()),
            overflowed: AtomicBool::new(false),
            state: Atomic::new(RsState::Modify),
            capacity,
        }
    }

    /// Creates a fragment registered with this set. Registered fragments
    /// are flushed by [`RememberedSet::flush_all_fragments`] at the start
    /// of every collection, so batched additions are never lost to a
    /// scavenge the mutator did not anticipate.
    pub fn new_fragment(&self) -> RememberedSetFragment {
        let fragment = RememberedSetFragment::new();
        self.fragments.lock().push(Arc::downgrade(&fragment.slots));
        fragment
    }

    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Records that `object` (tenured) may hold a young reference,
    /// batching through the caller's fragment. In overflow mode all
    /// additions are skipped; the rebuild scan re-discovers them.
    pub fn remember(&self, fragment: &mut RememberedSetFragment, object: *mut ObjectHeader) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            RsState::Modify,
            "remembered-set addition after search began"
        );
        if self.is_overflowed() {
            return;
        }
        unsafe {
            if !(*object).try_set_remembered() {
                return; // already present
            }
        }
        let full = {
            let mut slots = fragment.slots.lock();
            slots.0.push(object);
            slots.0.len() == REMEMBERED_FRAGMENT_SLOTS
        };
        if full {
            self.flush(fragment);
        }
    }

    /// Merges a thread-local fragment into the global list. If growth
    /// past the configured capacity fails, the set transitions to
    /// overflow and the fragment is dropped.
    pub fn flush(&self, fragment: &mut RememberedSetFragment) {
        self.merge(&mut fragment.slots.lock().0);
    }

    /// Merges every registered fragment. Called by the collector at cycle
    /// start, before the search phase begins; fragments whose owning
    /// thread has gone away are unregistered here.
    pub fn flush_all_fragments(&self) {
        assert_eq!(self.state.load(Ordering::Acquire), RsState::Modify);
        self.fragments.lock().retain(|weak| match weak.upgrade() {
            Some(slots) => {
                self.merge(&mut slots.lock().0);
                true
            }
            None => false,
        });
    }

    fn merge(&self, pending: &mut Vec<*mut ObjectHeader>) {
        if pending.is_empty() {
            return;
        }
        let mut list = self.list.lock();
        if list.len() + pending.len() > self.capacity {
            drop(list);
            self.overflow();
            pending.clear();
            return;
        }
        list.append(pending);
    }

    pub fn overflow(&self) {
        self.overflowed
            .store(true, std::sync::atomic::Ordering::Release);
    }

    /// Enters the search phase. No addition may occur from here until
    /// the next `reset_for_rebuild`.
    pub fn begin_search(&self) {
        self.state.store(RsState::Search, Ordering::Release);
    }

    /// Iterates the recorded holders. Must not be called while the set
    /// is overflowed; the contents are meaningless then.
    pub fn for_each(&self, mut f: impl FnMut(*mut ObjectHeader)) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            RsState::Search,
            "remembered-set search outside search phase"
        );
        assert!(!self.is_overflowed(), "searching an overflowed set");
        for &object in self.list.lock().iter() {
            f(object);
        }
    }

    /// Drains the list for a destructive walk (scavenge processes and
    /// re-adds survivors). Same phase rules as `for_each`.
    pub fn take_all(&self) -> Vec<*mut ObjectHeader> {
        assert_eq!(self.state.load(Ordering::Acquire), RsState::Search);
        std::mem::take(&mut *self.list.lock())
    }

    /// Clears everything, registered fragments included, and re-enters
    /// the modify phase; the caller is about to repopulate exactly,
    /// typically from a full tenured scan.
    pub fn reset_for_rebuild(&self) {
        self.fragments.lock().retain(|weak| match weak.upgrade() {
            Some(slots) => {
                slots.lock().0.clear();
                true
            }
            None => false,
        });
        self.list.lock().clear();
        self.overflowed
            .store(false, std::sync::atomic::Ordering::Release);
        self.state.store(RsState::Modify, Ordering::Release);
    }

    /// Leaves the search phase after a scavenge repopulated the set.
    pub fn end_search(&self) {
        self.state.store(RsState::Modify, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Direct master-thread insertion used by the rebuild scan; bypasses
    /// fragments but honors capacity and phase rules.
    pub fn remember_unbatched(&self, object: *mut ObjectHeader) {
        assert_eq!(self.state.load(Ordering::Acquire), RsState::Modify);
        if self.is_overflowed() {
            return;
        }
        unsafe {
            if !(*object).try_set_remembered() {
                return;
            }
        }
        let mut list = self.list.lock();
        if list.len() == self.capacity {
            drop(list);
            self.overflow();
            return;
        }
        list.push(object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn object() -> Box<ObjectHeader> {
        // ObjectHeader is a single word; fabricate one on the heap.
        unsafe { Box::from_raw(Box::into_raw(Box::new(0usize)) as *mut ObjectHeader) }
    }

    #[test]
    fn additions_batch_through_fragments() {
        let set = RememberedSet::new(1024);
        let mut fragment = RememberedSetFragment::new();
        let objects: Vec<_> = (0..3).map(|_| object()).collect();

        for o in objects.iter() {
            set.remember(&mut fragment, &**o as *const _ as *mut _);
        }
        assert_eq!(set.len(), 0, "unflushed additions stay thread-local");
        assert_eq!(fragment.len(), 3);

        // Re-adding a remembered object is a no-op.
        set.remember(&mut fragment, &*objects[0] as *const _ as *mut _);
        assert_eq!(fragment.len(), 3);

        set.flush(&mut fragment);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn registered_fragments_flush_with_the_set() {
        let set = RememberedSet::new(1024);
        let mut fragment = set.new_fragment();
        let objects: Vec<_> = (0..3).map(|_| object()).collect();

        for o in objects.iter() {
            set.remember(&mut fragment, &**o as *const _ as *mut _);
        }
        assert_eq!(set.len(), 0);

        // The collector-side flush reaches the mutator's buffer without
        // the mutator's involvement.
        set.flush_all_fragments();
        assert_eq!(set.len(), 3);
        assert!(fragment.is_empty());
    }

    #[test]
    fn dropped_fragments_are_unregistered() {
        let set = RememberedSet::new(1024);
        let fragment = set.new_fragment();
        drop(fragment);
        set.flush_all_fragments();
        assert_eq!(set.fragments.lock().len(), 0);
    }

    #[test]
    fn overflow_is_sticky_until_rebuild() {
        let set = RememberedSet::new(2);
        let mut fragment = set.new_fragment();
        let objects: Vec<_> = (0..80).map(|_| object()).collect();

        for o in objects.iter() {
            set.remember(&mut fragment, &**o as *const _ as *mut _);
        }
        set.flush(&mut fragment);
        assert!(set.is_overflowed());

        // Further additions are skipped, never silently dropped while
        // the flag is clear.
        set.remember(&mut fragment, &*objects[0] as *const _ as *mut _);
        assert!(set.is_overflowed());
        assert!(fragment.is_empty());

        set.reset_for_rebuild();
        assert!(!set.is_overflowed());
        assert_eq!(set.len(), 0);
    }

    #[test]
    #[should_panic(expected = "search began")]
    fn addition_after_search_asserts() {
        let set = RememberedSet::new(16);
        let mut fragment = RememberedSetFragment::new();
        let o = object();
        set.begin_search();
        set.remember(&mut fragment, &*o as *const _ as *mut _);
    }

    #[test]
    fn search_iterates_flushed_entries() {
        let set = RememberedSet::new(16);
        let mut fragment = RememberedSetFragment::new();
        let objects: Vec<_> = (0..5).map(|_| object()).collect();
        for o in objects.iter() {
            set.remember(&mut fragment, &**o as *const _ as *mut _);
        }
        set.flush(&mut fragment);

        set.begin_search();
        let seen = AtomicUsize::new(0);
        set.for_each(|_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        });
        assert_eq!(seen.load(std::sync::atomic::Ordering::Relaxed), 5);
        set.end_search();
    }
}
