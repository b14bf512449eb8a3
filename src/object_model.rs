use crate::header::ObjectHeader;

/// Receives the address of every reference-bearing slot in an object.
/// Slots hold either null or a pointer to another object's header.
pub trait SlotVisitor {
    fn visit_slot(&mut self, slot: *mut *mut ObjectHeader);
}

impl<F: FnMut(*mut *mut ObjectHeader)> SlotVisitor for F {
    fn visit_slot(&mut self, slot: *mut *mut ObjectHeader) {
        self(slot)
    }
}

/// Object-layout capability supplied by the embedding runtime.
///
/// The collector never assumes a header layout beyond the few bits it
/// privately owns ([`ObjectHeader`]); sizes, slot positions and
/// indexability all come through this interface.
pub trait ObjectModel: Send + Sync {
    /// Total allocation size of `object` in bytes, header included,
    /// granule aligned.
    fn size_of(&self, object: *const ObjectHeader) -> usize;

    /// Invokes `visitor` on every reference slot of `object`.
    fn scan(&self, object: *mut ObjectHeader, visitor: &mut dyn SlotVisitor);

    /// Whether `object` is indexable and its scan work may be split into
    /// slot sub-ranges.
    fn is_indexable(&self, _object: *const ObjectHeader) -> bool {
        false
    }

    /// Number of reference slots of an indexable object. Only consulted
    /// when [`ObjectModel::is_indexable`] returned true.
    fn slot_count(&self, _object: *const ObjectHeader) -> usize {
        0
    }

    /// Invokes `visitor` on the reference slots of an indexable object in
    /// the index range `[from, to)`.
    fn scan_slice(
        &self,
        object: *mut ObjectHeader,
        _from: usize,
        _to: usize,
        visitor: &mut dyn SlotVisitor,
    ) {
        self.scan(object, visitor)
    }
}
