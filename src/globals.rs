/// Minimum object granule. Every allocation is aligned to this and the
/// mark map carries one bit per granule.
pub const GRANULE: usize = 16;

/// Smallest memory extent worth linking back into a free list; anything
/// smaller becomes an unlinked dead-object placeholder.
pub const MIN_REUSABLE_EXTENT: usize = 2 * GRANULE;

/// Remainder below which a copy-scan cache is discarded rather than
/// returned to its memory pool.
pub const MIN_CACHE_REMAINDER: usize = 4 * GRANULE;

/// Slot count above which an indexable object's scan work is split into
/// sub-ranges for load balancing.
pub const SPLIT_SLICE_THRESHOLD: usize = 128;

/// Slots per split sub-range.
pub const SPLIT_SLICE_SLOTS: usize = 64;

/// Object age beyond which the age field saturates.
pub const MAX_OBJECT_AGE: u8 = 14;

/// Slots per thread-local remembered-set fragment.
pub const REMEMBERED_FRAGMENT_SLOTS: usize = 64;
