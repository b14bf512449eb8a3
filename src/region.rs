use crate::header::ObjectHeader;

/// Generation tag of a heap region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    New,
    Old,
}

/// A contiguous address range owned by the region table.
#[derive(Clone, Copy, Debug)]
pub struct HeapRegion {
    pub begin: usize,
    pub end: usize,
    pub kind: RegionKind,
}

impl HeapRegion {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin && addr < self.end
    }

    pub fn size(&self) -> usize {
        self.end - self.begin
    }
}

/// Partitions the reserved address space into tagged ranges. Ranges are
/// added on heap expansion and retired on contraction; internal pointers
/// into a retired range must already be gone by the time it is removed.
pub struct RegionTable {
    regions: Vec<HeapRegion>,
}

impl RegionTable {
    pub fn new() -> Self {
        Self { regions: vec![] }
    }

    pub fn add_range(&mut self, kind: RegionKind, begin: usize, end: usize) {
        assert!(begin < end, "empty region {:#x}..{:#x}", begin, end);
        debug_assert!(self.kind_of(begin).is_none() && self.kind_of(end - 1).is_none());
        self.regions.push(HeapRegion { begin, end, kind });
        self.regions.sort_unstable_by_key(|r| r.begin);
    }

    /// Retires the range `begin..end`. The bounds must match a previous
    /// `add_range` exactly.
    pub fn remove_range(&mut self, begin: usize, end: usize) {
        let before = self.regions.len();
        self.regions
            .retain(|r| !(r.begin == begin && r.end == end));
        assert_eq!(before, self.regions.len() + 1, "no such region");
    }

    #[inline]
    pub fn kind_of(&self, addr: usize) -> Option<RegionKind> {
        self.regions
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| r.kind)
    }

    #[inline]
    pub fn kind_of_object(&self, object: *const ObjectHeader) -> Option<RegionKind> {
        self.kind_of(object as usize)
    }

    pub fn regions(&self) -> &[HeapRegion] {
        &self.regions
    }

    pub fn total_bytes(&self, kind: RegionKind) -> usize {
        self.regions
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_round_trip() {
        let mut table = RegionTable::new();
        table.add_range(RegionKind::Old, 0x1000, 0x2000);
        table.add_range(RegionKind::New, 0x2000, 0x3000);

        assert_eq!(table.kind_of(0x1800), Some(RegionKind::Old));
        assert_eq!(table.kind_of(0x2000), Some(RegionKind::New));
        assert_eq!(table.kind_of(0x3000), None);
        assert_eq!(table.total_bytes(RegionKind::Old), 0x1000);

        table.remove_range(0x2000, 0x3000);
        assert_eq!(table.kind_of(0x2800), None);
        assert_eq!(table.regions().len(), 1);
    }

    #[test]
    #[should_panic]
    fn removing_unknown_range_is_an_error() {
        let mut table = RegionTable::new();
        table.add_range(RegionKind::Old, 0x1000, 0x2000);
        table.remove_range(0x1000, 0x1800);
    }
}
