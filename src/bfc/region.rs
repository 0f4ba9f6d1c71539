//! Region map: device extents and the chunk that starts at each address.
//!
//! Regions never move or shrink until teardown, but the chunks tiling them
//! change on every split and merge. The map is keyed by chunk base address,
//! so resolving any in-region address means finding the last chunk start at
//! or below it within the same region.

use std::collections::BTreeMap;

use crate::backend::DevicePtr;

use super::chunk::ChunkHandle;

/// One contiguous extent obtained from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: DevicePtr,
    size: usize,
}

impl Region {
    pub fn new(base: DevicePtr, size: usize) -> Self {
        Region { base, size }
    }

    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> DevicePtr {
        self.base.offset(self.size)
    }

    pub fn contains(&self, ptr: DevicePtr) -> bool {
        ptr >= self.base && ptr < self.end()
    }
}

/// Maps device addresses back to chunk handles.
#[derive(Debug, Default)]
pub struct RegionMap {
    /// Sorted by base address, non-overlapping
    regions: Vec<Region>,
    /// Chunk base address -> handle
    handles: BTreeMap<DevicePtr, ChunkHandle>,
}

impl RegionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new region and the chunk spanning it.
    pub fn register(&mut self, base: DevicePtr, size: usize, handle: ChunkHandle) {
        assert!(size > 0, "registering empty region at {}", base);
        let region = Region::new(base, size);
        let idx = self.regions.partition_point(|r| r.base < base);
        if let Some(next) = self.regions.get(idx) {
            assert!(
                region.end() <= next.base,
                "region {}+{} overlaps region at {}",
                base,
                size,
                next.base
            );
        }
        if idx > 0 {
            let prev = self.regions[idx - 1];
            assert!(
                prev.end() <= base,
                "region {}+{} overlaps region at {}",
                base,
                size,
                prev.base
            );
        }
        self.regions.insert(idx, region);
        self.set_handle(base, handle);
    }

    /// Point the chunk starting at `ptr` at `handle`.
    pub fn set_handle(&mut self, ptr: DevicePtr, handle: ChunkHandle) {
        assert!(
            self.region_for(ptr).is_some(),
            "chunk start {} is outside every region",
            ptr
        );
        self.handles.insert(ptr, handle);
    }

    /// Forget the chunk starting at `ptr`.
    pub fn erase(&mut self, ptr: DevicePtr) {
        let removed = self.handles.remove(&ptr);
        assert!(removed.is_some(), "no chunk registered at {}", ptr);
    }

    /// Chunk that starts exactly at `ptr`
    pub fn handle_at(&self, ptr: DevicePtr) -> Option<ChunkHandle> {
        self.handles.get(&ptr).copied()
    }

    /// Chunk whose span covers `ptr`, for any address inside a region
    pub fn resolve(&self, ptr: DevicePtr) -> Option<ChunkHandle> {
        let region = self.region_for(ptr)?;
        self.handles
            .range(region.base..=ptr)
            .next_back()
            .map(|(_, h)| *h)
    }

    /// Region containing `ptr`
    pub fn region_for(&self, ptr: DevicePtr) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.end() <= ptr);
        self.regions.get(idx).filter(|r| r.contains(ptr))
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Number of registered chunk starts
    pub fn chunk_count(&self) -> usize {
        self.handles.len()
    }

    /// Iterate over `(chunk start, handle)` in address order
    pub fn iter(&self) -> impl Iterator<Item = (DevicePtr, ChunkHandle)> + '_ {
        self.handles.iter().map(|(p, h)| (*p, *h))
    }

    /// Remove every region and chunk mapping, returning the regions
    pub fn take_regions(&mut self) -> Vec<Region> {
        self.handles.clear();
        std::mem::take(&mut self.regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bfc::chunk::ChunkTable;

    #[test]
    fn test_resolve_any_address_in_chunk() {
        let mut table = ChunkTable::new();
        let mut map = RegionMap::new();
        let a = table.allocate();
        let b = table.allocate();

        map.register(DevicePtr::new(1000), 400, a);
        map.set_handle(DevicePtr::new(1200), b);

        assert_eq!(map.resolve(DevicePtr::new(1000)), Some(a));
        assert_eq!(map.resolve(DevicePtr::new(1199)), Some(a));
        assert_eq!(map.resolve(DevicePtr::new(1200)), Some(b));
        assert_eq!(map.resolve(DevicePtr::new(1399)), Some(b));
        assert_eq!(map.resolve(DevicePtr::new(1400)), None);
        assert_eq!(map.resolve(DevicePtr::new(999)), None);

        assert_eq!(map.handle_at(DevicePtr::new(1200)), Some(b));
        assert_eq!(map.handle_at(DevicePtr::new(1201)), None);
    }

    #[test]
    fn test_resolve_does_not_cross_regions() {
        let mut table = ChunkTable::new();
        let mut map = RegionMap::new();
        let a = table.allocate();
        let b = table.allocate();
        map.register(DevicePtr::new(5000), 100, b);
        map.register(DevicePtr::new(1000), 100, a);

        assert_eq!(map.regions()[0].base(), DevicePtr::new(1000));
        assert_eq!(map.resolve(DevicePtr::new(1050)), Some(a));
        assert_eq!(map.resolve(DevicePtr::new(3000)), None);
        assert_eq!(map.resolve(DevicePtr::new(5099)), Some(b));
    }

    #[test]
    fn test_erase_restores_covering_chunk() {
        let mut table = ChunkTable::new();
        let mut map = RegionMap::new();
        let a = table.allocate();
        let b = table.allocate();
        map.register(DevicePtr::new(1000), 400, a);
        map.set_handle(DevicePtr::new(1200), b);
        map.erase(DevicePtr::new(1200));
        assert_eq!(map.resolve(DevicePtr::new(1300)), Some(a));
        assert_eq!(map.chunk_count(), 1);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlapping_regions_panic() {
        let mut table = ChunkTable::new();
        let mut map = RegionMap::new();
        map.register(DevicePtr::new(1000), 400, table.allocate());
        map.register(DevicePtr::new(1200), 400, table.allocate());
    }

    #[test]
    #[should_panic(expected = "outside every region")]
    fn test_set_handle_outside_region_panics() {
        let mut table = ChunkTable::new();
        let mut map = RegionMap::new();
        map.set_handle(DevicePtr::new(42), table.allocate());
    }

    #[test]
    fn test_take_regions_clears_map() {
        let mut table = ChunkTable::new();
        let mut map = RegionMap::new();
        map.register(DevicePtr::new(1000), 400, table.allocate());
        let regions = map.take_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].size(), 400);
        assert!(map.regions().is_empty());
        assert_eq!(map.chunk_count(), 0);
    }
}
