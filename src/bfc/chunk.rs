//! Chunk records and the handle-addressed table that owns them.
//!
//! Chunks link to their physical neighbours and to their bin through integer
//! handles, never references, so splitting and merging only rewrites plain
//! indices. Destroyed records go onto an embedded free list and their slots
//! are reused in O(1).

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::backend::DevicePtr;

/// Index of a chunk record in the [`ChunkTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkHandle(usize);

impl ChunkHandle {
    /// Smallest possible handle; lower bound for ordered lookups
    pub(crate) const FIRST: ChunkHandle = ChunkHandle(0);

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Size-class index
pub type BinNum = usize;

/// One contiguous span of pool memory, free or in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Base address of the span
    pub ptr: DevicePtr,
    /// Span length in bytes; a multiple of the allocation granularity
    pub size: usize,
    /// What the caller asked for; diagnostics only
    pub requested_size: usize,
    /// Set while the chunk is handed out
    pub allocation_id: Option<u64>,
    /// Physically preceding chunk in the same region
    pub prev: Option<ChunkHandle>,
    /// Physically following chunk in the same region
    pub next: Option<ChunkHandle>,
    /// Bin holding this chunk; set iff the chunk is free
    pub bin_num: Option<BinNum>,
}

impl Chunk {
    fn vacant() -> Self {
        Chunk {
            ptr: DevicePtr::NULL,
            size: 0,
            requested_size: 0,
            allocation_id: None,
            prev: None,
            next: None,
            bin_num: None,
        }
    }

    pub fn in_use(&self) -> bool {
        self.allocation_id.is_some()
    }

    /// One past the last byte of the span
    pub fn end(&self) -> DevicePtr {
        self.ptr.offset(self.size)
    }

    pub fn contains(&self, ptr: DevicePtr) -> bool {
        ptr >= self.ptr && ptr < self.end()
    }
}

#[derive(Debug)]
enum Slot {
    Live(Chunk),
    Vacant { next_free: Option<ChunkHandle> },
}

/// Arena of chunk records addressed by [`ChunkHandle`].
#[derive(Debug, Default)]
pub struct ChunkTable {
    slots: Vec<Slot>,
    free_head: Option<ChunkHandle>,
    live: usize,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot (reusing a destroyed one if possible) and return its handle.
    ///
    /// The new record is free, unlinked and in no bin.
    pub fn allocate(&mut self) -> ChunkHandle {
        self.live += 1;
        match self.free_head {
            Some(h) => {
                let next_free = match self.slots[h.0] {
                    Slot::Vacant { next_free } => next_free,
                    Slot::Live(_) => panic!("chunk free list points at live chunk {}", h),
                };
                self.free_head = next_free;
                self.slots[h.0] = Slot::Live(Chunk::vacant());
                h
            }
            None => {
                let h = ChunkHandle(self.slots.len());
                self.slots.push(Slot::Live(Chunk::vacant()));
                h
            }
        }
    }

    /// Destroy the record behind `h` and push its slot onto the free list.
    pub fn deallocate(&mut self, h: ChunkHandle) {
        assert!(
            matches!(self.slots.get(h.0), Some(Slot::Live(_))),
            "deallocating dead chunk {}",
            h
        );
        self.slots[h.0] = Slot::Vacant {
            next_free: self.free_head,
        };
        self.free_head = Some(h);
        self.live -= 1;
    }

    pub fn get(&self, h: ChunkHandle) -> Option<&Chunk> {
        match self.slots.get(h.0) {
            Some(Slot::Live(chunk)) => Some(chunk),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, h: ChunkHandle) -> Option<&mut Chunk> {
        match self.slots.get_mut(h.0) {
            Some(Slot::Live(chunk)) => Some(chunk),
            _ => None,
        }
    }

    /// Number of live chunk records
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots ever created (live + reusable)
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate over every live chunk
    pub fn iter(&self) -> impl Iterator<Item = (ChunkHandle, &Chunk)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Live(chunk) => Some((ChunkHandle(i), chunk)),
            Slot::Vacant { .. } => None,
        })
    }
}

impl Index<ChunkHandle> for ChunkTable {
    type Output = Chunk;

    fn index(&self, h: ChunkHandle) -> &Chunk {
        match self.get(h) {
            Some(chunk) => chunk,
            None => panic!("dangling chunk handle {}", h),
        }
    }
}

impl IndexMut<ChunkHandle> for ChunkTable {
    fn index_mut(&mut self, h: ChunkHandle) -> &mut Chunk {
        match self.get_mut(h) {
            Some(chunk) => chunk,
            None => panic!("dangling chunk handle {}", h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_returns_fresh_free_chunk() {
        let mut table = ChunkTable::new();
        let h = table.allocate();
        let chunk = &table[h];
        assert!(!chunk.in_use());
        assert!(chunk.prev.is_none() && chunk.next.is_none());
        assert!(chunk.bin_num.is_none());
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_deallocated_slots_are_reused_lifo() {
        let mut table = ChunkTable::new();
        let a = table.allocate();
        let b = table.allocate();
        let _c = table.allocate();
        table.deallocate(a);
        table.deallocate(b);
        assert_eq!(table.live_count(), 1);

        assert_eq!(table.allocate(), b);
        assert_eq!(table.allocate(), a);
        assert_eq!(table.capacity(), 3);
        assert_eq!(table.live_count(), 3);
    }

    #[test]
    fn test_reused_slot_is_reset() {
        let mut table = ChunkTable::new();
        let a = table.allocate();
        table[a].size = 512;
        table[a].allocation_id = Some(9);
        table.deallocate(a);
        let again = table.allocate();
        assert_eq!(again, a);
        assert_eq!(table[again].size, 0);
        assert!(!table[again].in_use());
    }

    #[test]
    fn test_iter_skips_dead_chunks() {
        let mut table = ChunkTable::new();
        let a = table.allocate();
        let b = table.allocate();
        table.deallocate(a);
        let live: Vec<_> = table.iter().map(|(h, _)| h).collect();
        assert_eq!(live, vec![b]);
        assert!(table.get(a).is_none());
    }

    #[test]
    #[should_panic(expected = "dangling chunk handle")]
    fn test_index_dead_handle_panics() {
        let mut table = ChunkTable::new();
        let a = table.allocate();
        table.deallocate(a);
        let _ = &table[a];
    }

    #[test]
    #[should_panic(expected = "deallocating dead chunk")]
    fn test_double_deallocate_panics() {
        let mut table = ChunkTable::new();
        let a = table.allocate();
        table.deallocate(a);
        table.deallocate(a);
    }

    #[test]
    fn test_chunk_contains() {
        let chunk = Chunk {
            ptr: DevicePtr::new(1000),
            size: 200,
            ..Chunk::vacant()
        };
        assert!(chunk.contains(DevicePtr::new(1000)));
        assert!(chunk.contains(DevicePtr::new(1199)));
        assert!(!chunk.contains(DevicePtr::new(1200)));
        assert_eq!(chunk.end(), DevicePtr::new(1200));
    }
}
