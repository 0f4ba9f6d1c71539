//! Best-fit with coalescing allocator core.
//!
//! All metadata (chunk table, bins, region map, growth counters) lives behind
//! one mutex. Every public operation takes the lock once and leaves the
//! metadata consistent before releasing it.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{Device, DevicePtr};
use crate::error::{BfcError, BfcResult};
use crate::internal_error;

use super::bins::{BinSet, BinSummary, FreeChunkKey};
use super::chunk::{Chunk, ChunkHandle, ChunkTable};
use super::config::BfcConfig;
use super::growth::{checked_round_up, round_up, RegionGrowth};
use super::region::RegionMap;
use super::stats::AllocatorStats;

/// Binned best-fit allocator over a device's bounded memory pool.
pub struct BfcAllocator {
    name: String,
    device: Arc<dyn Device>,
    min_allocation_size: usize,
    state: Mutex<BfcState>,
}

impl std::fmt::Debug for BfcAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BfcAllocator")
            .field("name", &self.name)
            .field("device", &self.device.name())
            .field("min_allocation_size", &self.min_allocation_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct BfcState {
    min_allocation_size: usize,
    fragmentation_threshold: usize,
    chunks: ChunkTable,
    bins: BinSet,
    regions: RegionMap,
    growth: RegionGrowth,
    next_allocation_id: u64,
    num_allocs: u64,
    bytes_in_use: usize,
    peak_bytes_in_use: usize,
    largest_alloc_size: usize,
}

impl BfcAllocator {
    /// Create an allocator for `device`. No device memory is reserved until
    /// the first allocation.
    pub fn new(device: Arc<dyn Device>, config: BfcConfig) -> BfcResult<Self> {
        config.validate()?;
        let min_allocation_size = config.min_allocation_size;
        let memory_limit = config.resolve_memory_limit(device.as_ref())?;
        let region_cap = config.resolve_region_cap(device.as_ref());
        let initial_region_bytes = config.initial_region_bytes.unwrap_or(memory_limit);

        let bins = BinSet::new(min_allocation_size)?;
        let growth = RegionGrowth::new(
            min_allocation_size,
            memory_limit,
            initial_region_bytes,
            region_cap,
        );

        tracing::info!(
            "BFC allocator {} on {}: memory limit {} bytes, region cap {} bytes, initial region {} bytes",
            config.name,
            device.name(),
            memory_limit,
            growth.region_cap(),
            growth.current_target()
        );

        Ok(BfcAllocator {
            name: config.name,
            device,
            min_allocation_size,
            state: Mutex::new(BfcState {
                min_allocation_size,
                fragmentation_threshold: config.fragmentation_threshold,
                chunks: ChunkTable::new(),
                bins,
                regions: RegionMap::new(),
                growth,
                next_allocation_id: 0,
                num_allocs: 0,
                bytes_in_use: 0,
                peak_bytes_in_use: 0,
                largest_alloc_size: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn min_allocation_size(&self) -> usize {
        self.min_allocation_size
    }

    /// Round `bytes` up to the allocation granularity
    pub fn rounded_bytes(&self, bytes: usize) -> usize {
        round_up(bytes, self.min_allocation_size)
    }

    /// Allocate `num_bytes` of device memory.
    ///
    /// Returns `None` for zero-byte requests and when the pool cannot supply
    /// the memory; the caller may retry after freeing.
    pub fn allocate(&self, num_bytes: usize) -> Option<DevicePtr> {
        self.try_allocate(num_bytes).ok()
    }

    /// Allocate `num_bytes`, reporting why an allocation failed.
    pub fn try_allocate(&self, num_bytes: usize) -> BfcResult<DevicePtr> {
        if num_bytes == 0 {
            tracing::trace!("Allocator {}: tried to allocate 0 bytes", self.name);
            return Err(BfcError::ZeroSizeRequest);
        }
        let Some(rounded_bytes) = checked_round_up(num_bytes, self.min_allocation_size) else {
            tracing::error!(
                "Allocator {} ran out of memory trying to allocate {} bytes: size not representable",
                self.name,
                num_bytes
            );
            return Err(BfcError::OutOfMemory {
                requested: num_bytes,
                rounded: num_bytes,
            });
        };

        let mut state = self.lock_or_abort();

        if let Some(ptr) = state.find_chunk_ptr(rounded_bytes, num_bytes) {
            self.trace_allocation(num_bytes, rounded_bytes, ptr);
            return Ok(ptr);
        }

        match state.extend(self.device.as_ref(), rounded_bytes) {
            Ok(()) => {
                if let Some(ptr) = state.find_chunk_ptr(rounded_bytes, num_bytes) {
                    self.trace_allocation(num_bytes, rounded_bytes, ptr);
                    return Ok(ptr);
                }
            }
            Err(err) => {
                tracing::debug!("Allocator {}: region growth failed: {}", self.name, err);
            }
        }

        tracing::error!(
            "Allocator {} ran out of memory trying to allocate {} bytes (rounded to {} bytes)",
            self.name,
            num_bytes,
            rounded_bytes
        );
        for summary in state.bins.summaries() {
            tracing::debug!(
                "Bin {} (>= {} bytes): {} free chunks, {} free bytes",
                summary.bin_num,
                summary.bin_size,
                summary.free_chunks,
                summary.free_bytes
            );
        }

        Err(BfcError::OutOfMemory {
            requested: num_bytes,
            rounded: rounded_bytes,
        })
    }

    fn trace_allocation(&self, num_bytes: usize, rounded_bytes: usize, ptr: DevicePtr) {
        tracing::trace!(
            "Requested bytes: {}, allocated_bytes: {}, allocator_name: {}, ptr: {}",
            num_bytes,
            rounded_bytes,
            self.name,
            ptr
        );
    }

    /// Return memory obtained from `allocate`.
    ///
    /// Freeing the null pointer does nothing.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` was not returned by this allocator or was already freed.
    pub fn free(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            tracing::trace!("Allocator {}: tried to free null", self.name);
            return;
        }
        tracing::trace!("Allocator {}: free {}", self.name, ptr);
        let mut state = self.lock_or_abort();
        state.deallocate(ptr);
    }

    /// Size the caller asked for when `ptr` was allocated
    pub fn requested_size(&self, ptr: DevicePtr) -> usize {
        self.lock_or_abort().live_chunk(ptr).requested_size
    }

    /// Size of the chunk backing `ptr`; at least the requested size
    pub fn allocated_size(&self, ptr: DevicePtr) -> usize {
        self.lock_or_abort().live_chunk(ptr).size
    }

    /// Allocation id assigned to `ptr`
    pub fn allocation_id(&self, ptr: DevicePtr) -> u64 {
        let state = self.lock_or_abort();
        let chunk = state.live_chunk(ptr);
        match chunk.allocation_id {
            Some(id) => id,
            None => panic!("{} is not in use", ptr),
        }
    }

    /// Snapshot of allocator counters
    pub fn stats(&self) -> BfcResult<AllocatorStats> {
        let state = self.state.lock()?;
        Ok(AllocatorStats {
            num_allocs: state.num_allocs,
            bytes_in_use: state.bytes_in_use,
            peak_bytes_in_use: state.peak_bytes_in_use,
            largest_alloc_size: state.largest_alloc_size,
            bytes_reserved: state.growth.total_reserved(),
            bytes_limit: state.growth.memory_limit(),
            num_regions: state.regions.regions().len(),
            free_chunk_count: state.bins.free_chunk_count(),
        })
    }

    /// Free-chunk counts for every non-empty bin
    pub fn bin_summaries(&self) -> BfcResult<Vec<BinSummary>> {
        Ok(self.state.lock()?.bins.summaries())
    }

    /// Check every structural invariant of the chunk graph.
    pub fn validate_invariants(&self) -> BfcResult<()> {
        self.state.lock()?.check_invariants()
    }

    fn lock_or_abort(&self) -> MutexGuard<'_, BfcState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(err) => panic!("allocator {} state is unusable: {}", self.name, err),
        }
    }
}

impl Drop for BfcAllocator {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let regions = state.regions.take_regions();
        tracing::debug!(
            "Allocator {}: releasing {} regions to {}",
            self.name,
            regions.len(),
            self.device.name()
        );
        for region in regions {
            if let Err(err) = self.device.release(region.base()) {
                tracing::error!(
                    "Allocator {}: failed to release region {} ({} bytes): {}",
                    self.name,
                    region.base(),
                    region.size(),
                    err
                );
            }
        }
    }
}

impl BfcState {
    fn key(&self, h: ChunkHandle) -> FreeChunkKey {
        let chunk = &self.chunks[h];
        FreeChunkKey {
            size: chunk.size,
            ptr: chunk.ptr,
            handle: h,
        }
    }

    fn find_chunk_ptr(&mut self, rounded_bytes: usize, num_bytes: usize) -> Option<DevicePtr> {
        let start = self.bins.bin_for_size(rounded_bytes);
        let (_, key) = self.bins.find_fit(start, rounded_bytes)?;
        let h = key.handle;
        self.remove_free_chunk_from_bin(h);

        // Split when the remainder is worth keeping; otherwise hand out the
        // whole chunk and accept the padding.
        let size = self.chunks[h].size;
        let twice = rounded_bytes.checked_mul(2);
        if twice.is_some_and(|twice| size >= twice)
            || size - rounded_bytes >= self.fragmentation_threshold
        {
            self.split_chunk(h, rounded_bytes);
        }

        let id = self.next_allocation_id;
        self.next_allocation_id += 1;

        let chunk = &mut self.chunks[h];
        chunk.requested_size = num_bytes;
        chunk.allocation_id = Some(id);
        let (ptr, size) = (chunk.ptr, chunk.size);

        self.num_allocs += 1;
        self.bytes_in_use += size;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
        self.largest_alloc_size = self.largest_alloc_size.max(size);
        Some(ptr)
    }

    fn split_chunk(&mut self, h: ChunkHandle, num_bytes: usize) {
        let new_h = self.chunks.allocate();

        let (ptr, size, next) = {
            let c = &self.chunks[h];
            assert!(
                !c.in_use() && c.bin_num.is_none(),
                "splitting chunk {} that is in use or binned",
                h
            );
            (c.ptr, c.size, c.next)
        };

        let new_ptr = ptr.offset(num_bytes);
        self.regions.set_handle(new_ptr, new_h);

        // c <-> neighbor becomes c <-> new <-> neighbor
        {
            let new_chunk = &mut self.chunks[new_h];
            new_chunk.ptr = new_ptr;
            new_chunk.size = size - num_bytes;
            new_chunk.prev = Some(h);
            new_chunk.next = next;
        }
        {
            let c = &mut self.chunks[h];
            c.size = num_bytes;
            c.next = Some(new_h);
        }
        if let Some(n) = next {
            self.chunks[n].prev = Some(new_h);
        }

        self.insert_free_chunk_into_bin(new_h);
    }

    fn insert_free_chunk_into_bin(&mut self, h: ChunkHandle) {
        let c = &self.chunks[h];
        assert!(
            !c.in_use() && c.bin_num.is_none(),
            "inserting chunk {} that is in use or already binned",
            h
        );
        let b = self.bins.bin_for_size(c.size);
        let key = self.key(h);
        self.chunks[h].bin_num = Some(b);
        self.bins.insert(b, key);
    }

    fn remove_free_chunk_from_bin(&mut self, h: ChunkHandle) {
        let key = self.key(h);
        let c = &mut self.chunks[h];
        assert!(!c.in_use(), "removing in-use chunk {} from its bin", h);
        let b = match c.bin_num.take() {
            Some(b) => b,
            None => panic!("free chunk {} is not in any bin", h),
        };
        self.bins.remove(b, key);
    }

    fn deallocate(&mut self, ptr: DevicePtr) {
        let h = match self.regions.handle_at(ptr) {
            Some(h) => h,
            None => match self.regions.resolve(ptr) {
                Some(owner) => panic!(
                    "freeing {} which points inside chunk {} at {}",
                    ptr, owner, self.chunks[owner].ptr
                ),
                None => panic!("freeing {} which was not allocated by this allocator", ptr),
            },
        };

        let chunk = &mut self.chunks[h];
        assert!(chunk.in_use(), "double free of {}", ptr);
        chunk.allocation_id = None;
        let size = chunk.size;
        self.bytes_in_use -= size;

        let coalesced = self.try_to_coalesce(h);
        self.insert_free_chunk_into_bin(coalesced);
    }

    fn try_to_coalesce(&mut self, h: ChunkHandle) -> ChunkHandle {
        let mut coalesced = h;

        if let Some(n) = self.chunks[h].next {
            if !self.chunks[n].in_use() {
                tracing::trace!(
                    "Merging next {} into {}",
                    self.chunks[n].ptr,
                    self.chunks[h].ptr
                );
                self.remove_free_chunk_from_bin(n);
                self.merge(h, n);
            }
        }

        if let Some(p) = self.chunks[h].prev {
            if !self.chunks[p].in_use() {
                tracing::trace!(
                    "Merging {} into prev {}",
                    self.chunks[h].ptr,
                    self.chunks[p].ptr
                );
                coalesced = p;
                self.remove_free_chunk_from_bin(p);
                self.merge(p, h);
            }
        }

        coalesced
    }

    /// Merge `h2` into `h1`, where `h2` directly follows `h1`.
    fn merge(&mut self, h1: ChunkHandle, h2: ChunkHandle) {
        let (h3, size2) = {
            let c2 = &self.chunks[h2];
            assert!(!c2.in_use(), "merging in-use chunk {}", h2);
            assert!(c2.prev == Some(h1), "chunk {} does not follow {}", h2, h1);
            (c2.next, c2.size)
        };
        {
            let c1 = &mut self.chunks[h1];
            assert!(!c1.in_use(), "merging in-use chunk {}", h1);
            c1.next = h3;
            c1.size += size2;
        }
        if let Some(h3) = h3 {
            self.chunks[h3].prev = Some(h1);
        }
        self.delete_chunk(h2);
    }

    fn delete_chunk(&mut self, h: ChunkHandle) {
        let ptr = self.chunks[h].ptr;
        self.regions.erase(ptr);
        self.chunks.deallocate(h);
    }

    fn extend(&mut self, device: &dyn Device, rounded_bytes: usize) -> BfcResult<()> {
        let grant = self.growth.extend(device, rounded_bytes)?;

        let h = self.chunks.allocate();
        {
            let c = &mut self.chunks[h];
            c.ptr = grant.base;
            c.size = grant.size;
        }
        self.regions.register(grant.base, grant.size, h);
        self.insert_free_chunk_into_bin(h);
        Ok(())
    }

    fn live_chunk(&self, ptr: DevicePtr) -> &Chunk {
        match self.regions.handle_at(ptr) {
            Some(h) if self.chunks[h].in_use() => &self.chunks[h],
            _ => panic!("{} is not a live allocation", ptr),
        }
    }

    fn check_invariants(&self) -> BfcResult<()> {
        let mut visited = 0usize;
        let mut in_use_bytes = 0usize;
        let mut free_chunks = 0usize;

        for region in self.regions.regions() {
            let mut cursor = self.regions.handle_at(region.base()).ok_or_else(|| {
                internal_error!("region at {} has no chunk at its base", region.base())
            })?;
            let mut prev: Option<ChunkHandle> = None;
            let mut prev_free = false;
            let mut expected_ptr = region.base();
            let mut covered = 0usize;

            loop {
                let c = self
                    .chunks
                    .get(cursor)
                    .ok_or_else(|| internal_error!("dangling chunk handle {}", cursor))?;
                visited += 1;

                if c.ptr != expected_ptr {
                    return Err(internal_error!(
                        "chunk {} at {} but previous chunk ends at {}",
                        cursor,
                        c.ptr,
                        expected_ptr
                    ));
                }
                if c.prev != prev {
                    return Err(internal_error!(
                        "chunk {} prev link {:?} does not match {:?}",
                        cursor,
                        c.prev,
                        prev
                    ));
                }
                if c.size == 0 || c.size % self.min_allocation_size != 0 {
                    return Err(internal_error!("chunk {} has bad size {}", cursor, c.size));
                }
                if self.regions.handle_at(c.ptr) != Some(cursor) {
                    return Err(internal_error!(
                        "region map does not point {} at chunk {}",
                        c.ptr,
                        cursor
                    ));
                }
                self.check_bin_membership(cursor, c)?;

                if c.in_use() {
                    in_use_bytes += c.size;
                    prev_free = false;
                } else {
                    if prev_free {
                        return Err(internal_error!(
                            "free chunk {} follows another free chunk",
                            cursor
                        ));
                    }
                    free_chunks += 1;
                    prev_free = true;
                }

                covered += c.size;
                expected_ptr = c.end();
                prev = Some(cursor);
                match c.next {
                    Some(n) => cursor = n,
                    None => break,
                }
            }

            if covered != region.size() {
                return Err(internal_error!(
                    "chunks cover {} of {} bytes in region {}",
                    covered,
                    region.size(),
                    region.base()
                ));
            }
        }

        if visited != self.chunks.live_count() || visited != self.regions.chunk_count() {
            return Err(internal_error!(
                "{} chunks reachable from regions, {} live records, {} mapped",
                visited,
                self.chunks.live_count(),
                self.regions.chunk_count()
            ));
        }
        if free_chunks != self.bins.free_chunk_count() {
            return Err(internal_error!(
                "{} free chunks but bins hold {}",
                free_chunks,
                self.bins.free_chunk_count()
            ));
        }
        if in_use_bytes != self.bytes_in_use {
            return Err(internal_error!(
                "{} bytes in use by chunks but counter says {}",
                in_use_bytes,
                self.bytes_in_use
            ));
        }
        let region_bytes: usize = self.regions.regions().iter().map(|r| r.size()).sum();
        if region_bytes != self.growth.total_reserved() {
            return Err(internal_error!(
                "regions hold {} bytes but {} were reserved",
                region_bytes,
                self.growth.total_reserved()
            ));
        }
        Ok(())
    }

    fn check_bin_membership(&self, h: ChunkHandle, c: &Chunk) -> BfcResult<()> {
        match (c.in_use(), c.bin_num) {
            (true, None) => Ok(()),
            (true, Some(b)) => Err(internal_error!("in-use chunk {} sits in bin {}", h, b)),
            (false, None) => Err(internal_error!("free chunk {} is in no bin", h)),
            (false, Some(b)) => {
                if b != self.bins.bin_for_size(c.size) {
                    return Err(internal_error!(
                        "chunk {} of {} bytes is in bin {}",
                        h,
                        c.size,
                        b
                    ));
                }
                if !self.bins.contains(b, &self.key(h)) {
                    return Err(internal_error!("chunk {} missing from bin {}", h, b));
                }
                Ok(())
            }
        }
    }
}
