//! Allocator statistics for diagnostics.

use std::fmt;

/// Snapshot of allocator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Successful allocations since construction
    pub num_allocs: u64,
    /// Bytes in chunks currently handed out
    pub bytes_in_use: usize,
    /// Highest `bytes_in_use` observed
    pub peak_bytes_in_use: usize,
    /// Largest single chunk handed out
    pub largest_alloc_size: usize,
    /// Bytes reserved from the device across all regions
    pub bytes_reserved: usize,
    /// Pool limit
    pub bytes_limit: usize,
    /// Regions reserved so far
    pub num_regions: usize,
    /// Free chunks across all bins
    pub free_chunk_count: usize,
}

impl AllocatorStats {
    /// Bytes reserved from the device but not handed out
    pub fn bytes_free(&self) -> usize {
        self.bytes_reserved - self.bytes_in_use
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatorStats: in_use={}KB (peak {}KB), reserved={}KB of {}KB in {} regions, allocs={}, largest={}KB, free_chunks={}",
            self.bytes_in_use / 1024,
            self.peak_bytes_in_use / 1024,
            self.bytes_reserved / 1024,
            self.bytes_limit / 1024,
            self.num_regions,
            self.num_allocs,
            self.largest_alloc_size / 1024,
            self.free_chunk_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_display() {
        let stats = AllocatorStats {
            num_allocs: 3,
            bytes_in_use: 2048,
            peak_bytes_in_use: 4096,
            largest_alloc_size: 1024,
            bytes_reserved: 8192,
            bytes_limit: 1 << 20,
            num_regions: 2,
            free_chunk_count: 1,
        };
        let display = stats.to_string();
        assert!(display.contains("in_use=2KB"));
        assert!(display.contains("2 regions"));
        assert!(display.contains("allocs=3"));
        assert_eq!(stats.bytes_free(), 6144);
    }

    #[test]
    fn test_stats_default_is_empty() {
        let stats = AllocatorStats::default();
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.bytes_free(), 0);
    }
}
