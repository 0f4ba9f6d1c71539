//! Size-class bins of free chunks.
//!
//! Bin `b` holds free chunks whose size lies in `[base * 2^b, base * 2^(b+1))`;
//! the last bin is open-ended. Each bin keeps its chunks ordered by
//! `(size, address)`, so the first entry at or above a requested size is the
//! smallest fitting chunk with the lowest address.

use std::collections::BTreeSet;

use crate::backend::DevicePtr;
use crate::error::{BfcError, BfcResult};

use super::chunk::{BinNum, ChunkHandle};

/// Number of size classes
pub const NUM_BINS: usize = 21;

/// Ordering key of a free chunk within its bin
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeChunkKey {
    pub size: usize,
    pub ptr: DevicePtr,
    pub handle: ChunkHandle,
}

impl FreeChunkKey {
    /// Smallest key with at least `size` bytes
    fn lower_bound(size: usize) -> Self {
        FreeChunkKey {
            size,
            ptr: DevicePtr::NULL,
            handle: ChunkHandle::FIRST,
        }
    }
}

#[derive(Debug)]
struct Bin {
    /// Smallest chunk size this bin holds
    bin_size: usize,
    free_chunks: BTreeSet<FreeChunkKey>,
}

/// Free-chunk counts for one bin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSummary {
    pub bin_num: BinNum,
    pub bin_size: usize,
    pub free_chunks: usize,
    pub free_bytes: usize,
}

/// The fixed set of size-class bins
#[derive(Debug)]
pub struct BinSet {
    base: usize,
    bins: Vec<Bin>,
}

impl BinSet {
    /// Create `NUM_BINS` exponentially sized bins starting at `base` bytes.
    pub fn new(base: usize) -> BfcResult<Self> {
        if base == 0 {
            return Err(BfcError::InvalidConfiguration(
                "bin base size must be > 0".to_string(),
            ));
        }
        // The open-ended last bin still needs its doubled size representable
        if base.checked_mul(1usize << NUM_BINS).is_none() {
            return Err(BfcError::InvalidConfiguration(format!(
                "bin base size {} is too large for {} bins",
                base, NUM_BINS
            )));
        }
        let mut bins = Vec::with_capacity(NUM_BINS);
        for b in 0..NUM_BINS {
            let bin_size = base.checked_mul(1usize << b).ok_or_else(|| {
                BfcError::InvalidConfiguration(format!(
                    "bin {} size overflows for base {}",
                    b, base
                ))
            })?;
            tracing::trace!("Creating bin {} of min chunk size {}", b, bin_size);
            bins.push(Bin {
                bin_size,
                free_chunks: BTreeSet::new(),
            });
        }
        let set = BinSet { base, bins };
        set.verify_layout()?;
        Ok(set)
    }

    /// Size class for a chunk of `size` bytes
    pub fn bin_for_size(&self, size: usize) -> BinNum {
        let v = size.max(self.base) / self.base;
        let log2 = (usize::BITS - 1 - v.leading_zeros()) as usize;
        log2.min(NUM_BINS - 1)
    }

    /// Smallest chunk size held by bin `b`
    pub fn bin_size(&self, b: BinNum) -> usize {
        self.bins[b].bin_size
    }

    /// Check that every bin's range is closed under one rounding step and
    /// that neighbouring bins do not overlap.
    pub fn verify_layout(&self) -> BfcResult<()> {
        for b in 0..NUM_BINS {
            let bin_size = self.bin_size(b);
            let next_size = bin_size
                .checked_mul(2)
                .ok_or_else(|| crate::internal_error!("bin {} size {} overflows", b, bin_size))?;
            let edge_sizes = [bin_size, bin_size + (self.base - 1), next_size - 1];
            for size in edge_sizes {
                if self.bin_for_size(size) != b {
                    return Err(crate::internal_error!(
                        "size {} maps to bin {}, expected bin {}",
                        size,
                        self.bin_for_size(size),
                        b
                    ));
                }
            }
            if b + 1 < NUM_BINS && self.bin_for_size(next_size) == b {
                return Err(crate::internal_error!(
                    "size {} should leave bin {}",
                    next_size,
                    b
                ));
            }
        }
        Ok(())
    }

    /// Add a free chunk to bin `b`. Inserting a chunk twice is a bug.
    pub fn insert(&mut self, b: BinNum, key: FreeChunkKey) {
        let inserted = self.bins[b].free_chunks.insert(key);
        assert!(inserted, "chunk {} already present in bin {}", key.handle, b);
    }

    /// Remove a free chunk from bin `b`. Removing an absent chunk is a bug.
    pub fn remove(&mut self, b: BinNum, key: FreeChunkKey) {
        let removed = self.bins[b].free_chunks.remove(&key);
        assert!(removed, "could not find chunk {} in bin {}", key.handle, b);
    }

    pub fn contains(&self, b: BinNum, key: &FreeChunkKey) -> bool {
        self.bins[b].free_chunks.contains(key)
    }

    /// Smallest, lowest-address free chunk of at least `size` bytes,
    /// searching bins upward from `start`.
    pub fn find_fit(&self, start: BinNum, size: usize) -> Option<(BinNum, FreeChunkKey)> {
        (start..NUM_BINS).find_map(|b| {
            self.bins[b]
                .free_chunks
                .range(FreeChunkKey::lower_bound(size)..)
                .next()
                .map(|key| (b, *key))
        })
    }

    /// Total number of free chunks across all bins
    pub fn free_chunk_count(&self) -> usize {
        self.bins.iter().map(|bin| bin.free_chunks.len()).sum()
    }

    /// Total free bytes across all bins
    pub fn free_bytes(&self) -> usize {
        self.bins
            .iter()
            .flat_map(|bin| bin.free_chunks.iter().map(|key| key.size))
            .sum()
    }

    /// Iterate over every `(bin, key)` pair
    pub fn iter(&self) -> impl Iterator<Item = (BinNum, &FreeChunkKey)> {
        self.bins
            .iter()
            .enumerate()
            .flat_map(|(b, bin)| bin.free_chunks.iter().map(move |key| (b, key)))
    }

    /// Per-bin counts, skipping empty bins
    pub fn summaries(&self) -> Vec<BinSummary> {
        self.bins
            .iter()
            .enumerate()
            .filter(|(_, bin)| !bin.free_chunks.is_empty())
            .map(|(b, bin)| BinSummary {
                bin_num: b,
                bin_size: bin.bin_size,
                free_chunks: bin.free_chunks.len(),
                free_bytes: bin.free_chunks.iter().map(|key| key.size).sum(),
            })
            .collect()
    }
}
