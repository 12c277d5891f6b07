//! Size-class allocator over a logical offset space.
//!
//! Small requests (up to 32 KiB) are served from per-class magazines, then
//! the central free list of that class, then fresh slab space. Larger
//! requests are rounded to whole pages and recycled by exact page count.
//! No bytes are backed; handles are offsets, which is all a replay needs to
//! compare placement policies.

use std::collections::{BTreeMap, HashMap};

use super::{AllocError, ReplayAllocator, round_up};

/// Largest request served by a size class.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Granularity of the large path.
pub const PAGE_SIZE: usize = 4096;

/// Blocks a magazine holds before frees spill to the central list.
const MAGAZINE_CAPACITY: usize = 32;

/// Classes: 16-byte steps to 128, then powers of two to `MAX_SMALL_SIZE`.
const CLASS_SIZES: [usize; 16] = [
    16, 32, 48, 64, 80, 96, 112, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768,
];

pub const NUM_SIZE_CLASSES: usize = CLASS_SIZES.len();

/// Size-class index for `size`, or `NUM_SIZE_CLASSES` for the large path.
#[must_use]
pub fn bin_index(size: usize) -> usize {
    CLASS_SIZES
        .iter()
        .position(|class| size <= *class)
        .unwrap_or(NUM_SIZE_CLASSES)
}

#[derive(Debug, Clone, Copy)]
struct AllocationRecord {
    /// Size requested by the caller.
    user_size: usize,
    /// Size class (`NUM_SIZE_CLASSES` for large).
    bin: usize,
    /// Bytes reserved for the block.
    block_size: usize,
}

/// Usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeClassStats {
    pub active_count: usize,
    /// User-requested bytes currently live.
    pub total_allocated: usize,
    pub peak_allocated: usize,
    /// Offset space consumed so far (high-water of the slab).
    pub footprint: usize,
    pub magazine_hits: u64,
    pub central_bin_hits: u64,
    pub fresh_carves: u64,
    pub large_reuses: u64,
    pub spills_to_central: u64,
    pub in_place_resizes: u64,
    pub moved_resizes: u64,
}

/// Single-threaded size-class allocator.
#[derive(Debug, Clone)]
pub struct SizeClassAllocator {
    magazines: Vec<Vec<usize>>,
    central_bins: Vec<Vec<usize>>,
    /// Free large blocks keyed by page-rounded size.
    large_free: BTreeMap<usize, Vec<usize>>,
    active: HashMap<usize, AllocationRecord>,
    base: usize,
    next_offset: usize,
    stats: SizeClassStats,
}

impl SizeClassAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magazines: vec![Vec::new(); NUM_SIZE_CLASSES],
            central_bins: vec![Vec::new(); NUM_SIZE_CLASSES],
            large_free: BTreeMap::new(),
            active: HashMap::new(),
            base: PAGE_SIZE, // Start above zero page
            next_offset: PAGE_SIZE,
            stats: SizeClassStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> SizeClassStats {
        self.stats
    }

    /// User size of the live allocation at `ptr`.
    #[must_use]
    pub fn lookup(&self, ptr: usize) -> Option<usize> {
        self.active.get(&ptr).map(|r| r.user_size)
    }

    fn oom(size: usize) -> AllocError {
        AllocError::OutOfMemory {
            allocator: "size-class",
            size,
        }
    }

    fn carve(&mut self, block_size: usize, size: usize) -> Result<usize, AllocError> {
        let offset = self.next_offset;
        self.next_offset = self
            .next_offset
            .checked_add(block_size)
            .ok_or_else(|| Self::oom(size))?;
        self.stats.fresh_carves += 1;
        self.stats.footprint = self.next_offset - self.base;
        Ok(offset)
    }

    fn take_block(&mut self, size: usize) -> Result<(usize, AllocationRecord), AllocError> {
        let size = size.max(1);
        let bin = bin_index(size);

        if bin >= NUM_SIZE_CLASSES {
            let block_size = round_up(size, PAGE_SIZE).ok_or_else(|| Self::oom(size))?;
            let reused = self.large_free.get_mut(&block_size).and_then(Vec::pop);
            let offset = match reused {
                Some(offset) => {
                    self.stats.large_reuses += 1;
                    offset
                }
                None => self.carve(block_size, size)?,
            };
            return Ok((
                offset,
                AllocationRecord {
                    user_size: size,
                    bin,
                    block_size,
                },
            ));
        }

        let block_size = CLASS_SIZES[bin];
        let offset = if let Some(offset) = self.magazines[bin].pop() {
            self.stats.magazine_hits += 1;
            offset
        } else if let Some(offset) = self.central_bins[bin].pop() {
            self.stats.central_bin_hits += 1;
            offset
        } else {
            self.carve(block_size, size)?
        };
        Ok((
            offset,
            AllocationRecord {
                user_size: size,
                bin,
                block_size,
            },
        ))
    }

    fn insert_active(&mut self, offset: usize, record: AllocationRecord) {
        self.active.insert(offset, record);
        self.stats.active_count += 1;
        self.stats.total_allocated += record.user_size;
        self.stats.peak_allocated = self.stats.peak_allocated.max(self.stats.total_allocated);
    }

    fn remove_active(&mut self, ptr: usize) -> Result<AllocationRecord, AllocError> {
        let record = self
            .active
            .remove(&ptr)
            .ok_or_else(|| AllocError::UnknownHandle {
                allocator: "size-class",
                handle: format!("{ptr:x}"),
            })?;
        self.stats.active_count -= 1;
        self.stats.total_allocated -= record.user_size;
        Ok(record)
    }

    fn recycle(&mut self, ptr: usize, record: AllocationRecord) {
        if record.bin >= NUM_SIZE_CLASSES {
            self.large_free
                .entry(record.block_size)
                .or_default()
                .push(ptr);
            return;
        }
        let magazine = &mut self.magazines[record.bin];
        if magazine.len() < MAGAZINE_CAPACITY {
            magazine.push(ptr);
        } else {
            self.central_bins[record.bin].push(ptr);
            self.stats.spills_to_central += 1;
        }
    }
}

impl Default for SizeClassAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayAllocator for SizeClassAllocator {
    type Handle = usize;

    fn name(&self) -> &'static str {
        "size-class"
    }

    fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        let (offset, record) = self.take_block(size)?;
        self.insert_active(offset, record);
        Ok(offset)
    }

    fn resize(&mut self, ptr: usize, size: usize) -> Result<usize, AllocError> {
        let old = self.remove_active(ptr)?;
        let size = size.max(1);
        let new_bin = bin_index(size);

        // Same class, or a large block that still fits its pages: keep it.
        let fits_in_place = if new_bin < NUM_SIZE_CLASSES {
            new_bin == old.bin
        } else {
            old.bin >= NUM_SIZE_CLASSES && size <= old.block_size
        };
        if fits_in_place {
            self.insert_active(
                ptr,
                AllocationRecord {
                    user_size: size,
                    ..old
                },
            );
            self.stats.in_place_resizes += 1;
            return Ok(ptr);
        }

        let (offset, record) = match self.take_block(size) {
            Ok(block) => block,
            Err(err) => {
                self.insert_active(ptr, old);
                return Err(err);
            }
        };
        self.insert_active(offset, record);
        self.recycle(ptr, old);
        self.stats.moved_resizes += 1;
        Ok(offset)
    }

    fn release(&mut self, ptr: usize) -> Result<(), AllocError> {
        let record = self.remove_active(ptr)?;
        self.recycle(ptr, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_index_boundaries() {
        assert_eq!(bin_index(1), 0);
        assert_eq!(bin_index(16), 0);
        assert_eq!(bin_index(17), 1);
        assert_eq!(bin_index(129), 8);
        assert_eq!(bin_index(MAX_SMALL_SIZE), NUM_SIZE_CLASSES - 1);
        assert_eq!(bin_index(MAX_SMALL_SIZE + 1), NUM_SIZE_CLASSES);
    }

    #[test]
    fn allocate_and_release_track_usage() {
        let mut alloc = SizeClassAllocator::new();
        let ptr = alloc.allocate(100).unwrap();
        assert_ne!(ptr, 0);
        assert_eq!(alloc.lookup(ptr), Some(100));
        assert_eq!(alloc.stats().active_count, 1);
        assert_eq!(alloc.stats().total_allocated, 100);
        alloc.release(ptr).unwrap();
        assert_eq!(alloc.stats().active_count, 0);
        assert_eq!(alloc.stats().total_allocated, 0);
        assert_eq!(alloc.stats().peak_allocated, 100);
    }

    #[test]
    fn freed_block_is_reused_lifo() {
        let mut alloc = SizeClassAllocator::new();
        let a = alloc.allocate(64).unwrap();
        let b = alloc.allocate(64).unwrap();
        alloc.release(a).unwrap();
        alloc.release(b).unwrap();
        assert_eq!(alloc.allocate(60).unwrap(), b);
        assert_eq!(alloc.allocate(60).unwrap(), a);
        assert_eq!(alloc.stats().magazine_hits, 2);
    }

    #[test]
    fn magazine_overflow_spills_to_central_bin() {
        let mut alloc = SizeClassAllocator::new();
        let ptrs: Vec<usize> = (0..MAGAZINE_CAPACITY + 4)
            .map(|_| alloc.allocate(32).unwrap())
            .collect();
        for ptr in &ptrs {
            alloc.release(*ptr).unwrap();
        }
        assert_eq!(alloc.stats().spills_to_central, 4);
        for _ in 0..MAGAZINE_CAPACITY + 1 {
            alloc.allocate(32).unwrap();
        }
        assert_eq!(alloc.stats().central_bin_hits, 1);
    }

    #[test]
    fn resize_within_class_stays_in_place() {
        let mut alloc = SizeClassAllocator::new();
        let ptr = alloc.allocate(20).unwrap();
        assert_eq!(alloc.resize(ptr, 30).unwrap(), ptr);
        assert_eq!(alloc.lookup(ptr), Some(30));
        assert_eq!(alloc.stats().in_place_resizes, 1);
    }

    #[test]
    fn resize_across_classes_moves() {
        let mut alloc = SizeClassAllocator::new();
        let ptr = alloc.allocate(20).unwrap();
        let moved = alloc.resize(ptr, 600).unwrap();
        assert_ne!(moved, ptr);
        assert_eq!(alloc.lookup(ptr), None);
        assert_eq!(alloc.lookup(moved), Some(600));
        assert_eq!(alloc.stats().moved_resizes, 1);
        assert_eq!(alloc.stats().total_allocated, 600);
    }

    #[test]
    fn large_blocks_recycle_by_page_count() {
        let mut alloc = SizeClassAllocator::new();
        let big = alloc.allocate(MAX_SMALL_SIZE + 1).unwrap();
        alloc.release(big).unwrap();
        let again = alloc.allocate(MAX_SMALL_SIZE + 100).unwrap();
        assert_eq!(again, big);
        assert_eq!(alloc.stats().large_reuses, 1);
    }

    #[test]
    fn unknown_pointer_is_rejected() {
        let mut alloc = SizeClassAllocator::new();
        assert!(matches!(
            alloc.release(0xDEAD),
            Err(AllocError::UnknownHandle { .. })
        ));
        assert!(alloc.resize(0xDEAD, 8).is_err());
    }
}
