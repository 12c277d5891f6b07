//! Bump-the-pointer allocator.
//!
//! The baseline every real allocator is compared against: each request is
//! carved from the end of one arena, nothing is ever reused and release is
//! free. Sizes are rounded up to 8 bytes.

use super::{AllocError, ReplayAllocator, round_up};

const ALIGN: usize = 8;

/// First handle value; keeps handle `0` distinct from any allocation.
const ARENA_BASE: usize = 0x1000;

/// Default arena limit (1 GiB).
pub const DEFAULT_ARENA_LIMIT: usize = 1 << 30;

/// Arena-backed bump allocator. Handles are `ARENA_BASE + offset`.
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    arena: Vec<u8>,
    limit: usize,
    next: usize,
    allocations: u64,
}

impl BumpAllocator {
    /// Create an allocator whose arena may grow up to `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            arena: Vec::new(),
            limit,
            next: 0,
            allocations: 0,
        }
    }

    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_ARENA_LIMIT)
    }

    /// Bytes consumed from the arena so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.next
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of blocks carved (allocations plus resizes).
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Contents of the block at `handle`, `len` bytes long.
    #[must_use]
    pub fn bytes(&self, handle: usize, len: usize) -> Option<&[u8]> {
        let start = handle.checked_sub(ARENA_BASE)?;
        self.arena.get(start..start.checked_add(len)?)
    }

    /// Mutable view of the block at `handle`.
    pub fn bytes_mut(&mut self, handle: usize, len: usize) -> Option<&mut [u8]> {
        let start = handle.checked_sub(ARENA_BASE)?;
        self.arena.get_mut(start..start.checked_add(len)?)
    }

    fn carve(&mut self, size: usize) -> Result<usize, AllocError> {
        let oom = AllocError::OutOfMemory {
            allocator: "bump",
            size,
        };
        let rounded = round_up(size, ALIGN).ok_or_else(|| oom.clone())?;
        let end = self.next.checked_add(rounded).ok_or_else(|| oom.clone())?;
        if end > self.limit {
            return Err(oom);
        }

        let offset = self.next;
        self.next = end;
        if self.arena.len() < end {
            self.arena.resize(end, 0);
        }
        self.allocations += 1;
        Ok(ARENA_BASE + offset)
    }

    fn offset_of(&self, handle: usize) -> Result<usize, AllocError> {
        handle
            .checked_sub(ARENA_BASE)
            .filter(|offset| *offset < self.next)
            .ok_or_else(|| AllocError::UnknownHandle {
                allocator: "bump",
                handle: format!("{handle:x}"),
            })
    }
}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayAllocator for BumpAllocator {
    type Handle = usize;

    fn name(&self) -> &'static str {
        "bump"
    }

    fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        self.carve(size)
    }

    fn resize(&mut self, handle: usize, size: usize) -> Result<usize, AllocError> {
        let old = self.offset_of(handle)?;
        let new_handle = self.carve(size)?;
        let new = new_handle - ARENA_BASE;
        // The new block lies past the old one, so `old + size` stays inside
        // the arena even when the old block was smaller than `size`.
        self.arena.copy_within(old..old + size, new);
        Ok(new_handle)
    }

    fn release(&mut self, handle: usize) -> Result<(), AllocError> {
        self.offset_of(handle).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up_to_eight() {
        let mut alloc = BumpAllocator::new();
        let a = alloc.allocate(1).unwrap();
        let b = alloc.allocate(13).unwrap();
        let c = alloc.allocate(8).unwrap();
        assert_eq!(b - a, 8);
        assert_eq!(c - b, 16);
        assert_eq!(alloc.used(), 32);
    }

    #[test]
    fn resize_moves_and_copies() {
        let mut alloc = BumpAllocator::new();
        let a = alloc.allocate(4).unwrap();
        alloc.bytes_mut(a, 4).unwrap().copy_from_slice(b"abcd");
        let b = alloc.resize(a, 16).unwrap();
        assert!(b > a);
        assert_eq!(&alloc.bytes(b, 16).unwrap()[..4], b"abcd");
        assert_eq!(alloc.allocations(), 2);
    }

    #[test]
    fn release_is_a_noop_but_checks_the_handle() {
        let mut alloc = BumpAllocator::new();
        let a = alloc.allocate(32).unwrap();
        alloc.release(a).unwrap();
        assert_eq!(alloc.used(), 32);
        assert!(matches!(
            alloc.release(0x10),
            Err(AllocError::UnknownHandle { .. })
        ));
    }

    #[test]
    fn arena_limit_is_enforced() {
        let mut alloc = BumpAllocator::with_limit(64);
        alloc.allocate(48).unwrap();
        assert_eq!(
            alloc.allocate(24),
            Err(AllocError::OutOfMemory {
                allocator: "bump",
                size: 24
            })
        );
        alloc.allocate(16).unwrap();
    }
}
