//! Allocator that never touches memory.
//!
//! Replaying against it measures decode and tag-table cost alone.

use super::{AllocError, ReplayAllocator};

const FIRST_HANDLE: usize = 0x1000;
const HANDLE_STRIDE: usize = 16;

/// Hands out distinct synthetic handles.
#[derive(Debug, Clone)]
pub struct NullAllocator {
    next: usize,
    live: usize,
}

impl NullAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: FIRST_HANDLE,
            live: 0,
        }
    }

    /// Allocations not yet released.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live
    }

    fn fresh(&mut self, size: usize) -> Result<usize, AllocError> {
        let handle = self.next;
        self.next = self
            .next
            .checked_add(HANDLE_STRIDE)
            .ok_or(AllocError::OutOfMemory {
                allocator: "null",
                size,
            })?;
        Ok(handle)
    }
}

impl Default for NullAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayAllocator for NullAllocator {
    type Handle = usize;

    fn name(&self) -> &'static str {
        "null"
    }

    fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        let handle = self.fresh(size)?;
        self.live += 1;
        Ok(handle)
    }

    fn resize(&mut self, _handle: usize, size: usize) -> Result<usize, AllocError> {
        self.fresh(size)
    }

    fn release(&mut self, _handle: usize) -> Result<(), AllocError> {
        self.live = self.live.saturating_sub(1);
        Ok(())
    }
}
