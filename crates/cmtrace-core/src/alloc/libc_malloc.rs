//! The process allocator, reached through `libc`.
//!
//! This is what a replay normally measures: whichever `malloc` the
//! replaying binary is linked or preloaded against.

use std::collections::HashSet;
use std::ffi::c_void;

use super::{AllocError, ReplayAllocator};

/// `malloc`/`realloc`/`free` from the C library.
///
/// Blocks still live when the allocator is dropped are freed then, so a
/// trace with never-freed allocations does not leak past the replay.
#[derive(Debug, Default)]
pub struct LibcAllocator {
    live: HashSet<usize>,
}

impl LibcAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations not yet released.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.len()
    }

    fn check_live(&self, handle: usize) -> Result<(), AllocError> {
        if self.live.contains(&handle) {
            Ok(())
        } else {
            Err(AllocError::UnknownHandle {
                allocator: "libc",
                handle: format!("{handle:x}"),
            })
        }
    }
}

impl ReplayAllocator for LibcAllocator {
    type Handle = usize;

    fn name(&self) -> &'static str {
        "libc"
    }

    fn allocate(&mut self, size: usize) -> Result<usize, AllocError> {
        // SAFETY: malloc has no preconditions; a null result is handled below.
        let ptr = unsafe { libc::malloc(size) };
        if ptr.is_null() {
            return Err(AllocError::OutOfMemory {
                allocator: "libc",
                size,
            });
        }
        let handle = ptr as usize;
        self.live.insert(handle);
        Ok(handle)
    }

    fn resize(&mut self, handle: usize, size: usize) -> Result<usize, AllocError> {
        self.check_live(handle)?;
        // SAFETY: `handle` came from malloc/realloc and has not been freed
        // (it is still in `live`).
        let ptr = unsafe { libc::realloc(handle as *mut c_void, size) };
        if ptr.is_null() {
            // The old block is untouched on failure.
            return Err(AllocError::OutOfMemory {
                allocator: "libc",
                size,
            });
        }
        self.live.remove(&handle);
        let new_handle = ptr as usize;
        self.live.insert(new_handle);
        Ok(new_handle)
    }

    fn release(&mut self, handle: usize) -> Result<(), AllocError> {
        self.check_live(handle)?;
        self.live.remove(&handle);
        // SAFETY: `handle` is a live malloc/realloc result, removed from
        // `live` so it cannot be freed twice.
        unsafe { libc::free(handle as *mut c_void) };
        Ok(())
    }
}

impl Drop for LibcAllocator {
    fn drop(&mut self) {
        for handle in self.live.drain() {
            // SAFETY: every handle in `live` is an unfreed malloc/realloc result.
            unsafe { libc::free(handle as *mut c_void) };
        }
    }
}
