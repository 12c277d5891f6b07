//! Allocators a compact trace can be replayed against.
//!
//! The replayer only needs the [`ReplayAllocator`] capability. Four
//! implementations ship with the crate:
//! - [`LibcAllocator`]: the process `malloc`/`realloc`/`free`
//! - [`BumpAllocator`]: pointer bumping, release is a no-op
//! - [`SizeClassAllocator`]: size-class free lists over an offset space
//! - [`NullAllocator`]: synthetic handles, no memory at all

pub mod bump;
#[allow(unsafe_code)]
pub mod libc_malloc;
pub mod null;
pub mod size_class;

use std::fmt;
use std::hash::Hash;

use thiserror::Error;

pub use bump::BumpAllocator;
pub use libc_malloc::LibcAllocator;
pub use null::NullAllocator;
pub use size_class::{SizeClassAllocator, SizeClassStats};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("{allocator}: out of memory allocating {size} bytes")]
    OutOfMemory {
        allocator: &'static str,
        size: usize,
    },
    #[error("{allocator}: handle {handle} was not allocated here")]
    UnknownHandle {
        allocator: &'static str,
        handle: String,
    },
}

/// Allocate/resize/release capability driven by the replayer.
pub trait ReplayAllocator {
    /// Identity of one allocation. Live handles must be distinct.
    type Handle: Copy + Eq + Hash + fmt::LowerHex + fmt::Debug;

    /// Short name used in logs and reports.
    fn name(&self) -> &'static str;

    fn allocate(&mut self, size: usize) -> Result<Self::Handle, AllocError>;

    /// Resize `handle` to `size` bytes. The returned handle replaces the
    /// old one, which must not be used again.
    fn resize(&mut self, handle: Self::Handle, size: usize) -> Result<Self::Handle, AllocError>;

    fn release(&mut self, handle: Self::Handle) -> Result<(), AllocError>;
}

impl<A: ReplayAllocator + ?Sized> ReplayAllocator for &mut A {
    type Handle = A::Handle;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn allocate(&mut self, size: usize) -> Result<Self::Handle, AllocError> {
        (**self).allocate(size)
    }

    fn resize(&mut self, handle: Self::Handle, size: usize) -> Result<Self::Handle, AllocError> {
        (**self).resize(handle, size)
    }

    fn release(&mut self, handle: Self::Handle) -> Result<(), AllocError> {
        (**self).release(handle)
    }
}

/// Round `size` up to the next multiple of `align` (a power of two).
pub(crate) const fn round_up(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(padded) => Some(padded & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_alignment() {
        assert_eq!(round_up(0, 8), Some(0));
        assert_eq!(round_up(1, 8), Some(8));
        assert_eq!(round_up(8, 8), Some(8));
        assert_eq!(round_up(13, 16), Some(16));
        assert_eq!(round_up(usize::MAX, 8), None);
    }

    #[test]
    fn mutable_reference_forwards_calls() {
        let mut inner = NullAllocator::new();
        let by_ref: &mut NullAllocator = &mut inner;
        let handle = by_ref.allocate(8).unwrap();
        by_ref.release(handle).unwrap();
        assert_eq!(ReplayAllocator::name(&by_ref), "null");
        assert_eq!(inner.live(), 0);
    }
}
