//! The allocator the pool asks for whole blocks.
//!
//! This corresponds to the `SegmentManagerBase` template parameter of
//! Boost.Interprocess's `adaptive_node_pool`, narrowed to the one thing the
//! pool actually needs: aligned allocation/deallocation of whole blocks.
//! Boost's segment manager also hands out shared-memory-relative pointers
//! and tracks per-allocation payload bytes; neither applies to an in-process
//! pool backed by the global Rust allocator, so `PayloadPerAllocation` is
//! fixed at zero (see `DESIGN.md`).

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Supplies and reclaims whole, aligned memory blocks for [`crate::NodePool`].
///
/// # Safety
///
/// Implementations must return memory that is valid for `size` bytes and
/// aligned to `align`, and `deallocate` must accept exactly the `(size,
/// align)` pair a prior `allocate_aligned` call returned memory for.
/// `deallocate` must be infallible and must not panic or unwind (§9 Open
/// Questions: the pool's `totally_free_blocks` invariant assumes the
/// segment manager's deallocate cannot fail).
pub unsafe trait SegmentManager {
    /// Allocate `size` bytes aligned to `align`. Returns `None` on
    /// allocation failure (this becomes [`crate::PoolError::NoMemory`]).
    fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a block previously handed out by `allocate_aligned` with the
    /// same `size`/`align`.
    ///
    /// # Safety
    /// `ptr` must have come from this manager's `allocate_aligned` with the
    /// identical `size` and `align`, and must not be used afterward.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// The default segment manager: the process's global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSegmentManager;

unsafe impl SegmentManager for SystemSegmentManager {
    fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has non-zero size by construction of the pool's block geometry.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(size, align);
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}
