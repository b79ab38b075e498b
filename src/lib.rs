//! A buddy page allocator for environments without a heap.
//!
//! [`BuddyAllocator`] partitions one contiguous range of address space into
//! power-of-two blocks, from a single page up to `2^max_order` pages, and
//! serves allocations by splitting and coalescing them. It never allocates
//! memory for itself: setup is split into a planning step, which validates the
//! configuration and reports how much metadata is required, and a commit step,
//! which consumes a caller-supplied metadata buffer. This makes it suitable as
//! the first physical page allocator of a kernel, before any other allocator
//! exists.
//!
//! ```
//! use buddy_pages::{BuddyAllocator, BuddyPlan};
//!
//! // 48 bytes of address space at 0x1000, managed in 4-byte pages with
//! // blocks of up to 16 bytes.
//! let plan = BuddyPlan::new(0x1000, 48, 2, 4, false).unwrap();
//! assert_eq!(plan.geometry().total_block_count(), 21);
//!
//! # #[cfg(feature = "alloc")]
//! # {
//! let mut buddy = BuddyAllocator::try_new(plan).unwrap();
//! let addr = buddy.allocate(8).unwrap();
//! assert_eq!(buddy.allocation_size(addr.get()), Some(8));
//! buddy.release(addr.get());
//! # }
//! ```
//!
//! The allocator manages addresses only and never reads or writes the region
//! itself. [`BuddyHeap`] pairs an allocator with real memory and hands out
//! pointers instead.

#![doc(html_root_url = "https://docs.rs/buddy_pages/0.1.0")]
#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(feature = "unstable", feature(allocator_api))]
#![cfg_attr(docs_rs, feature(doc_cfg))]

// Diagnostics are only emitted with the `log` feature. Without it these expand
// to nothing, so the allocator stays silent in environments with no output.
#[cfg(feature = "log")]
macro_rules! debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "log")]
macro_rules! trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
pub mod buddy;
pub mod geometry;
pub mod heap;
mod ledger;
mod list;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, fmt, ptr::NonNull};

#[cfg(feature = "unstable")]
use core::alloc::Allocator;

pub use crate::{
    buddy::{BuddyAllocator, BuddyPlan, RawBuddyParts},
    geometry::Geometry,
    heap::BuddyHeap,
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy: a page size that is zero or not
    /// a power of two, a zero base address, an order of 32 or more, a region
    /// smaller than one largest block, or a region whose bookkeeping cannot be
    /// represented.
    InvalidConfig,

    /// The location of a supplied buffer is invalid.
    ///
    /// This variant is returned when a caller-supplied metadata buffer or
    /// memory region is too small, insufficiently aligned, or would extend
    /// past the end of the address space.
    InvalidLocation,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid allocator configuration"),
            AllocInitError::InvalidLocation => f.write_str("invalid buffer location"),
        }
    }
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// set of arguments.
#[cfg(not(feature = "unstable"))]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

#[cfg(feature = "unstable")]
pub use core::alloc::AllocError;

/// Types which provide memory which backs an allocator.
///
/// This is a supertrait of [`Allocator`], and is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
/// - Any type `A` which implements [`Allocator`] indicates that an allocator is
///   backed by an instance of `A`. The allocator will free its memory on drop.
///
/// [`Allocator`]: https://doc.rust-lang.org/stable/core/alloc/trait.Allocator.html
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory [*currently allocated*] via this allocator, and
    /// * `layout` must [*fit*] that block of memory.
    ///
    /// [*currently allocated*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#currently-allocated-memory
    /// [*fit*]: https://doc.rust-lang.org/nightly/alloc/alloc/trait.Allocator.html#memory-fitting
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
impl Sealed for Global {}

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
pub use alloc::alloc::Global;

#[cfg(feature = "unstable")]
impl<A: Allocator> Sealed for A {}
#[cfg(feature = "unstable")]
impl<A: Allocator> BackingAllocator for A {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { Allocator::deallocate(self, ptr, layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
