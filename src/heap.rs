//! A buddy allocator that hands out pointers into real memory.
//!
//! [`BuddyAllocator`] deals in addresses only. A [`BuddyHeap`] pairs one with
//! the memory those addresses refer to and serves [`Layout`]-based requests,
//! which makes it usable as a general-purpose allocator. The region is aligned
//! to the largest block size, so every block is aligned to its own size.

use core::{alloc::Layout, cmp, fmt, num::NonZeroUsize, ptr::NonNull};

#[cfg(feature = "unstable")]
use core::{alloc::Allocator, cell::RefCell};

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
use alloc::alloc::Global;

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
use crate::Global;

use crate::{
    base::BasePtr,
    buddy::{BuddyAllocator, BuddyPlan},
    geometry::MAX_ORDERS,
    AllocError, AllocInitError, BackingAllocator, Raw,
};

/// Declares and implements `Allocator` for wrappers around a heap.
///
/// If the "unstable" feature is not enabled, this is a no-op.
macro_rules! declare_wrappers {
    ($($(#[$attr:meta])* $wrapper:ident uses $typename:ident via $method:path)*) => {
        $(
            #[doc = concat!("A `BuddyHeap` wrapped by a `", stringify!($typename), "`.")]
            ///
            /// This type implements [`Allocator`].
            #[cfg(feature = "unstable")]
            $(#[$attr])*
            pub struct $wrapper<A: BackingAllocator> {
                inner: $typename<BuddyHeap<A>>,
            }

            #[cfg(feature = "unstable")]
            impl<A: BackingAllocator> $wrapper<A> {
                /// Wraps `heap`.
                pub fn new(heap: BuddyHeap<A>) -> Self {
                    $wrapper {
                        inner: $typename::new(heap),
                    }
                }

                /// Returns a reference to the inner wrapper.
                pub fn inner(&self) -> &$typename<BuddyHeap<A>> {
                    &self.inner
                }
            }

            #[cfg(feature = "unstable")]
            impl<A: BackingAllocator> fmt::Debug for $wrapper<A> {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($wrapper)).finish_non_exhaustive()
                }
            }

            // SAFETY:
            //
            // See https://doc.rust-lang.org/nightly/core/alloc/trait.Allocator.html#safety.
            //
            // - Allocated blocks point to memory owned by the `BuddyHeap` and are
            //   valid until it is dropped.
            // - `BuddyHeap` is not `Clone`, and moving it does not invalidate
            //   allocated memory because that memory is behind a pointer.
            // - Any pointer to a currently allocated block is safe to deallocate.
            #[cfg(feature = "unstable")]
            #[cfg_attr(docs_rs, doc(cfg(feature = "unstable")))]
            unsafe impl<A: BackingAllocator> Allocator for $wrapper<A> {
                fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
                    $method(&self.inner).allocate(layout)
                }

                unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
                    let _ = layout;

                    unsafe { $method(&self.inner).deallocate(ptr) }
                }
            }
        )*
    };
}

declare_wrappers! {
    RefCellBuddyHeap uses RefCell via RefCell::borrow_mut
}

/// A buddy allocator over a region of memory.
///
/// All blocks are multiples of `page_size` and at most
/// `page_size << max_order` bytes. Requests are rounded up to a block size at
/// least as large as their alignment.
pub struct BuddyHeap<A: BackingAllocator> {
    base: BasePtr,
    region_layout: Layout,
    buddy: BuddyAllocator<A>,
}

// SAFETY: The heap has exclusive access to its region and metadata.
unsafe impl<A: BackingAllocator + Send> Send for BuddyHeap<A> {}

impl BuddyHeap<Raw> {
    /// Constructs a new `BuddyHeap` from raw pointers.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidLocation`] if `plan` does not describe
    /// a region starting at `region`, or `region` is not aligned to the
    /// largest block size.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for
    ///   `plan.geometry().area_size()` bytes.
    /// - `metadata` must be a pointer to a buffer that satisfies
    ///   [`plan.metadata_layout()`], and it must be valid for reads and writes
    ///   for the entire size indicated by that `Layout`.
    /// - Neither buffer may be accessed other than through the heap while it
    ///   exists.
    ///
    /// [`plan.metadata_layout()`]: BuddyPlan::metadata_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        plan: BuddyPlan,
        metadata: NonNull<u8>,
    ) -> Result<BuddyHeap<Raw>, AllocInitError> {
        let g = plan.geometry();

        if g.area_start() != region.addr()
            || region.as_ptr().align_offset(g.large_block_size()) != 0
        {
            return Err(AllocInitError::InvalidLocation);
        }

        let region_layout = Layout::from_size_align(g.area_size(), g.page_size())
            .map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(BuddyHeap {
            base: BasePtr::new(region, g.area_size()),
            region_layout,
            buddy: unsafe { BuddyAllocator::new_raw(plan, metadata) },
        })
    }
}

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
impl BuddyHeap<Global> {
    /// Attempts to construct a new `BuddyHeap` backed by the global allocator.
    ///
    /// The heap manages `num_blocks` blocks of `page_size << max_order` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the parameters are invalid,
    /// or [`AllocInitError::AllocFailed`] if the region or metadata could not
    /// be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(
        num_blocks: usize,
        max_order: usize,
        page_size: usize,
    ) -> Result<BuddyHeap<Global>, AllocInitError> {
        let region_layout = BuddyHeap::<Global>::region_layout(num_blocks, max_order, page_size)?;

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let plan = match Self::plan(region, num_blocks, max_order, page_size) {
                Ok(p) => p,
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(e);
                }
            };

            let metadata_layout = plan.metadata_layout();
            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            Ok(BuddyHeap {
                base: BasePtr::new(region, region_layout.size()),
                region_layout,
                buddy: BuddyAllocator::from_parts(plan, metadata, Global),
            })
        }
    }
}

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
impl BuddyHeap<Global> {
    /// Attempts to construct a new `BuddyHeap` backed by the global allocator.
    ///
    /// The heap manages `num_blocks` blocks of `page_size << max_order` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the parameters are invalid,
    /// or [`AllocInitError::AllocFailed`] if the region or metadata could not
    /// be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(
        num_blocks: usize,
        max_order: usize,
        page_size: usize,
    ) -> Result<BuddyHeap<Global>, AllocInitError> {
        BuddyHeap::try_new_in(num_blocks, max_order, page_size, Global)
    }
}

#[cfg(feature = "unstable")]
impl<A: Allocator> BuddyHeap<A> {
    /// Attempts to construct a new `BuddyHeap` backed by `allocator`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the parameters are invalid,
    /// or [`AllocInitError::AllocFailed`] if the region or metadata could not
    /// be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "unstable")))]
    pub fn try_new_in(
        num_blocks: usize,
        max_order: usize,
        page_size: usize,
        allocator: A,
    ) -> Result<BuddyHeap<A>, AllocInitError> {
        let region_layout = BuddyHeap::<A>::region_layout(num_blocks, max_order, page_size)?;

        let region = allocator
            .allocate(region_layout)
            .map_err(|_| AllocInitError::AllocFailed(region_layout))?
            .cast::<u8>();

        let plan = match Self::plan(region, num_blocks, max_order, page_size) {
            Ok(p) => p,
            Err(e) => unsafe {
                Allocator::deallocate(&allocator, region, region_layout);
                return Err(e);
            },
        };

        let metadata_layout = plan.metadata_layout();
        let metadata = match allocator.allocate(metadata_layout) {
            Ok(m) => m.cast::<u8>(),
            Err(_) => unsafe {
                Allocator::deallocate(&allocator, region, region_layout);
                return Err(AllocInitError::AllocFailed(metadata_layout));
            },
        };

        Ok(BuddyHeap {
            base: BasePtr::new(region, region_layout.size()),
            region_layout,
            // SAFETY: `metadata` was just allocated from `allocator` with the
            // plan's layout.
            buddy: unsafe { BuddyAllocator::from_parts(plan, metadata, allocator) },
        })
    }
}

impl<A: BackingAllocator> BuddyHeap<A> {
    /// Returns the layout requirements of a region of `num_blocks` blocks of
    /// `page_size << max_order` bytes.
    ///
    /// The region is aligned to its largest block size.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `num_blocks` is zero,
    /// `page_size` is not a power of two, `max_order` is not less than
    /// [`MAX_ORDERS`](crate::geometry::MAX_ORDERS), or the region size
    /// overflows.
    pub fn region_layout(
        num_blocks: usize,
        max_order: usize,
        page_size: usize,
    ) -> Result<Layout, AllocInitError> {
        if num_blocks == 0 || !page_size.is_power_of_two() || max_order >= MAX_ORDERS {
            return Err(AllocInitError::InvalidConfig);
        }

        let block_size = page_size
            .checked_mul(1 << max_order)
            .ok_or(AllocInitError::InvalidConfig)?;
        let size = block_size
            .checked_mul(num_blocks)
            .ok_or(AllocInitError::InvalidConfig)?;

        Layout::from_size_align(size, block_size).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Plans a heap of `num_blocks` largest blocks over `region`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the parameters are rejected
    /// by [`BuddyHeap::region_layout`] or [`BuddyPlan::new`].
    pub fn plan(
        region: NonNull<u8>,
        num_blocks: usize,
        max_order: usize,
        page_size: usize,
    ) -> Result<BuddyPlan, AllocInitError> {
        let layout = Self::region_layout(num_blocks, max_order, page_size)?;

        BuddyPlan::new(
            region.addr().get(),
            layout.size(),
            max_order,
            page_size,
            false,
        )
    }

    /// Returns the address allocator behind this heap.
    #[inline]
    pub fn buddy(&self) -> &BuddyAllocator<A> {
        &self.buddy
    }

    /// Attempts to allocate a block of memory.
    ///
    /// On success, returns a [`NonNull<[u8]>`] which satisfies `layout`.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `layout` has zero size or a suitable block could not
    /// be allocated.
    ///
    /// [`NonNull<[u8]>`]: NonNull
    pub fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }

        let size = cmp::max(layout.size(), layout.align());
        let addr = self.buddy.allocate(size)?;

        if addr.get() % layout.align() != 0 {
            self.buddy.release(addr.get());
            return Err(AllocError);
        }

        Ok(self.base.with_addr_and_size(addr, layout.size()))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// Pointers this heap did not allocate are ignored.
    ///
    /// # Safety
    ///
    /// If `ptr` was allocated by this heap, the memory it refers to must not
    /// be used after this call.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let addr: NonZeroUsize = ptr.addr();

        debug_assert!(self.base.contains_addr(addr), "foreign pointer deallocated");

        self.buddy.release(addr.get());
    }

    /// Returns the size of the live block starting at `ptr`.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.buddy.allocation_size(ptr.addr().get())
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyHeap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("base", &self.base.ptr())
            .field("region_layout", &self.region_layout)
            .field("buddy", &self.buddy)
            .finish()
    }
}

impl<A: BackingAllocator> Drop for BuddyHeap<A> {
    fn drop(&mut self) {
        // The metadata is returned when `buddy` is dropped.
        unsafe {
            self.buddy
                .backing_allocator()
                .deallocate(self.base.ptr(), self.region_layout)
        };
    }
}
