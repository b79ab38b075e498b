//! Binary-buddy allocation over a fixed range of address space.
//!
//! A buddy allocator divides its region into blocks whose sizes are powers of
//! two multiples of a page. A request is rounded up to the nearest block size
//! and served from the free list of that size, splitting a larger free block in
//! half as many times as needed when the list is empty. When a block is
//! released while its buddy (the other half of their parent) is also free, the
//! two are merged back into the parent, and so on up the tree.
//!
//! Setup happens in two steps so that the allocator never needs memory it does
//! not already have. [`BuddyPlan::new`] validates a configuration and reports
//! the [`Layout`] of the metadata it needs; a constructor then consumes a
//! buffer of that layout. The metadata holds one free-list link per block and
//! one ledger byte per page.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case             |
//! |--------------------------|-----------|------------------------|
//! | Allocate                 | O(1)      | O(max_order)           |
//! | Release                  | O(1)      | O(max_order)           |
//!
//! At most `max_order` blocks are split or merged per call, each in constant
//! time.
//!
//! #### Free-list policy
//!
//! Blocks produced by a split go to the head of their list, so the most
//! recently split half is handed out next. Blocks produced by a release that
//! cannot merge go to the tail, leaving them free for as long as possible so
//! their buddies have a chance to join them.

use core::{
    alloc::Layout,
    fmt,
    mem::{ManuallyDrop, MaybeUninit},
    num::NonZeroUsize,
    ops::Range,
    ptr::NonNull,
};

#[cfg(feature = "unstable")]
use core::alloc::Allocator;

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
use alloc::alloc::Global;

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
use crate::Global;

use crate::{
    geometry::{Geometry, MAX_ORDERS},
    ledger::Ledger,
    list::{FreeLink, FreeList, LinkTable},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

/// A validated allocator configuration and the metadata it requires.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BuddyPlan {
    geometry: Geometry,
    reserve_all: bool,
    metadata_layout: Layout,
    // Offset of the ledger within the metadata; the link table comes first.
    ledger_offset: usize,
}

impl BuddyPlan {
    /// Plans an allocator over `area_size` bytes starting at `area_start`.
    ///
    /// Pages are `page_size` bytes and the largest blocks are
    /// `page_size << max_order` bytes. `area_size` is rounded down to a
    /// multiple of the largest block size.
    ///
    /// If `reserve_all` is `true`, the allocator starts with every page
    /// allocated and no free blocks. Free memory is then handed to it by
    /// releasing pages, which allows holes such as firmware or kernel image
    /// ranges to be left out of an otherwise contiguous region.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the configuration is
    /// rejected by [`Geometry::new`] or its metadata cannot be described by a
    /// [`Layout`].
    pub fn new(
        area_start: usize,
        area_size: usize,
        max_order: usize,
        page_size: usize,
        reserve_all: bool,
    ) -> Result<BuddyPlan, AllocInitError> {
        let geometry = Geometry::new(area_start, area_size, max_order, page_size)?;
        BuddyPlan::from_geometry(geometry, reserve_all)
    }

    /// Plans an allocator over an already validated geometry.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the metadata cannot be
    /// described by a [`Layout`].
    pub fn from_geometry(
        geometry: Geometry,
        reserve_all: bool,
    ) -> Result<BuddyPlan, AllocInitError> {
        let links = Layout::array::<FreeLink>(geometry.total_block_count())
            .map_err(|_| AllocInitError::InvalidConfig)?;
        let ledger = Layout::array::<u8>(geometry.small_block_count())
            .map_err(|_| AllocInitError::InvalidConfig)?;
        let (metadata_layout, ledger_offset) = links
            .extend(ledger)
            .map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(BuddyPlan {
            geometry,
            reserve_all,
            metadata_layout,
            ledger_offset,
        })
    }

    /// Returns the geometry of the planned region.
    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Returns `true` if the allocator will start with every page allocated.
    #[inline]
    pub fn reserve_all(&self) -> bool {
        self.reserve_all
    }

    /// Returns the layout requirements of the metadata buffer.
    #[inline]
    pub fn metadata_layout(&self) -> Layout {
        self.metadata_layout
    }

    /// Returns the size in bytes of the metadata buffer.
    ///
    /// This is `total_block_count` free-list links followed by
    /// `small_block_count` ledger bytes.
    #[inline]
    pub fn metadata_size(&self) -> usize {
        self.metadata_layout.size()
    }
}

/// The raw components of a [`BuddyAllocator`].
#[derive(Debug)]
pub struct RawBuddyParts {
    /// A pointer to the metadata buffer.
    pub metadata: NonNull<u8>,
    /// The layout of the metadata buffer.
    pub metadata_layout: Layout,
}

/// A binary-buddy allocator over a fixed range of addresses.
///
/// For a discussion of buddy allocation, see the [module-level
/// documentation].
///
/// The allocator never dereferences addresses in its region; it only hands
/// them out. All of its bookkeeping lives in the metadata buffer it was
/// constructed with, which is returned to `A` when the allocator is dropped.
///
/// [module-level documentation]: crate::buddy
pub struct BuddyAllocator<A: BackingAllocator> {
    raw: RawBuddy,
    backing_allocator: A,
}

// SAFETY: The allocator has exclusive access to its metadata buffer, so moving
// it to another thread moves that access along with it.
unsafe impl<A: BackingAllocator + Send> Send for BuddyAllocator<A> {}

impl BuddyAllocator<Raw> {
    /// Constructs a new `BuddyAllocator` from a raw pointer to its metadata.
    ///
    /// The buffer is not validated against `plan`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `metadata` must be a pointer to a buffer that satisfies
    ///   [`plan.metadata_layout()`], and it must be valid for reads and writes
    ///   for the entire size indicated by that `Layout`.
    /// - The buffer must not be accessed other than through the allocator
    ///   until the allocator is dropped or decomposed with
    ///   [`into_raw_parts`](Self::into_raw_parts).
    ///
    /// [`plan.metadata_layout()`]: BuddyPlan::metadata_layout
    pub unsafe fn new_raw(plan: BuddyPlan, metadata: NonNull<u8>) -> BuddyAllocator<Raw> {
        unsafe { BuddyAllocator::from_parts(plan, metadata, Raw) }
    }

    /// Constructs a new `BuddyAllocator` using a static buffer for its
    /// metadata.
    ///
    /// This is intended for early boot, where the metadata is typically a
    /// `static` array sized for the largest expected region.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidLocation`] if `metadata` is smaller
    /// than [`plan.metadata_size()`] or is not aligned to
    /// `plan.metadata_layout().align()`.
    ///
    /// [`plan.metadata_size()`]: BuddyPlan::metadata_size
    pub fn from_static(
        plan: BuddyPlan,
        metadata: &'static mut [MaybeUninit<u8>],
    ) -> Result<BuddyAllocator<Raw>, AllocInitError> {
        let layout = plan.metadata_layout();
        let len = metadata.len();
        let ptr = NonNull::from(metadata).cast::<u8>();

        if len < layout.size() || ptr.as_ptr().align_offset(layout.align()) != 0 {
            return Err(AllocInitError::InvalidLocation);
        }

        // SAFETY: the buffer is large enough, aligned, and exclusively
        // borrowed for the rest of the program.
        Ok(unsafe { BuddyAllocator::new_raw(plan, ptr) })
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned metadata buffer is no longer used by the allocator and may
    /// be reclaimed by the caller. All outstanding allocations are forgotten.
    pub fn into_raw_parts(self) -> RawBuddyParts {
        let this = ManuallyDrop::new(self);

        RawBuddyParts {
            metadata: this.raw.metadata,
            metadata_layout: this.raw.metadata_layout,
        }
    }
}

#[cfg(all(any(feature = "alloc", test), not(feature = "unstable")))]
impl BuddyAllocator<Global> {
    /// Attempts to construct a new `BuddyAllocator` whose metadata is
    /// allocated from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AllocFailed`] if the metadata could not be
    /// allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(plan: BuddyPlan) -> Result<BuddyAllocator<Global>, AllocInitError> {
        let layout = plan.metadata_layout();

        unsafe {
            // SAFETY: metadata always holds at least one link, so the layout
            // is not zero-sized.
            let raw = alloc::alloc::alloc(layout);
            let metadata = NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?;

            Ok(BuddyAllocator::from_parts(plan, metadata, Global))
        }
    }
}

#[cfg(all(any(feature = "alloc", test), feature = "unstable"))]
impl BuddyAllocator<Global> {
    /// Attempts to construct a new `BuddyAllocator` whose metadata is
    /// allocated from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AllocFailed`] if the metadata could not be
    /// allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(plan: BuddyPlan) -> Result<BuddyAllocator<Global>, AllocInitError> {
        Self::try_new_in(plan, Global)
    }
}

#[cfg(feature = "unstable")]
impl<A: Allocator> BuddyAllocator<A> {
    /// Attempts to construct a new `BuddyAllocator` whose metadata is
    /// allocated from `backing_allocator`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::AllocFailed`] if the metadata could not be
    /// allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "unstable")))]
    pub fn try_new_in(
        plan: BuddyPlan,
        backing_allocator: A,
    ) -> Result<BuddyAllocator<A>, AllocInitError> {
        let layout = plan.metadata_layout();

        let metadata = backing_allocator
            .allocate(layout)
            .map_err(|_| AllocInitError::AllocFailed(layout))?
            .cast::<u8>();

        // SAFETY: `metadata` was just allocated with the plan's layout.
        Ok(unsafe { BuddyAllocator::from_parts(plan, metadata, backing_allocator) })
    }
}

impl<A: BackingAllocator> BuddyAllocator<A> {
    /// Constructs a `BuddyAllocator` over metadata owned by `backing_allocator`.
    ///
    /// # Safety
    ///
    /// `metadata` must satisfy `plan.metadata_layout()` and be valid for reads
    /// and writes for its entire size. It must be deallocatable by
    /// `backing_allocator` with that layout, and must not be otherwise
    /// accessed while the allocator exists.
    pub(crate) unsafe fn from_parts(
        plan: BuddyPlan,
        metadata: NonNull<u8>,
        backing_allocator: A,
    ) -> BuddyAllocator<A> {
        unsafe { RawBuddy::new(plan, metadata).with_backing_allocator(backing_allocator) }
    }

    /// Returns the geometry of the managed region.
    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.raw.geometry
    }

    /// Returns the allocator that owns the metadata.
    #[inline]
    pub fn backing_allocator(&self) -> &A {
        &self.backing_allocator
    }

    /// Returns the number of free blocks of order `order`.
    ///
    /// Orders above the maximum order never have free blocks.
    #[inline]
    pub fn free_count(&self, order: usize) -> usize {
        self.raw.free_lists.get(order).map_or(0, FreeList::len)
    }

    /// Returns an iterator over the addresses of the free blocks of order
    /// `order`, in the order they would be allocated.
    pub fn free_blocks(&self, order: usize) -> impl Iterator<Item = NonZeroUsize> + '_ {
        let g = &self.raw.geometry;
        let list = self
            .raw
            .free_lists
            .get(order)
            .copied()
            .unwrap_or(FreeList::EMPTY);

        list.iter(&self.raw.links)
            .filter_map(move |node| {
                g.area_start()
                    .checked_add(g.offset_in_order(node as usize, order))
            })
    }

    /// Returns the total size of all free blocks.
    pub fn free_bytes(&self) -> usize {
        (0..=self.raw.geometry.max_order())
            .map(|order| self.free_count(order) * self.raw.geometry.size_of(order))
            .sum()
    }

    /// Returns the size of the live block whose first page contains `addr`.
    ///
    /// Returns `None` if `addr` is outside the region or its page is not the
    /// first page of a block handed out by this allocator.
    pub fn allocation_size(&self, addr: usize) -> Option<usize> {
        let g = &self.raw.geometry;
        let offset = self.raw.page_offset(addr)?;
        let order = self.raw.ledger.get(g.slot_of(offset))?;

        Some(g.size_of(order))
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// The size is rounded up to the nearest block size, so the block is
    /// always at least one page. Its address is aligned to its size relative to
    /// the start of the region.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, `size` is larger than the largest
    /// block, or no free block is large enough. A failed allocation leaves the
    /// allocator unchanged.
    pub fn allocate(&mut self, size: usize) -> Result<NonZeroUsize, AllocError> {
        let raw = &mut self.raw;
        let order = raw.geometry.order_for_size(size).ok_or(AllocError)?;

        if raw.free_lists[order].is_empty() {
            let from = (order + 1..=raw.geometry.max_order())
                .find(|&o| !raw.free_lists[o].is_empty())
                .ok_or(AllocError)?;

            for o in (order + 1..=from).rev() {
                raw.split_head(o);
            }
        }

        raw.take_head(order)
    }

    /// Releases the block whose first page contains `addr`.
    ///
    /// If the block's buddy is free, the two are merged, repeatedly, up to the
    /// largest block size.
    ///
    /// Addresses outside the region, or in a page that does not start a live
    /// block, are ignored. In particular, releasing a block twice has no
    /// effect the second time.
    pub fn release(&mut self, addr: usize) {
        let raw = &mut self.raw;

        let offset = match raw.page_offset(addr) {
            Some(ofs) => ofs,
            None => {
                debug!("ignoring release of {:#x}: outside the region", addr);
                return;
            }
        };

        let order = match raw.ledger.take(raw.geometry.slot_of(offset)) {
            Some(o) => o,
            None => {
                debug!("ignoring release of {:#x}: not allocated", addr);
                return;
            }
        };

        let index = raw
            .geometry
            .global_index(order, offset / raw.geometry.size_of(order));

        raw.free_block(index, order);
    }

    /// Releases every live block that starts at a page within `range`.
    ///
    /// After constructing an allocator with every page reserved, this hands
    /// a span of usable memory to it in one call.
    pub fn release_range(&mut self, range: Range<usize>) {
        let g = self.raw.geometry;
        let area_start = g.area_start().get();
        let area_end = area_start + g.area_size();

        let end = range.end.min(area_end);
        let mut start = range.start.max(area_start);
        if start >= end {
            return;
        }

        let misalignment = (start - area_start) % g.page_size();
        if misalignment != 0 {
            start += g.page_size() - misalignment;
        }

        for addr in (start..end).step_by(g.page_size()) {
            self.release(addr);
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyAllocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max_order = self.raw.geometry.max_order();

        f.debug_struct("BuddyAllocator")
            .field("geometry", &self.raw.geometry)
            .field("metadata", &self.raw.metadata)
            .field("free_lists", &&self.raw.free_lists[..=max_order])
            .finish()
    }
}

impl<A: BackingAllocator> Drop for BuddyAllocator<A> {
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.raw.metadata, self.raw.metadata_layout)
        };
    }
}

/// Like a `BuddyAllocator`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this struct can be
/// moved out of, while `BuddyAllocator` itself cannot.
struct RawBuddy {
    geometry: Geometry,
    metadata: NonNull<u8>,
    metadata_layout: Layout,
    links: LinkTable,
    ledger: Ledger,
    free_lists: [FreeList; MAX_ORDERS],
}

/// Converts a validated global block index to a free-list node.
#[inline]
fn node(index: usize) -> u32 {
    debug_assert!(index < u32::MAX as usize);

    index as u32
}

impl RawBuddy {
    /// Lays out the link table and ledger in `metadata` and seeds the free
    /// lists.
    ///
    /// # Safety
    ///
    /// `metadata` must be a pointer to a buffer that satisfies
    /// `plan.metadata_layout()`, valid for reads and writes for its entire
    /// size and not otherwise accessed while the allocator exists.
    unsafe fn new(plan: BuddyPlan, metadata: NonNull<u8>) -> RawBuddy {
        let geometry = plan.geometry;

        let mut links = unsafe {
            LinkTable::new(
                geometry.total_block_count(),
                metadata.as_ptr().cast::<FreeLink>(),
            )
        };

        let ledger = unsafe {
            Ledger::new(
                geometry.small_block_count(),
                metadata.as_ptr().add(plan.ledger_offset),
                plan.reserve_all,
            )
        };

        let mut free_lists = [FreeList::EMPTY; MAX_ORDERS];

        if !plan.reserve_all {
            let top = &mut free_lists[geometry.max_order()];
            for root in 0..geometry.large_block_count() {
                top.insert_tail(&mut links, node(root));
            }
        }

        debug!(
            "buddy allocator over {:#x}+{:#x}: {} blocks of {:#x} bytes, pages of {:#x} bytes, reserve_all={}",
            geometry.area_start(),
            geometry.area_size(),
            geometry.large_block_count(),
            geometry.large_block_size(),
            geometry.page_size(),
            plan.reserve_all
        );

        RawBuddy {
            geometry,
            metadata,
            metadata_layout: plan.metadata_layout,
            links,
            ledger,
            free_lists,
        }
    }

    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyAllocator<A> {
        BuddyAllocator {
            raw: self,
            backing_allocator,
        }
    }

    /// Returns the offset into the region of the page containing `addr`.
    #[inline]
    fn page_offset(&self, addr: usize) -> Option<usize> {
        if !self.geometry.contains_addr(addr) {
            return None;
        }

        let offset = addr - self.geometry.area_start().get();
        Some(offset - offset % self.geometry.page_size())
    }

    /// Splits the head of the order-`order` list into its two halves.
    ///
    /// The lower half ends up at the head of the next list down, with the
    /// upper half right behind it.
    fn split_head(&mut self, order: usize) {
        debug_assert!(order > 0);

        let parent = match self.free_lists[order].head() {
            Some(p) => p as usize,
            None => return,
        };

        let first = self.geometry.first_child(parent);
        let second = self.geometry.second_child(parent);

        trace!("split block {} of order {} into {} and {}", parent, order, first, second);

        let lower = &mut self.free_lists[order - 1];
        lower.insert_head(&mut self.links, node(first));
        lower.insert_after(&mut self.links, node(first), node(second));

        self.free_lists[order].remove(&mut self.links, node(parent));
    }

    /// Allocates the head of the order-`order` list.
    fn take_head(&mut self, order: usize) -> Result<NonZeroUsize, AllocError> {
        let head = self.free_lists[order].head().ok_or(AllocError)?;

        let offset = self.geometry.offset_in_order(head as usize, order);
        let addr = self
            .geometry
            .area_start()
            .checked_add(offset)
            .ok_or(AllocError)?;

        self.ledger.stamp(self.geometry.slot_of(offset), order);
        self.free_lists[order].remove(&mut self.links, head);

        Ok(addr)
    }

    /// Returns block `index` of order `order` to the free lists, merging it
    /// with free buddies.
    fn free_block(&mut self, mut index: usize, mut order: usize) {
        let max_order = self.geometry.max_order();

        while order < max_order {
            let buddy = self.geometry.split_buddy(index, order);
            let list = &mut self.free_lists[order];

            if !list.contains(&self.links, node(buddy)) {
                list.insert_tail(&mut self.links, node(index));
                return;
            }

            trace!("merge block {} of order {} with buddy {}", index, order, buddy);

            list.remove(&mut self.links, node(buddy));
            index = self.geometry.parent(index);
            order += 1;
        }

        self.free_lists[max_order].insert_head(&mut self.links, node(index));
    }
}
