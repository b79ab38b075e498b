//! Index arithmetic relating addresses, block sizes and tree positions.
//!
//! The managed region is a forest of `large_block_count` complete binary
//! trees, one per largest block. Every block in the forest has a global index;
//! indices are assigned breadth-first by order, so all largest blocks come
//! first, then all of their halves, and so on down to single pages:
//!
//! ```text
//! order 2 |           0           |           1           |           2           |
//! order 1 |     3     |     4     |     5     |     6     |     7     |     8     |
//! order 0 |  9  | 10  | 11  | 12  | 13  | 14  | 15  | 16  | 17  | 18  | 19  | 20  |
//! ```
//!
//! A block's position within its order is its index minus the number of blocks
//! at all higher orders, and its byte offset from the start of the region is
//! its position multiplied by its size.
//!
//! All arithmetic is exact integer arithmetic on powers of two.

use core::num::NonZeroUsize;

use crate::AllocInitError;

/// The number of distinct orders an allocator can have.
///
/// Valid maximum orders are `0..MAX_ORDERS`.
pub const MAX_ORDERS: usize = 32;

/// Largest global block index that can be linked into a free list.
///
/// Free-list links are 32 bits wide and reserve `u32::MAX` as the "no link"
/// value.
const MAX_BLOCK_INDEX: usize = u32::MAX as usize - 1;

/// The shape of a region managed by a buddy allocator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    area_start: NonZeroUsize,
    area_size: usize,
    page_size: usize,
    max_order: usize,
    large_block_count: usize,
}

impl Geometry {
    /// Validates a region configuration.
    ///
    /// `area_size` is rounded down to a multiple of the largest block size,
    /// `page_size << max_order`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if any of the following are
    /// true:
    /// - `page_size` is not a nonzero power of two.
    /// - `area_start` is zero.
    /// - `max_order` is not less than [`MAX_ORDERS`].
    /// - `area_size` is smaller than the largest block size.
    /// - The rounded region extends past the end of the address space.
    /// - The total number of blocks cannot be indexed by a free-list link.
    pub fn new(
        area_start: usize,
        area_size: usize,
        max_order: usize,
        page_size: usize,
    ) -> Result<Geometry, AllocInitError> {
        if !page_size.is_power_of_two() || max_order >= MAX_ORDERS {
            return Err(AllocInitError::InvalidConfig);
        }

        let area_start = NonZeroUsize::new(area_start).ok_or(AllocInitError::InvalidConfig)?;

        let large_block_size = page_size
            .checked_mul(1 << max_order)
            .ok_or(AllocInitError::InvalidConfig)?;

        if area_size < large_block_size {
            return Err(AllocInitError::InvalidConfig);
        }

        let large_block_count = area_size / large_block_size;
        let area_size = large_block_count * large_block_size;

        area_start
            .get()
            .checked_add(area_size)
            .ok_or(AllocInitError::InvalidConfig)?;

        let per_tree = (1_usize << max_order)
            .checked_mul(2)
            .ok_or(AllocInitError::InvalidConfig)?
            - 1;
        let total = large_block_count
            .checked_mul(per_tree)
            .ok_or(AllocInitError::InvalidConfig)?;
        if total > MAX_BLOCK_INDEX + 1 {
            return Err(AllocInitError::InvalidConfig);
        }

        Ok(Geometry {
            area_start,
            area_size,
            page_size,
            max_order,
            large_block_count,
        })
    }

    /// Returns the address of the first byte of the region.
    #[inline]
    pub fn area_start(&self) -> NonZeroUsize {
        self.area_start
    }

    /// Returns the size of the region in bytes.
    ///
    /// This is always a multiple of [`large_block_size`](Self::large_block_size).
    #[inline]
    pub fn area_size(&self) -> usize {
        self.area_size
    }

    /// Returns the size of the smallest block.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the order of the largest block.
    #[inline]
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Returns the size of the largest block.
    #[inline]
    pub fn large_block_size(&self) -> usize {
        self.size_of(self.max_order)
    }

    /// Returns the number of largest blocks in the region.
    #[inline]
    pub fn large_block_count(&self) -> usize {
        self.large_block_count
    }

    /// Returns the number of pages in the region.
    #[inline]
    pub fn small_block_count(&self) -> usize {
        self.large_block_count << self.max_order
    }

    /// Returns the number of blocks of all orders in the region.
    #[inline]
    pub fn total_block_count(&self) -> usize {
        self.large_block_count * ((2 << self.max_order) - 1)
    }

    /// Returns the number of blocks of order `order` in the region.
    #[inline]
    pub fn block_count(&self, order: usize) -> usize {
        debug_assert!(order <= self.max_order);

        self.large_block_count << (self.max_order - order)
    }

    /// Returns `true` if `addr` lies within the region.
    #[inline]
    pub fn contains_addr(&self, addr: usize) -> bool {
        let start = self.area_start.get();
        start <= addr && addr - start < self.area_size
    }

    /// Returns the size in bytes of a block of order `order`.
    #[inline]
    pub fn size_of(&self, order: usize) -> usize {
        self.page_size << order
    }

    /// Returns the smallest order whose blocks can hold `size` bytes.
    ///
    /// Returns `None` if `size` is zero or larger than the largest block.
    pub fn order_for_size(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.large_block_size() {
            return None;
        }

        let mut order = 0;
        let mut block_size = self.page_size;
        while block_size < size {
            block_size *= 2;
            order += 1;
        }

        Some(order)
    }

    /// Returns the number of blocks at all orders above `order`.
    #[inline]
    fn blocks_above(&self, order: usize) -> usize {
        self.large_block_count * ((1 << (self.max_order - order)) - 1)
    }

    /// Returns the order of the block with global index `index`.
    pub fn order_of(&self, index: usize) -> usize {
        debug_assert!(index < self.total_block_count());

        let mut order = self.max_order;
        let mut first = 0;
        let mut width = self.large_block_count;

        while index >= first + width {
            first += width;
            width *= 2;
            order -= 1;
        }

        order
    }

    /// Returns the position of the block with global index `index` among the
    /// blocks of its order.
    #[inline]
    pub fn position_in_order(&self, index: usize) -> usize {
        if index < self.large_block_count {
            return index;
        }

        index - self.blocks_above(self.order_of(index))
    }

    /// Returns the global index of the block at `position` within `order`.
    #[inline]
    pub fn global_index(&self, order: usize, position: usize) -> usize {
        debug_assert!(position < self.block_count(order));

        position + self.blocks_above(order)
    }

    /// Returns the global index of the lower half of block `index`.
    ///
    /// `index` must not be a page-sized block.
    #[inline]
    pub fn first_child(&self, index: usize) -> usize {
        index * 2 + self.large_block_count
    }

    /// Returns the global index of the upper half of block `index`.
    ///
    /// `index` must not be a page-sized block.
    #[inline]
    pub fn second_child(&self, index: usize) -> usize {
        self.first_child(index) + 1
    }

    /// Returns the global index of the block that `index` is half of.
    ///
    /// `index` must not be a largest block.
    #[inline]
    pub fn parent(&self, index: usize) -> usize {
        debug_assert!(index >= self.large_block_count);

        (index - self.large_block_count) / 2
    }

    /// Returns the global index of the buddy of block `index`.
    ///
    /// Largest blocks are paired with their neighbours, so when the region
    /// holds an odd number of largest blocks the last one has no buddy and
    /// this returns `None`.
    pub fn buddy(&self, index: usize) -> Option<usize> {
        if index < self.large_block_count {
            let buddy = index ^ 1;
            return (buddy < self.large_block_count).then(|| buddy);
        }

        Some(self.split_buddy(index, self.order_of(index)))
    }

    /// Returns the buddy of block `index` of order `order`, which must be
    /// below the maximum order.
    ///
    /// Such a block always has a buddy: the other half of its parent.
    #[inline]
    pub(crate) fn split_buddy(&self, index: usize, order: usize) -> usize {
        debug_assert!(order < self.max_order);
        debug_assert_eq!(self.order_of(index), order);

        let position = index - self.blocks_above(order);

        self.global_index(order, position ^ 1)
    }

    /// Returns the byte offset from the start of the region to block `index`.
    #[inline]
    pub fn offset_of(&self, index: usize) -> usize {
        self.offset_in_order(index, self.order_of(index))
    }

    /// Returns the byte offset of block `index`, which is of order `order`.
    #[inline]
    pub(crate) fn offset_in_order(&self, index: usize, order: usize) -> usize {
        debug_assert_eq!(self.order_of(index), order);

        (index - self.blocks_above(order)) * self.size_of(order)
    }

    /// Returns the ledger slot covering the byte at `offset`.
    #[inline]
    pub(crate) fn slot_of(&self, offset: usize) -> usize {
        offset / self.page_size
    }
}
