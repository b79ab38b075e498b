use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

/// A pointer to the base of the region of memory managed by a heap.
///
/// Blocks are tracked by address only. Any pointer to a block must be derived
/// from this pointer so that it carries the region's provenance.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`. The region
    /// `ptr..ptr + extent` must not wrap around the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        debug_assert!(ptr.addr().get().checked_add(extent).is_some());

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn limit(self) -> usize {
        self.ptr.addr().get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr.get() < self.limit()
    }

    /// Creates a slice pointer to `len` bytes at `addr`.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));
        debug_assert!(addr.get() + len <= self.limit());

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        // SAFETY: `addr` is nonzero.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}
