#![cfg(test)]
extern crate std;

use core::{alloc::Layout, fmt::Debug, marker::PhantomData, mem, ptr, ptr::NonNull, slice};

use crate::{AllocError, AllocInitError, BuddyAllocator, BuddyHeap, BuddyPlan, Global};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError>;

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _: Layout);

    /// Returns `true` if every block has been merged back to the largest size.
    fn is_fully_free(&self) -> bool;
}

// Heap =======================================================================

#[derive(Clone, Debug)]
struct HeapParams {
    num_blocks: usize,
    max_order: usize,
    page_size: usize,
}

impl Arbitrary for HeapParams {
    fn arbitrary(g: &mut Gen) -> Self {
        HeapParams {
            num_blocks: 1 + usize::arbitrary(g) % 4,
            max_order: usize::arbitrary(g) % 8,
            page_size: 1 << (2 + usize::arbitrary(g) % 5),
        }
    }
}

impl QcAllocator for BuddyHeap<Global> {
    type Params = HeapParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        BuddyHeap::try_new(params.num_blocks, params.max_order, params.page_size)
    }

    fn allocate(&mut self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _: Layout) {
        unsafe { self.deallocate(ptr) }
    }

    fn is_fully_free(&self) -> bool {
        let g = self.buddy().geometry();
        self.buddy().free_count(g.max_order()) == g.large_block_count()
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp<P: Arbitrary> {
    /// Allocate a buffer described by `params`.
    Allocate { params: P },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl<P: Arbitrary> Arbitrary for AllocatorOp<P> {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                params: P::arbitrary(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

struct RawAllocation {
    id: OpId,
    ptr: NonNull<[u8]>,
    layout: Layout,
}

type AllocResult = Result<NonNull<[u8]>, AllocError>;

trait PropAllocation {
    type Params: Arbitrary;

    fn layout(params: &Self::Params) -> Layout;
    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self;
    fn into_raw(self) -> RawAllocation;
}

trait Prop {
    /// The allocator to test for this property.
    type Allocator: QcAllocator;

    type Allocation: PropAllocation;

    /// Examines the result of an allocation.
    fn post_allocate(
        op_id: OpId,
        params: &<Self::Allocation as PropAllocation>::Params,
        res: &mut AllocResult,
    ) -> bool {
        let _ = (op_id, params, res);
        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        let _ = allocation;
        true
    }
}

struct AllocatorChecker<P: Prop> {
    allocator: P::Allocator,
    allocations: Vec<P::Allocation>,
    num_ops: u32,
}

impl<P: Prop> AllocatorChecker<P> {
    fn new(
        params: <P::Allocator as QcAllocator>::Params,
        capacity: usize,
    ) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: P::Allocator::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp<<P::Allocation as PropAllocation>::Params>) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { params } => {
                let layout = P::Allocation::layout(&params);
                let mut res = self.allocator.allocate(layout);

                if !P::post_allocate(op_id, &params, &mut res) {
                    return false;
                }

                if let Ok(ptr) = res {
                    self.allocations.push(P::Allocation::from_raw(
                        &params,
                        RawAllocation {
                            id: op_id,
                            ptr,
                            layout,
                        },
                    ));
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !P::pre_deallocate(&a) {
                    return false;
                }

                let a = a.into_raw();

                unsafe { self.allocator.deallocate(a.ptr.cast::<u8>(), a.layout) };
            }
        }

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for alloc in self.allocations.drain(..) {
            if !P::pre_deallocate(&alloc) {
                return false;
            }

            let alloc = alloc.into_raw();
            unsafe {
                self.allocator
                    .deallocate(alloc.ptr.cast::<u8>(), alloc.layout)
            };
        }

        self.allocator.is_fully_free()
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

struct MutuallyExclusive<A: QcAllocator> {
    phantom: PhantomData<A>,
}

struct MutuallyExclusiveAllocation {
    op_id: OpId,
    ptr: NonNull<[u32]>,
    layout: Layout,
}

#[derive(Clone, Debug)]
struct MutuallyExclusiveAllocationParams {
    len: usize,
}

impl Arbitrary for MutuallyExclusiveAllocationParams {
    fn arbitrary(g: &mut Gen) -> Self {
        MutuallyExclusiveAllocationParams {
            len: limited_size(g),
        }
    }
}

impl PropAllocation for MutuallyExclusiveAllocation {
    type Params = MutuallyExclusiveAllocationParams;

    fn layout(params: &Self::Params) -> Layout {
        Layout::array::<u32>(params.len).unwrap()
    }

    fn from_raw(params: &Self::Params, raw: RawAllocation) -> Self {
        MutuallyExclusiveAllocation {
            op_id: raw.id,
            ptr: NonNull::new(ptr::slice_from_raw_parts_mut(
                raw.ptr.as_ptr().cast(),
                params.len,
            ))
            .unwrap(),
            layout: raw.layout,
        }
    }

    fn into_raw(self) -> RawAllocation {
        let num_bytes = mem::size_of::<u32>() * unsafe { self.ptr.as_ref().len() };

        let bytes = NonNull::new(ptr::slice_from_raw_parts_mut(
            self.ptr.cast().as_ptr(),
            num_bytes,
        ))
        .unwrap();

        RawAllocation {
            id: self.op_id,
            ptr: bytes,
            layout: self.layout,
        }
    }
}

impl<A: QcAllocator> Prop for MutuallyExclusive<A> {
    type Allocator = A;

    type Allocation = MutuallyExclusiveAllocation;

    fn post_allocate(
        op_id: OpId,
        params: &MutuallyExclusiveAllocationParams,
        res: &mut AllocResult,
    ) -> bool {
        if let Ok(alloc) = res {
            let u32_ptr: NonNull<u32> = alloc.cast();
            let slice = unsafe { slice::from_raw_parts_mut(u32_ptr.as_ptr(), params.len) };
            slice.fill(op_id);
        }

        true
    }

    fn pre_deallocate(allocation: &Self::Allocation) -> bool {
        let slice = unsafe { allocation.ptr.as_ref() };
        slice.iter().copied().all(|elem| elem == allocation.op_id)
    }
}

fn check<P: Prop>(
    params: <P::Allocator as QcAllocator>::Params,
    ops: Vec<AllocatorOp<<P::Allocation as PropAllocation>::Params>>,
) -> bool {
    let mut checker: AllocatorChecker<P> = AllocatorChecker::new(params, ops.capacity()).unwrap();
    checker.run(ops)
}

#[test]
fn heap_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<MutuallyExclusive<BuddyHeap<Global>>> as fn(_, _) -> bool);
}

// Address accounting ==========================================================

const FAKE_START: usize = 0x10_0000;

#[derive(Clone, Debug)]
struct AddrParams {
    large_blocks: usize,
    max_order: usize,
    page_size: usize,
    reserve_all: bool,
}

impl Arbitrary for AddrParams {
    fn arbitrary(g: &mut Gen) -> Self {
        AddrParams {
            large_blocks: 1 + usize::arbitrary(g) % 5,
            max_order: usize::arbitrary(g) % 6,
            page_size: 1 << (usize::arbitrary(g) % 13),
            reserve_all: bool::arbitrary(g),
        }
    }
}

#[derive(Clone, Debug)]
enum AddrOp {
    /// Allocate `size` bytes, which may be zero or too large.
    Allocate { size: usize },
    /// Release the live allocation at `index % n` through an address `skew`
    /// bytes into its first page.
    Release { index: usize, skew: usize },
    /// Release an address outside the first page of every live allocation.
    ReleaseStray { offset: usize },
    /// Allocate `size` bytes and release them immediately.
    RoundTrip { size: usize },
}

impl Arbitrary for AddrOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 6 {
            0 | 1 => AddrOp::Allocate {
                size: usize::arbitrary(g) % (1 << 18),
            },
            2 | 3 => AddrOp::Release {
                index: usize::arbitrary(g),
                skew: usize::arbitrary(g),
            },
            4 => AddrOp::ReleaseStray {
                offset: usize::arbitrary(g),
            },
            _ => AddrOp::RoundTrip {
                size: usize::arbitrary(g) % (1 << 18),
            },
        }
    }
}

fn free_counts(buddy: &BuddyAllocator<Global>) -> Vec<usize> {
    (0..=buddy.geometry().max_order())
        .map(|o| buddy.free_count(o))
        .collect()
}

fn addresses_are_accounted(params: AddrParams, ops: Vec<AddrOp>) -> bool {
    let block_size = params.page_size << params.max_order;
    let area_size = params.large_blocks * block_size;

    let plan = BuddyPlan::new(
        FAKE_START,
        area_size,
        params.max_order,
        params.page_size,
        params.reserve_all,
    )
    .unwrap();
    let mut buddy = BuddyAllocator::try_new(plan).unwrap();
    let max_order = params.max_order;

    if params.reserve_all {
        if buddy.free_bytes() != 0 {
            return false;
        }

        buddy.release_range(FAKE_START..FAKE_START + area_size);
    }

    if buddy.free_count(max_order) != params.large_blocks || buddy.free_bytes() != area_size {
        return false;
    }

    // (address, block size) of each live allocation.
    let mut live: Vec<(usize, usize)> = Vec::new();

    for op in ops {
        let before = free_counts(&buddy);

        match op {
            AddrOp::Allocate { size } => match buddy.allocate(size) {
                Ok(addr) => {
                    let addr = addr.get();
                    let len = match buddy.allocation_size(addr) {
                        Some(len) => len,
                        None => return false,
                    };

                    if len < size
                        || !len.is_power_of_two()
                        || len < params.page_size
                        || (addr - FAKE_START) % len != 0
                        || addr + len > FAKE_START + area_size
                    {
                        return false;
                    }

                    if live
                        .iter()
                        .any(|&(a, l)| a < addr + len && addr < a + l)
                    {
                        return false;
                    }

                    live.push((addr, len));
                }

                Err(_) => {
                    if free_counts(&buddy) != before {
                        return false;
                    }

                    // Failure is only allowed if nothing large enough is free.
                    if let Some(order) = buddy.geometry().order_for_size(size) {
                        if (order..=max_order).any(|o| buddy.free_count(o) > 0) {
                            return false;
                        }
                    }
                }
            },

            AddrOp::Release { index, skew } => {
                if live.is_empty() {
                    continue;
                }

                let (addr, _) = live.swap_remove(index % live.len());
                buddy.release(addr + skew % params.page_size);

                if buddy.allocation_size(addr).is_some() {
                    return false;
                }
            }

            AddrOp::ReleaseStray { offset } => {
                let addr = FAKE_START.wrapping_add(offset % (area_size + 2 * block_size));

                // Any address in the first page of a live block releases it.
                if live
                    .iter()
                    .any(|&(a, _)| a <= addr && addr < a + params.page_size)
                {
                    continue;
                }

                buddy.release(addr);

                if free_counts(&buddy) != before {
                    return false;
                }
            }

            AddrOp::RoundTrip { size } => {
                if let Ok(addr) = buddy.allocate(size) {
                    buddy.release(addr.get());
                }

                if free_counts(&buddy) != before {
                    return false;
                }
            }
        }

        let live_bytes: usize = live.iter().map(|&(_, l)| l).sum();
        if buddy.free_bytes() + live_bytes != area_size {
            return false;
        }
    }

    for (addr, _) in live {
        buddy.release(addr);
    }

    buddy.free_count(max_order) == params.large_blocks && buddy.free_bytes() == area_size
}

#[test]
fn buddy_addresses_are_accounted() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(addresses_are_accounted as fn(_, _) -> bool);
}
