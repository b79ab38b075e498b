#![no_main]

use std::alloc::Layout;

use arbitrary::{Arbitrary, Unstructured};
use buddy_pages::BuddyHeap;
use libfuzzer_sys::fuzz_target;

const MAX_BLOCKS: usize = 64;

// Arbitrary is not implemented for core::alloc::Layout :(
#[derive(Clone, Debug)]
struct FakeLayout {
    size: usize,
    align: usize,
}

impl Arbitrary<'_> for FakeLayout {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<FakeLayout> {
        let size = usize::arbitrary(un)? % (1 << 20);

        // Select a random bit index and shift to obtain a power of two.
        let align_shift = u8::arbitrary(un)? % 16;
        let align = 1 << align_shift;

        Ok(FakeLayout { size, align })
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum HeapOp {
    Allocate(FakeLayout),
    Deallocate(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    num_blocks: usize,
    max_order: u8,
    page_shift: u8,
    ops: Vec<HeapOp>,
}

fuzz_target!(|args: Args| {
    let mut heap = match BuddyHeap::try_new(
        1 + args.num_blocks % MAX_BLOCKS,
        usize::from(args.max_order % 10),
        1 << (args.page_shift % 10),
    ) {
        Ok(h) => h,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            HeapOp::Allocate(fake_layout) => {
                let layout = Layout::from_size_align(fake_layout.size, fake_layout.align)
                    .expect("illegal layout values from FakeLayout");
                if let Ok(block) = heap.allocate(layout) {
                    assert_eq!(block.cast::<u8>().as_ptr() as usize % layout.align(), 0);
                    unsafe { block.cast::<u8>().as_ptr().write_bytes(0xAB, layout.size()) };
                    outstanding.push(block);
                }
            }

            HeapOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                unsafe { heap.deallocate(block.cast()) };
            }
        }
    }
});
