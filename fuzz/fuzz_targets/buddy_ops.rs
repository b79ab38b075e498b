#![no_main]

use arbitrary::Arbitrary;
use buddy_pages::{BuddyAllocator, BuddyPlan};
use libfuzzer_sys::fuzz_target;

const AREA_START: usize = 0x1000_0000;
const MAX_AREA: usize = 1 << 24;

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(usize),
    Release(usize),
    ReleaseAddr(usize),
    ReleaseRange(usize, usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    area_size: usize,
    max_order: u8,
    page_shift: u8,
    reserve_all: bool,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let page_size = 1 << (args.page_shift % 13);
    let plan = match BuddyPlan::new(
        AREA_START,
        args.area_size % MAX_AREA,
        usize::from(args.max_order % 12),
        page_size,
        args.reserve_all,
    ) {
        Ok(p) => p,
        Err(_) => return,
    };

    let area_size = plan.geometry().area_size();
    let mut buddy = match BuddyAllocator::try_new(plan) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Allocate(size) => {
                if let Ok(addr) = buddy.allocate(size) {
                    let len = buddy
                        .allocation_size(addr.get())
                        .expect("allocated block missing from ledger");
                    assert!(len >= size);
                    assert_eq!((addr.get() - AREA_START) % len, 0);
                    outstanding.push(addr.get());
                }
            }

            BuddyOp::Release(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let addr = outstanding.swap_remove(idx);
                buddy.release(addr);
                assert_eq!(buddy.allocation_size(addr), None);
            }

            BuddyOp::ReleaseAddr(addr) => {
                let in_first_page = outstanding
                    .iter()
                    .any(|&a| a <= addr && addr - a < page_size);

                if !in_first_page {
                    let before = buddy.free_bytes();
                    buddy.release(addr);
                    assert_eq!(buddy.free_bytes(), before);
                }
            }

            BuddyOp::ReleaseRange(start, len) => {
                let start = AREA_START + start % area_size;
                let end = start.saturating_add(len % area_size);
                outstanding.retain(|&a| a < start || a >= end);
                buddy.release_range(start..end);
            }
        }

        assert!(buddy.free_bytes() <= area_size);
    }
});
