//! Per-page record of live allocations.
//!
//! The ledger holds one byte per page. The slot for the first page of a live
//! block stores the block's order plus one, and every other slot is zero. The
//! offset keeps an order-0 allocation distinguishable from an empty slot, which
//! is what lets a release of a stale or foreign address be detected.

/// Slot value for a page at which no allocation starts.
const EMPTY: u8 = 0;

pub struct Ledger {
    num_slots: usize,
    map: *mut u8,
}

impl Ledger {
    /// Constructs a ledger of `num_slots` slots backed by `map`.
    ///
    /// If `reserve_all` is `true`, every slot records a live order-0
    /// allocation. Otherwise every slot is empty.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for `num_slots` bytes.
    /// - No other reference to that memory may exist while the ledger does.
    pub unsafe fn new(num_slots: usize, map: *mut u8, reserve_all: bool) -> Ledger {
        assert!(!map.is_null());

        let fill = if reserve_all { Self::encode(0) } else { EMPTY };
        unsafe { map.write_bytes(fill, num_slots) };

        Ledger { num_slots, map }
    }

    #[inline]
    fn encode(order: usize) -> u8 {
        debug_assert!(order < u8::MAX as usize);

        order as u8 + 1
    }

    #[inline]
    fn read(&self, slot: usize) -> u8 {
        assert!(slot < self.num_slots);

        unsafe { self.map.add(slot).read() }
    }

    #[inline]
    fn write(&mut self, slot: usize, value: u8) {
        assert!(slot < self.num_slots);

        unsafe { self.map.add(slot).write(value) };
    }

    /// Returns the order of the live allocation starting at `slot`, if any.
    #[inline]
    pub fn get(&self, slot: usize) -> Option<usize> {
        match self.read(slot) {
            EMPTY => None,
            stored => Some(usize::from(stored) - 1),
        }
    }

    /// Records a live allocation of order `order` starting at `slot`.
    #[inline]
    pub fn stamp(&mut self, slot: usize, order: usize) {
        debug_assert_eq!(self.read(slot), EMPTY);

        self.write(slot, Self::encode(order));
    }

    /// Clears the record at `slot`, returning the order it held.
    ///
    /// Returns `None` and leaves the ledger unchanged if no allocation
    /// starts at `slot`.
    #[inline]
    pub fn take(&mut self, slot: usize) -> Option<usize> {
        let order = self.get(slot)?;
        self.write(slot, EMPTY);
        Some(order)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{prelude::rust_2021::*, vec};

    use super::*;

    fn with_ledger(num_slots: usize, reserve_all: bool, f: impl FnOnce(&mut Ledger)) {
        let mut storage = vec![0xA5_u8; num_slots];
        let mut ledger = unsafe { Ledger::new(num_slots, storage.as_mut_ptr(), reserve_all) };
        f(&mut ledger);
    }

    #[test]
    fn starts_empty() {
        with_ledger(16, false, |ledger| {
            for slot in 0..16 {
                assert_eq!(ledger.get(slot), None);
            }
        });
    }

    #[test]
    fn reserve_all_marks_every_page() {
        with_ledger(16, true, |ledger| {
            for slot in 0..16 {
                assert_eq!(ledger.get(slot), Some(0));
            }
        });
    }

    #[test]
    fn order_zero_is_not_empty() {
        with_ledger(4, false, |ledger| {
            ledger.stamp(1, 0);
            assert_eq!(ledger.get(1), Some(0));
            assert_eq!(ledger.take(1), Some(0));
            assert_eq!(ledger.take(1), None);
        });
    }

    #[test]
    fn stamp_and_take() {
        with_ledger(32, false, |ledger| {
            ledger.stamp(0, 3);
            ledger.stamp(8, 31);

            assert_eq!(ledger.get(0), Some(3));
            assert_eq!(ledger.get(8), Some(31));
            assert_eq!(ledger.get(1), None);

            assert_eq!(ledger.take(8), Some(31));
            assert_eq!(ledger.get(8), None);
            assert_eq!(ledger.take(0), Some(3));
        });
    }

    #[test]
    #[should_panic]
    fn out_of_range_slot_panics() {
        with_ledger(4, false, |ledger| {
            ledger.get(4);
        });
    }
}
