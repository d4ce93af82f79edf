use std::sync::Mutex;

use crate::error::{Error, Result};

const MAX_BITS: u8 = 63;

/// How a write to a [`ConcurrentBitMap`] combines with the bits already set.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteMode {
    /// `true` ORs the bit in, `false` ANDs it out; other bits are untouched.
    Cumulative,
    /// `true` sets exactly this bit and clears every other bit; `false`
    /// behaves as in `Cumulative`.
    Exclusive,
}

/// A set of up to 63 boolean flags that can be written concurrently from
/// several callers (e.g. one bit per caller requesting a connection), with
/// callbacks fired whenever the "is any bit set" predicate flips.
///
/// The read-modify-write and the changed/not-changed decision happen under a
/// single lock; the callback itself runs after the lock is released, so it
/// must not call back into this bitmap or it will deadlock.
pub struct ConcurrentBitMap {
    bits: Mutex<u64>,
}

impl ConcurrentBitMap {
    pub fn new() -> Self {
        ConcurrentBitMap { bits: Mutex::new(0) }
    }

    /// Sets or clears `index` according to `mode`, then invokes `changed` if
    /// the any-bit-set predicate flipped, or `not_changed` otherwise.
    pub fn set(
        &self,
        index: u8,
        value: bool,
        mode: WriteMode,
        changed: impl FnOnce(u64),
        not_changed: impl FnOnce(u64),
    ) -> Result<()> {
        if index > MAX_BITS {
            return Err(Error::InvalidBitmapIndex(index));
        }
        let mask = 1u64 << index;
        let (before, after) = {
            let mut bits = self.bits.lock().unwrap();
            let before = *bits;
            *bits = match (mode, value) {
                (WriteMode::Cumulative, true) => before | mask,
                (WriteMode::Cumulative, false) => before & !mask,
                (WriteMode::Exclusive, true) => mask,
                (WriteMode::Exclusive, false) => before & !mask,
            };
            (before, *bits)
        };
        if (before != 0) != (after != 0) {
            changed(after);
        } else {
            not_changed(after);
        }
        Ok(())
    }

    pub fn get(&self, index: u8) -> Result<bool> {
        if index > MAX_BITS {
            return Err(Error::InvalidBitmapIndex(index));
        }
        Ok(*self.bits.lock().unwrap() & (1u64 << index) != 0)
    }

    pub fn any(&self) -> bool {
        *self.bits.lock().unwrap() != 0
    }

    pub fn value(&self) -> u64 {
        *self.bits.lock().unwrap()
    }

    /// Returns the single set bit's index, or an error if zero or more than
    /// one bit is set.
    pub fn unique_index(&self) -> Result<u8> {
        let bits = *self.bits.lock().unwrap();
        if bits.count_ones() != 1 {
            return Err(Error::NotUnique(bits.count_ones()));
        }
        Ok(bits.trailing_zeros() as u8)
    }

    pub fn clear(&self) {
        *self.bits.lock().unwrap() = 0;
    }
}

impl Default for ConcurrentBitMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn cumulative_set_and_clear() {
        let map = ConcurrentBitMap::new();
        let changed = Cell::new(0);
        let not_changed = Cell::new(0);
        map.set(1, true, WriteMode::Cumulative, |_| changed.set(changed.get() + 1), |_| {
            not_changed.set(not_changed.get() + 1)
        })
        .unwrap();
        assert_eq!(changed.get(), 1);
        map.set(3, true, WriteMode::Cumulative, |_| changed.set(changed.get() + 1), |_| {
            not_changed.set(not_changed.get() + 1)
        })
        .unwrap();
        assert_eq!(changed.get(), 1);
        assert_eq!(not_changed.get(), 1);
        assert_eq!(map.value(), 0b1010);
    }

    #[test]
    fn exclusive_set_overwrites_other_bits_without_firing_changed_if_still_nonzero() {
        let map = ConcurrentBitMap::new();
        map.set(1, true, WriteMode::Cumulative, |_| {}, |_| {}).unwrap();
        map.set(3, true, WriteMode::Cumulative, |_| {}, |_| {}).unwrap();
        map.set(5, true, WriteMode::Cumulative, |_| {}, |_| {}).unwrap();
        assert_eq!(map.value(), 0b101010);

        let changed = Cell::new(false);
        map.set(7, true, WriteMode::Exclusive, |_| changed.set(true), |_| {})
            .unwrap();
        assert_eq!(map.value(), 0b10000000);
        assert!(!changed.get());

        map.set(7, false, WriteMode::Exclusive, |_| changed.set(true), |_| {})
            .unwrap();
        assert_eq!(map.value(), 0);
        assert!(changed.get());
    }

    #[test]
    fn unique_index_requires_exactly_one_bit() {
        let map = ConcurrentBitMap::new();
        assert!(map.unique_index().is_err());
        map.set(4, true, WriteMode::Cumulative, |_| {}, |_| {}).unwrap();
        assert_eq!(map.unique_index().unwrap(), 4);
        map.set(5, true, WriteMode::Cumulative, |_| {}, |_| {}).unwrap();
        assert!(map.unique_index().is_err());
    }

    #[test]
    fn index_boundaries() {
        let map = ConcurrentBitMap::new();
        assert!(map.set(0, true, WriteMode::Cumulative, |_| {}, |_| {}).is_ok());
        assert!(map.set(62, true, WriteMode::Cumulative, |_| {}, |_| {}).is_ok());
        assert!(map.set(63, true, WriteMode::Cumulative, |_| {}, |_| {}).is_ok());
        assert!(map.set(64, true, WriteMode::Cumulative, |_| {}, |_| {}).is_err());
    }
}
