//! Per-leaf adaptation counter and the conversion heuristics it drives
//! (spec Section 4.7). The counter lives out-of-band in [`PageStore`],
//! indexed by [`PageId`], rather than packed into the page's header byte -
//! see DESIGN.md for why.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::rand;

pub const MAX_COUNT: u8 = 3;
pub const SENTINEL: u8 = 255;

/// Probabilities (as a percent, 0..=100) that a range/point access nudges
/// the counter. Exposed via [`crate::PolydexConfig`] rather than hardcoded,
/// since the spec leaves the exact figures as a tunable (spec Open
/// Question "adaptation probabilities").
#[derive(Clone, Copy, Debug)]
pub struct AdaptationRates {
    pub range_op_pct: u8,
    pub point_op_pct: u8,
}

impl Default for AdaptationRates {
    fn default() -> AdaptationRates {
        AdaptationRates {
            range_op_pct: 15,
            point_op_pct: 5,
        }
    }
}

/// A single leaf's counter cell. `SENTINEL` means "never recorded an
/// access" (a brand-new leaf); every other value is clamped to
/// `0..=MAX_COUNT`.
pub struct Counter<'a> {
    cell: &'a AtomicU8,
}

impl<'a> Counter<'a> {
    pub fn new(cell: &'a AtomicU8) -> Counter<'a> {
        Counter { cell }
    }

    pub fn get(&self) -> u8 {
        self.cell.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.cell.store(SENTINEL, Ordering::Relaxed);
    }

    /// Called on every range lookup/scan that touches this leaf. Biases the
    /// counter up, toward "this leaf is scanned, prefer a dense/sorted
    /// format".
    pub fn on_range_op(&self, rates: AdaptationRates) {
        if !rand::chance(rates.range_op_pct) {
            return;
        }
        self.bump(1);
    }

    /// Called on every point lookup/insert. Biases the counter down, toward
    /// "this leaf is point-accessed, prefer the hash format".
    pub fn on_point_op(&self, rates: AdaptationRates) {
        if !rand::chance(rates.point_op_pct) {
            return;
        }
        self.bump(-1);
    }

    fn bump(&self, delta: i8) {
        let mut cur = self.cell.load(Ordering::Relaxed);
        loop {
            let effective = if cur == SENTINEL { MAX_COUNT / 2 } else { cur };
            let next = (effective as i16 + delta as i16).clamp(0, MAX_COUNT as i16) as u8;
            match self.cell.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

/// Whether a leaf that just hit `MAX_COUNT` via range ops should convert
/// from a point-oriented format (hash) to a range-oriented one (basic).
pub fn favors_basic(counter: u8) -> bool {
    counter != SENTINEL && counter >= MAX_COUNT
}

/// Whether a leaf that just bottomed out via point ops should convert from
/// a range-oriented format (basic/dense) to the hash format.
pub fn favors_hash(counter: u8) -> bool {
    counter == 0
}

/// Whether `counter` sits in the low half of its range - point-access
/// leaning, but not yet all the way to [`favors_hash`]'s hard floor. Used
/// at split time (spec 4.7): a basic leaf with bad heads and a low-band
/// counter splits straight into two hash leaves instead of two basic ones.
pub fn in_low_band(counter: u8) -> bool {
    counter != SENTINEL && counter <= MAX_COUNT / 2
}
