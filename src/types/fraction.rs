//! Slice-fraction accounting.
//!
//! An index launch does not know how many slices the mapper will produce, or
//! how deep re-slicing will recurse. Each slice carries a denominator: its
//! share of the whole launch is `1/denominator`, and re-slicing a slice into
//! `k` children multiplies the denominator by `k`. Summing every reported
//! share therefore reaches exactly 1 precisely when all dynamically-produced
//! slices have reported, with no advance knowledge of the count.

use core::fmt;
use serde::Serialize;

const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// A non-negative rational accumulator kept in lowest terms.
#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fraction {
    num: u64,
    den: u64,
}

impl Fraction {
    /// The zero accumulator.
    pub const ZERO: Self = Self { num: 0, den: 1 };

    /// The whole.
    pub const ONE: Self = Self { num: 1, den: 1 };

    /// Numerator in lowest terms.
    #[must_use]
    pub const fn numerator(&self) -> u64 {
        self.num
    }

    /// Denominator in lowest terms.
    #[must_use]
    pub const fn denominator(&self) -> u64 {
        self.den
    }

    /// Adds `1/denominator` and returns the new accumulator.
    ///
    /// # Panics
    ///
    /// Panics if `denominator` is zero.
    #[must_use]
    pub fn add_share(self, denominator: u64) -> Self {
        assert!(denominator > 0, "slice denominator must be non-zero");
        let num = self.num * denominator + self.den;
        let den = self.den * denominator;
        let g = gcd(num, den);
        Self {
            num: num / g,
            den: den / g,
        }
    }

    /// True once the accumulator equals exactly 1.
    #[must_use]
    pub const fn is_whole(&self) -> bool {
        self.num == self.den
    }

    /// True if the accumulator has exceeded 1, which indicates a protocol
    /// violation (a slice reported twice or with a wrong denominator).
    #[must_use]
    pub const fn exceeds_whole(&self) -> bool {
        self.num > self.den
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Debug for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_shares_sum_to_one() {
        let mut f = Fraction::ZERO;
        for _ in 0..4 {
            assert!(!f.is_whole());
            f = f.add_share(4);
        }
        assert!(f.is_whole());
        assert!(!f.exceeds_whole());
    }

    #[test]
    fn recursive_refinement_sums_to_one() {
        // 2 top slices; the second re-slices into 3, one of which re-slices
        // into 2: shares 1/2 + 1/6 + 1/6 + 1/12 + 1/12 = 1.
        let mut f = Fraction::ZERO;
        for den in [2, 6, 6, 12, 12] {
            f = f.add_share(den);
        }
        assert!(f.is_whole());
    }

    #[test]
    fn over_reporting_is_detectable() {
        let f = Fraction::ZERO.add_share(2).add_share(2).add_share(2);
        assert!(f.exceeds_whole());
    }

    #[test]
    fn stays_reduced() {
        let f = Fraction::ZERO.add_share(6).add_share(6).add_share(6);
        assert_eq!(f.numerator(), 1);
        assert_eq!(f.denominator(), 2);
    }
}
