//! Exact rational arithmetic for musical time.
//!
//! Every duration and start offset in a parsed piece is a [`Fraction`], so
//! timing never drifts the way repeated floating-point sums do. Fractions are
//! immutable value objects kept in lowest terms by construction: the sign
//! lives on the numerator, the denominator is strictly positive, and zero is
//! canonicalized to 0/1.

use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FractionError {
    #[error("fraction {0}/0 has a zero denominator")]
    ZeroDenominator(i64),

    #[error("the zero fraction has no inverse")]
    InvertZero,
}

/// Greatest common divisor of two integers by Euclid's algorithm.
///
/// `gcd(0, n)` is `n`, matching the recursive base case.
pub fn gcd(first: i64, second: i64) -> i64 {
    if second == 0 {
        return first.abs();
    }
    gcd(second, first % second)
}

/// Least common multiple of two nonzero integers.
pub fn lcm(first: i64, second: i64) -> i64 {
    (first * second).abs() / gcd(first, second)
}

/// An exact rational number.
///
/// Invariant: `gcd(|numerator|, denominator) == 1` and `denominator > 0`;
/// the zero fraction is always `0/1`. Equality is structural, which is
/// equivalent to numeric equality under the invariant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fraction {
    numerator: i64,
    denominator: i64,
}

impl Fraction {
    pub const ZERO: Fraction = Fraction {
        numerator: 0,
        denominator: 1,
    };

    /// Builds a fraction reduced to lowest terms.
    ///
    /// Fails if `denominator` is zero.
    pub fn new(numerator: i64, denominator: i64) -> Result<Self, FractionError> {
        if denominator == 0 {
            return Err(FractionError::ZeroDenominator(numerator));
        }
        Ok(Self::reduced(numerator, denominator))
    }

    /// Internal constructor for a denominator already known to be nonzero.
    /// Arithmetic on valid fractions can never produce an invalid one.
    fn reduced(numerator: i64, denominator: i64) -> Self {
        debug_assert!(denominator != 0);
        if numerator == 0 {
            return Self::ZERO;
        }
        let sign = if (numerator < 0) == (denominator < 0) {
            1
        } else {
            -1
        };
        let numerator = numerator.abs();
        let denominator = denominator.abs();
        let divisor = gcd(numerator, denominator);
        Self {
            numerator: sign * numerator / divisor,
            denominator: denominator / divisor,
        }
    }

    pub fn numerator(self) -> i64 {
        self.numerator
    }

    pub fn denominator(self) -> i64 {
        self.denominator
    }

    pub fn is_zero(self) -> bool {
        self.numerator == 0
    }

    pub fn is_positive(self) -> bool {
        self.numerator > 0
    }

    /// The multiplicative inverse. Fails on the zero fraction.
    pub fn invert(self) -> Result<Self, FractionError> {
        if self.numerator == 0 {
            return Err(FractionError::InvertZero);
        }
        Ok(Self::reduced(self.denominator, self.numerator))
    }

    /// Divides by `other`. Fails if `other` is zero.
    pub fn quotient(self, other: Fraction) -> Result<Self, FractionError> {
        Ok(self * other.invert()?)
    }

    /// A floating-point approximation, for display only. Exact arithmetic
    /// must never flow through this value.
    pub fn approximation(self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// The largest fraction that divides both `self` and `other` a whole
    /// number of times: the common subdivision unit of two durations.
    pub fn gcd(self, other: Fraction) -> Fraction {
        Self::reduced(
            gcd(
                self.numerator * other.denominator,
                other.numerator * self.denominator,
            ),
            self.denominator * other.denominator,
        )
    }
}

impl From<i64> for Fraction {
    fn from(value: i64) -> Self {
        Fraction {
            numerator: value,
            denominator: 1,
        }
    }
}

impl Add for Fraction {
    type Output = Fraction;

    fn add(self, other: Fraction) -> Fraction {
        Fraction::reduced(
            self.numerator * other.denominator + other.numerator * self.denominator,
            self.denominator * other.denominator,
        )
    }
}

impl Sub for Fraction {
    type Output = Fraction;

    fn sub(self, other: Fraction) -> Fraction {
        self + (-other)
    }
}

impl Mul for Fraction {
    type Output = Fraction;

    fn mul(self, other: Fraction) -> Fraction {
        Fraction::reduced(
            self.numerator * other.numerator,
            self.denominator * other.denominator,
        )
    }
}

impl Mul<i64> for Fraction {
    type Output = Fraction;

    fn mul(self, other: i64) -> Fraction {
        self * Fraction::from(other)
    }
}

impl Neg for Fraction {
    type Output = Fraction;

    fn neg(self) -> Fraction {
        Fraction {
            numerator: -self.numerator,
            denominator: self.denominator,
        }
    }
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Fraction) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Fraction) -> Ordering {
        // Cross-multiply in i128 so large denominators cannot overflow.
        let left = self.numerator as i128 * other.denominator as i128;
        let right = other.numerator as i128 * self.denominator as i128;
        left.cmp(&right)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl fmt::Debug for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fraction({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frac(n: i64, d: i64) -> Fraction {
        Fraction::new(n, d).unwrap()
    }

    #[test]
    fn test_integer_gcd() {
        assert_eq!(gcd(1, 5), 1);
        assert_eq!(gcd(5, 1), 1);
        assert_eq!(gcd(0, 10), 10);
        assert_eq!(gcd(9, 27), 9);
        assert_eq!(gcd(42, 35), 7);
        assert_eq!(gcd(1, 2), 1);
    }

    #[test]
    fn test_integer_lcm() {
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(3, 5), 15);
        assert_eq!(lcm(8, 8), 8);
    }

    #[test]
    fn test_constructor_reduces() {
        let f = frac(2, 4);
        assert_eq!(f.numerator(), 1);
        assert_eq!(f.denominator(), 2);

        let g = frac(9, 27);
        assert_eq!(g.numerator(), 1);
        assert_eq!(g.denominator(), 3);
    }

    #[test]
    fn test_invariant_holds_for_all_construction_paths() {
        for (n, d) in [(6, 8), (-6, 8), (6, -8), (-6, -8), (0, 7), (12, 3)] {
            let f = frac(n, d);
            assert!(f.denominator() > 0);
            assert_eq!(gcd(f.numerator().abs(), f.denominator()), 1);
        }
    }

    #[test]
    fn test_zero_is_canonical() {
        let z = frac(0, 99);
        assert_eq!(z.numerator(), 0);
        assert_eq!(z.denominator(), 1);
        assert_eq!(z, Fraction::ZERO);
    }

    #[test]
    fn test_sign_lives_on_numerator() {
        let f = frac(3, -6);
        assert_eq!(f.numerator(), -1);
        assert_eq!(f.denominator(), 2);
        assert_eq!(frac(-3, -6), frac(1, 2));
    }

    #[test]
    fn test_zero_denominator_rejected() {
        assert_eq!(Fraction::new(1, 0), Err(FractionError::ZeroDenominator(1)));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(frac(1, 2) + frac(1, 3), frac(5, 6));
        assert_eq!(frac(1, 2) - frac(1, 3), frac(1, 6));
        assert_eq!(frac(1, 3) - frac(1, 2), frac(-1, 6));
        assert_eq!(frac(2, 3) * frac(3, 4), frac(1, 2));
        assert_eq!(frac(1, 8) * 3, frac(3, 8));
        assert_eq!(frac(1, 2).quotient(frac(1, 8)).unwrap(), frac(4, 1));
    }

    #[test]
    fn test_invert() {
        assert_eq!(frac(2, 3).invert().unwrap(), frac(3, 2));
        assert_eq!(frac(-2, 3).invert().unwrap(), frac(-3, 2));
        assert_eq!(Fraction::ZERO.invert(), Err(FractionError::InvertZero));
        assert_eq!(
            frac(1, 4).quotient(Fraction::ZERO),
            Err(FractionError::InvertZero)
        );
    }

    #[test]
    fn test_fraction_gcd_finds_common_subdivision() {
        assert_eq!(frac(1, 4).gcd(frac(1, 6)), frac(1, 12));
        assert_eq!(frac(1, 8).gcd(frac(1, 8)), frac(1, 8));
        assert_eq!(frac(3, 8).gcd(frac(1, 4)), frac(1, 8));
        // Both arguments are integer multiples of the result.
        let g = frac(1, 6).gcd(frac(3, 4));
        assert_eq!(frac(1, 6).quotient(g).unwrap().denominator(), 1);
        assert_eq!(frac(3, 4).quotient(g).unwrap().denominator(), 1);
    }

    #[test]
    fn test_ordering() {
        assert!(frac(1, 3) < frac(1, 2));
        assert!(frac(3, 8) > frac(1, 4));
        assert!(frac(-1, 2) < Fraction::ZERO);
        assert_eq!(frac(2, 4).cmp(&frac(1, 2)), Ordering::Equal);
    }

    #[test]
    fn test_display() {
        assert_eq!(frac(3, 4).to_string(), "3/4");
        assert_eq!(Fraction::ZERO.to_string(), "0/1");
        assert_eq!(frac(-1, 8).to_string(), "-1/8");
    }

    #[test]
    fn test_approximation() {
        assert_eq!(frac(1, 2).approximation(), 0.5);
        assert_eq!(frac(-3, 4).approximation(), -0.75);
    }
}
