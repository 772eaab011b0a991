//! Floating point traits that the spline transforms are written against.
//!
//! The same generic code runs on plain [f64] when sampling or evaluating a
//! density, and on [TapeVar](super::tape::TapeVar) when the derivatives with
//! respect to the conditioner output are needed for training.

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A number, that is potentially floating point.
///
/// Mixed arithmetic with `f64` constants is required so that formulas
/// can be written without wrapping every literal.
pub trait NumericalFloatLike:
    Copy
    + Debug
    + Neg<Output = Self>
    + Add<Self, Output = Self>
    + Sub<Self, Output = Self>
    + Mul<Self, Output = Self>
    + Div<Self, Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Perform `(self * a) + b`.
    fn mul_add(&self, a: &Self, b: &Self) -> Self;
    fn zero(&self) -> Self;
    fn one(&self) -> Self;
    fn inv(&self) -> Self;
    /// Create a constant that lives in the same context as `self`.
    fn from_f64(&self, a: f64) -> Self;
    fn from_usize(&self, a: usize) -> Self;
    /// The numerical value, used for comparisons and branching.
    fn to_f64(&self) -> f64;

    fn is_finite(&self) -> bool {
        self.to_f64().is_finite()
    }
}

/// A number that behaves like a real number.
pub trait Real: NumericalFloatLike {
    fn norm(&self) -> Self;
    fn sqrt(&self) -> Self;
    fn log(&self) -> Self;
    fn exp(&self) -> Self;

    /// `log(1 + exp(self))`, evaluated without overflow for large arguments.
    fn softplus(&self) -> Self {
        if self.to_f64() > 0. {
            ((-*self).exp() + 1.).log() + *self
        } else {
            (self.exp() + 1.).log()
        }
    }

    /// Clamp the value to `[min, max]`. A clamped result is a constant.
    fn clamp_to(&self, min: f64, max: f64) -> Self {
        let v = self.to_f64();
        if v < min {
            self.from_f64(min)
        } else if v > max {
            self.from_f64(max)
        } else {
            *self
        }
    }
}

impl NumericalFloatLike for f64 {
    #[inline(always)]
    fn mul_add(&self, a: &Self, b: &Self) -> Self {
        f64::mul_add(*self, *a, *b)
    }

    #[inline(always)]
    fn zero(&self) -> Self {
        0.
    }

    #[inline(always)]
    fn one(&self) -> Self {
        1.
    }

    #[inline(always)]
    fn inv(&self) -> Self {
        1. / self
    }

    #[inline(always)]
    fn from_f64(&self, a: f64) -> Self {
        a
    }

    #[inline(always)]
    fn from_usize(&self, a: usize) -> Self {
        a as f64
    }

    #[inline(always)]
    fn to_f64(&self) -> f64 {
        *self
    }
}

impl Real for f64 {
    #[inline(always)]
    fn norm(&self) -> Self {
        f64::abs(*self)
    }

    #[inline(always)]
    fn sqrt(&self) -> Self {
        (*self).sqrt()
    }

    #[inline(always)]
    fn log(&self) -> Self {
        (*self).ln()
    }

    #[inline(always)]
    fn exp(&self) -> Self {
        (*self).exp()
    }
}

#[cfg(test)]
mod test {
    use super::Real;

    #[test]
    fn softplus() {
        assert!((0f64.softplus() - 2f64.ln()).abs() < 1e-15);
        assert!((800f64.softplus() - 800.).abs() < 1e-12);
        assert!((-800f64).softplus() >= 0.);
        assert!((1.5f64.softplus() - (1. + 1.5f64.exp()).ln()).abs() < 1e-14);
    }

    #[test]
    fn clamp() {
        assert_eq!((-0.5f64).clamp_to(0., 1.), 0.);
        assert_eq!(1.5f64.clamp_to(0., 1.), 1.);
        assert_eq!(0.25f64.clamp_to(0., 1.), 0.25);
    }
}
