//! Sensitivity-capable scalars built on `num-dual`.
//!
//! Flow rates and unit parameters are stored as [`Active`] values: a primal
//! value plus a vector of directional derivatives, one direction per
//! registered sensitivity parameter. Coupling routines are written once,
//! generic over [`CouplingScalar`], and instantiated for `f64` (plain
//! residuals and linear solves) and [`Active`] (sensitivity residuals).
//!
//! # Example
//!
//! ```
//! use nomata_network::autodiff::{active, ad_value, with_ad_value};
//!
//! let rate = with_ad_value(&active(2.5), 1, 1.0, 2);
//! assert_eq!(rate.re, 2.5);
//! assert_eq!(ad_value(&rate, 0), 0.0);
//! assert_eq!(ad_value(&rate, 1), 1.0);
//! ```

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use nalgebra::{DMatrix, DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64};

/// Dual number with a dynamic number of derivative directions.
pub type Active = DualDVec64;

/// Numeric type the coupling layer is generic over.
///
/// Implemented for `f64` and [`Active`]. State vectors are always plain;
/// only coefficients and residuals switch between the two.
pub trait CouplingScalar:
    Clone
    + Debug
    + Send
    + Sync
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
{
    /// Lifts a plain value (no derivative information).
    fn from_f64(value: f64) -> Self;

    /// Converts an active coefficient, dropping derivatives for `f64`.
    fn from_active(value: &Active) -> Self;

    /// Primal value.
    fn value(&self) -> f64;

    /// Returns `self * factor`.
    fn scale(&self, factor: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }
}

impl CouplingScalar for f64 {
    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn from_active(value: &Active) -> Self {
        value.re
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn scale(&self, factor: f64) -> Self {
        self * factor
    }
}

impl CouplingScalar for Active {
    #[inline]
    fn from_f64(value: f64) -> Self {
        active(value)
    }

    #[inline]
    fn from_active(value: &Active) -> Self {
        value.clone()
    }

    #[inline]
    fn value(&self) -> f64 {
        self.re
    }

    #[inline]
    fn scale(&self, factor: f64) -> Self {
        self.clone() * factor
    }
}

/// Creates an active value without derivative directions.
pub fn active(value: f64) -> Active {
    Active::new(value, Derivative::none())
}

/// Reads the derivative in `direction`, zero if the direction is not seeded.
pub fn ad_value(value: &Active, direction: usize) -> f64 {
    let eps = value.eps.clone().unwrap_generic(Dyn(direction + 1), U1);
    eps.get(direction).copied().unwrap_or(0.0)
}

/// Returns a copy of `value` whose derivative in `direction` is `seed`.
///
/// Other directions keep their current derivatives. The derivative vector is
/// padded to at least `width` entries; all seeded values taking part in one
/// evaluation must share the same width.
pub fn with_ad_value(value: &Active, direction: usize, seed: f64, width: usize) -> Active {
    let current = value.eps.clone().unwrap_generic(Dyn(direction + 1), U1);
    let width = current.len().max(direction + 1).max(width);
    let eps = DVector::from_fn(width, |i, _| {
        if i == direction { seed } else { current.get(i).copied().unwrap_or(0.0) }
    });
    Active::new(value.re, Derivative::some(eps))
}

/// Drops all derivative directions.
pub fn strip_ad(value: &Active) -> Active {
    active(value.re)
}

/// Dense forward-difference Jacobian of `f` at `x`.
///
/// `f` writes its residual into the provided output slice, which has
/// `n_equations` entries. The step for variable `j` is
/// `eps * max(1, |x_j|)`.
pub fn finite_difference_jacobian<F>(mut f: F, x: &[f64], n_equations: usize, eps: f64) -> DMatrix<f64>
where
    F: FnMut(&[f64], &mut [f64]),
{
    let n_vars = x.len();
    let mut jacobian = DMatrix::zeros(n_equations, n_vars);

    let mut base = vec![0.0; n_equations];
    f(x, &mut base);

    let mut perturbed = x.to_vec();
    let mut shifted = vec![0.0; n_equations];
    for j in 0..n_vars {
        let h = eps * x[j].abs().max(1.0);
        perturbed[j] = x[j] + h;
        f(&perturbed, &mut shifted);
        perturbed[j] = x[j];

        for i in 0..n_equations {
            jacobian[(i, j)] = (shifted[i] - base[i]) / h;
        }
    }

    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weighted_sum<T: CouplingScalar>(coefficients: &[T], values: &[f64]) -> T {
        coefficients
            .iter()
            .zip(values)
            .fold(T::zero(), |acc, (c, v)| acc + c.scale(*v))
    }

    #[test]
    fn test_ad_value_of_unseeded() {
        let x = active(3.0);
        assert_eq!(x.re, 3.0);
        assert_eq!(ad_value(&x, 0), 0.0);
        assert_eq!(ad_value(&x, 4), 0.0);
    }

    #[test]
    fn test_seeding_keeps_other_directions() {
        let x = with_ad_value(&active(1.5), 0, 2.0, 3);
        let x = with_ad_value(&x, 2, -1.0, 3);
        assert_eq!(ad_value(&x, 0), 2.0);
        assert_eq!(ad_value(&x, 1), 0.0);
        assert_eq!(ad_value(&x, 2), -1.0);

        let stripped = strip_ad(&x);
        assert_eq!(stripped.re, 1.5);
        assert_eq!(ad_value(&stripped, 0), 0.0);
    }

    #[test]
    fn test_generic_path_matches_for_both_scalars() {
        let values = [1.0, 2.0];
        let plain = weighted_sum(&[0.5, -1.0], &values);

        let coefficients = [with_ad_value(&active(0.5), 0, 1.0, 1), active(-1.0)];
        let dual = weighted_sum(&coefficients, &values);

        assert!((plain - dual.re).abs() < 1e-14);
        // d/dc0 (c0 * 1 + c1 * 2) = 1
        assert!((ad_value(&dual, 0) - 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_quotient_derivative() {
        // d/dr (r / (r + 1)) = 1 / (r + 1)^2
        let r = with_ad_value(&active(1.0), 0, 1.0, 1);
        let q = r.clone() / (r + active(1.0));
        assert!((q.re - 0.5).abs() < 1e-14);
        assert!((ad_value(&q, 0) - 0.25).abs() < 1e-14);
    }

    #[test]
    fn test_finite_difference_jacobian() {
        // f(x, y) = [x^2, xy]
        let f = |v: &[f64], out: &mut [f64]| {
            out[0] = v[0] * v[0];
            out[1] = v[0] * v[1];
        };
        let jac = finite_difference_jacobian(f, &[2.0, 3.0], 2, 1e-7);

        assert!((jac[(0, 0)] - 4.0).abs() < 1e-5);
        assert!(jac[(0, 1)].abs() < 1e-5);
        assert!((jac[(1, 0)] - 3.0).abs() < 1e-5);
        assert!((jac[(1, 1)] - 2.0).abs() < 1e-5);
    }
}
