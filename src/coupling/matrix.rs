//! Coordinate-format sparse blocks of the coupling Jacobian.

use crate::autodiff::{Active, CouplingScalar, ad_value};

/// One non-zero entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub row: usize,
    pub col: usize,
    pub value: T,
}

/// Sparse matrix stored as a list of `(row, col, value)` triplets.
///
/// Entries are not merged; adding the same position twice stores two
/// entries whose contributions add up in every product.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseCoupling<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for SparseCoupling<T> {
    fn default() -> Self {
        SparseCoupling { entries: Vec::new() }
    }
}

impl<T: CouplingScalar> SparseCoupling<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        SparseCoupling { entries: Vec::with_capacity(capacity) }
    }

    /// Removes all entries, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn add_element(&mut self, row: usize, col: usize, value: T) {
        self.entries.push(Entry { row, col, value });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries.iter()
    }

    /// `y += factor * A x` with plain `x`.
    pub fn multiply_add(&self, x: &[f64], y: &mut [T], factor: f64) {
        for e in &self.entries {
            y[e.row] += e.value.scale(factor * x[e.col]);
        }
    }

    /// `y -= A x`
    pub fn multiply_subtract(&self, x: &[f64], y: &mut [T]) {
        for e in &self.entries {
            y[e.row] -= e.value.scale(x[e.col]);
        }
    }
}

impl SparseCoupling<f64> {
    /// `y += factor * A x` into a residual of any scalar type.
    pub fn multiply_add_into<R: CouplingScalar>(&self, x: &[f64], y: &mut [R], factor: f64) {
        for e in &self.entries {
            y[e.row] += R::from_f64(factor * e.value * x[e.col]);
        }
    }

    /// `y = A x`
    pub fn multiply_vector(&self, x: &[f64], y: &mut [f64]) {
        y.fill(0.0);
        self.multiply_add(x, y, 1.0);
    }

    /// Replaces the entries with the primal values of `other`.
    pub fn copy_from(&mut self, other: &SparseCoupling<Active>) {
        self.entries.clear();
        self.entries
            .extend(other.entries.iter().map(|e| Entry { row: e.row, col: e.col, value: e.value.re }));
    }
}

impl SparseCoupling<Active> {
    /// `y += factor * (dA/dp) x` for AD direction `direction`.
    pub fn derivative_multiply_add(&self, direction: usize, x: &[f64], y: &mut [f64], factor: f64) {
        for e in &self.entries {
            y[e.row] += factor * ad_value(&e.value, direction) * x[e.col];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{active, with_ad_value};

    #[test]
    fn test_products() {
        let mut a = SparseCoupling::<f64>::with_capacity(3);
        a.add_element(0, 1, 2.0);
        a.add_element(1, 0, -1.0);
        a.add_element(1, 0, -1.0);

        let mut y = vec![0.0; 2];
        a.multiply_vector(&[3.0, 4.0], &mut y);
        assert_eq!(y, vec![8.0, -6.0]);

        a.multiply_subtract(&[1.0, 1.0], &mut y);
        assert_eq!(y, vec![6.0, -4.0]);

        a.clear();
        assert!(a.is_empty());
        assert!(a.capacity() >= 3);
    }

    #[test]
    fn test_active_shadow_and_derivative() {
        let rate = with_ad_value(&active(-0.5), 0, -1.0, 1);
        let mut a = SparseCoupling::<Active>::default();
        a.add_element(0, 0, rate);

        let mut plain = SparseCoupling::<f64>::default();
        plain.copy_from(&a);
        assert_eq!(plain.iter().next().map(|e| e.value), Some(-0.5));

        let mut dy = vec![0.0];
        a.derivative_multiply_add(0, &[2.0], &mut dy, 1.0);
        assert_eq!(dy[0], -2.0);

        let mut ad_y = vec![active(0.0)];
        plain.multiply_add_into(&[2.0], &mut ad_y, 1.0);
        assert_eq!(ad_y[0].re, -1.0);
    }
}
