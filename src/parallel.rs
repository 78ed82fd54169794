//! Parallel execution of per-unit work and status fusion.
//!
//! Every phase that touches units (residual, local linear solves, Schur
//! mat-vec, sensitivities) fans out over the unit collection. Each task
//! writes only into its own DOF block and its own status slot; results are
//! combined after the phase barrier.
//!
//! With the `parallel` feature the fan-out runs on the rayon thread pool,
//! otherwise units are processed in order on the calling thread.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::unit::UnitOperation;

/// Status returned by residual, Jacobian and solve calls.
///
/// `0` = success, `> 0` = recoverable, `< 0` = non-recoverable.
pub type StatusCode = i32;

/// Fuses two status codes.
///
/// Any negative code wins (the most negative one); otherwise the largest
/// code wins. The operation is associative and commutative with identity 0.
#[inline]
pub fn fuse_status(a: StatusCode, b: StatusCode) -> StatusCode {
    if a < 0 || b < 0 { a.min(b) } else { a.max(b) }
}

/// Fuses any number of status codes.
pub fn fuse_all<I>(codes: I) -> StatusCode
where
    I: IntoIterator<Item = StatusCode>,
{
    codes.into_iter().fold(0, fuse_status)
}

/// Runs `task` once per unit and fuses its status into the unit's slot.
///
/// `work` supplies one item per unit (typically disjoint slices of a global
/// vector). The task receives the unit index, the unit and its work item.
pub(crate) fn run_per_unit<W, F>(
    units: &mut [Box<dyn UnitOperation>],
    work: Vec<W>,
    status: &mut [StatusCode],
    task: F,
) where
    W: Send,
    F: Fn(usize, &mut dyn UnitOperation, W) -> StatusCode + Send + Sync,
{
    debug_assert_eq!(units.len(), work.len());
    debug_assert_eq!(units.len(), status.len());

    #[cfg(feature = "parallel")]
    units.par_iter_mut().zip(work.into_par_iter()).zip(status.par_iter_mut()).enumerate().for_each(
        |(i, ((unit, item), slot))| {
            *slot = fuse_status(*slot, task(i, unit.as_mut(), item));
        },
    );

    #[cfg(not(feature = "parallel"))]
    for (i, ((unit, item), slot)) in units.iter_mut().zip(work).zip(status.iter_mut()).enumerate() {
        *slot = fuse_status(*slot, task(i, unit.as_mut(), item));
    }
}

/// Runs `task` once per item, in parallel when enabled.
pub(crate) fn run_per_item<W, F>(work: Vec<W>, task: F)
where
    W: Send,
    F: Fn(usize, W) + Send + Sync,
{
    #[cfg(feature = "parallel")]
    work.into_par_iter().enumerate().for_each(|(i, item)| task(i, item));

    #[cfg(not(feature = "parallel"))]
    for (i, item) in work.into_iter().enumerate() {
        task(i, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fusion_negative_wins() {
        assert_eq!(fuse_all([0, -2, 3]), -2);
        assert_eq!(fuse_all([-1, -5, 4]), -5);
    }

    #[test]
    fn test_fusion_maximum_of_non_negative() {
        assert_eq!(fuse_all([0, 2, 3]), 3);
        assert_eq!(fuse_all(Vec::<StatusCode>::new()), 0);
    }

    #[test]
    fn test_fusion_order_independent() {
        let codes = [0, -2, 3, 1, -7, 5];
        let expected = fuse_all(codes);

        // All rotations and the reversed order
        for shift in 0..codes.len() {
            let mut rotated = codes;
            rotated.rotate_left(shift);
            assert_eq!(fuse_all(rotated), expected);
            rotated.reverse();
            assert_eq!(fuse_all(rotated), expected);
        }

        // Associativity on all triples
        for &a in &codes {
            for &b in &codes {
                for &c in &codes {
                    assert_eq!(
                        fuse_status(fuse_status(a, b), c),
                        fuse_status(a, fuse_status(b, c))
                    );
                    assert_eq!(fuse_status(a, b), fuse_status(b, a));
                }
            }
        }
    }

    #[test]
    fn test_run_per_item_visits_all() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let counter = AtomicUsize::new(0);
        let mut data = vec![0usize; 8];
        let items: Vec<&mut usize> = data.iter_mut().collect();
        run_per_item(items, |i, slot| {
            *slot = i * 2;
            counter.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(counter.load(Ordering::Relaxed), 8);
        assert_eq!(data, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }
}
