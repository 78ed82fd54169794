//! Matrix-free restarted GMRES.
//!
//! Solves `A x = b` where `A` is only available through a product callback.
//! The iteration works on the weighted system `W A W^-1 (W x) = W b` and
//! stops once `||W (b - A x)||_2 <= tolerance`. Least-squares updates use
//! Givens rotations on the Hessenberg matrix.

use log::trace;
use nalgebra::{DMatrix, DVector};

use super::{GmresError, Orthogonalization, SchurSolverConfig};
use crate::parallel::StatusCode;

/// Statistics of a successful solve.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GmresStats {
    /// Total Arnoldi steps over all cycles
    pub iterations: usize,
    /// Restarts performed
    pub restarts: usize,
    /// Final weighted residual norm
    pub residual: f64,
}

/// Restarted GMRES for a fixed system size.
#[derive(Debug, Clone)]
pub struct Gmres {
    size: usize,
    krylov: usize,
    orthogonalization: Orthogonalization,
    max_restarts: usize,
}

impl Gmres {
    pub fn new(size: usize, config: &SchurSolverConfig) -> Self {
        Gmres {
            size,
            krylov: config.krylov_dimension(size),
            orthogonalization: config.orthogonalization,
            max_restarts: config.max_restarts,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn krylov_dimension(&self) -> usize {
        self.krylov
    }

    pub fn set_orthogonalization(&mut self, orthogonalization: Orthogonalization) {
        self.orthogonalization = orthogonalization;
    }

    pub fn set_max_restarts(&mut self, max_restarts: usize) {
        self.max_restarts = max_restarts;
    }

    /// Solves `A x = rhs`; `x` holds the initial guess and receives the
    /// solution.
    ///
    /// `matvec(v, out)` computes `out = A v` and returns a status code; any
    /// non-zero code aborts the solve.
    pub fn solve<F>(
        &self,
        tolerance: f64,
        weight: &[f64],
        rhs: &[f64],
        x: &mut [f64],
        mut matvec: F,
    ) -> Result<GmresStats, GmresError>
    where
        F: FnMut(&[f64], &mut [f64]) -> StatusCode,
    {
        let n = self.size;
        if n == 0 {
            return Ok(GmresStats::default());
        }

        let w = DVector::from_iterator(n, weight.iter().map(|&wi| if wi > 0.0 { wi } else { 1.0 }));
        let b = DVector::from_column_slice(rhs);
        let m = self.krylov.max(1);

        let mut stats = GmresStats::default();
        let mut av = vec![0.0; n];
        let mut scratch = vec![0.0; n];

        for cycle in 0..=self.max_restarts {
            stats.restarts = cycle;

            // r = W (b - A x)
            check(matvec(&*x, &mut av))?;
            let mut r = DVector::from_fn(n, |i, _| w[i] * (b[i] - av[i]));
            let beta = r.norm();
            stats.residual = beta;
            trace!("GMRES cycle {}: initial residual {:e}", cycle, beta);
            if beta <= tolerance {
                return Ok(stats);
            }

            r /= beta;
            let mut basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
            basis.push(r);

            let mut h = DMatrix::<f64>::zeros(m + 1, m);
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];
            let mut g = DVector::<f64>::zeros(m + 1);
            g[0] = beta;

            let mut k = 0;
            for j in 0..m {
                // u = W A W^-1 v_j
                for i in 0..n {
                    scratch[i] = basis[j][i] / w[i];
                }
                check(matvec(&scratch, &mut av))?;
                let mut u = DVector::from_fn(n, |i, _| w[i] * av[i]);

                self.orthogonalize(&basis, &mut u, &mut h, j);
                let norm = u.norm();
                h[(j + 1, j)] = norm;

                // Rotate the new column into upper triangular form
                for i in 0..j {
                    let (a, c) = (h[(i, j)], h[(i + 1, j)]);
                    h[(i, j)] = cs[i] * a + sn[i] * c;
                    h[(i + 1, j)] = -sn[i] * a + cs[i] * c;
                }
                let (a, c) = (h[(j, j)], h[(j + 1, j)]);
                let rho = a.hypot(c);
                if rho == 0.0 {
                    cs[j] = 1.0;
                    sn[j] = 0.0;
                } else {
                    cs[j] = a / rho;
                    sn[j] = c / rho;
                }
                h[(j, j)] = rho;
                h[(j + 1, j)] = 0.0;
                g[j + 1] = -sn[j] * g[j];
                g[j] *= cs[j];

                k = j + 1;
                stats.iterations += 1;
                stats.residual = g[j + 1].abs();
                trace!("GMRES iteration {}: residual {:e}", stats.iterations, stats.residual);

                if stats.residual <= tolerance || norm == 0.0 {
                    break;
                }
                basis.push(u / norm);
            }

            // Back substitution for the Krylov coefficients
            let mut y = vec![0.0; k];
            for i in (0..k).rev() {
                let diag = h[(i, i)];
                if diag == 0.0 {
                    return Err(GmresError::Breakdown(stats.iterations));
                }
                let mut sum = g[i];
                for l in (i + 1)..k {
                    sum -= h[(i, l)] * y[l];
                }
                y[i] = sum / diag;
            }

            // x += W^-1 V y
            for (coeff, v) in y.iter().zip(&basis) {
                for i in 0..n {
                    x[i] += coeff * v[i] / w[i];
                }
            }

            if stats.residual <= tolerance {
                return Ok(stats);
            }
        }

        Err(GmresError::NotConverged { iterations: stats.iterations, residual: stats.residual })
    }

    fn orthogonalize(&self, basis: &[DVector<f64>], u: &mut DVector<f64>, h: &mut DMatrix<f64>, j: usize) {
        match self.orthogonalization {
            Orthogonalization::Modified => {
                for (i, v) in basis.iter().enumerate().take(j + 1) {
                    let hij = u.dot(v);
                    h[(i, j)] = hij;
                    u.axpy(-hij, v, 1.0);
                }
            }
            Orthogonalization::Classical => {
                let coeffs: Vec<f64> = basis.iter().take(j + 1).map(|v| u.dot(v)).collect();
                for (i, (hij, v)) in coeffs.into_iter().zip(basis).enumerate() {
                    h[(i, j)] = hij;
                    u.axpy(-hij, v, 1.0);
                }
            }
        }
    }
}

fn check(status: StatusCode) -> Result<(), GmresError> {
    if status == 0 { Ok(()) } else { Err(GmresError::MatrixVector(status)) }
}
