//! Block elimination over the unit network.
//!
//! [`ModelSystem::linear_solve`] eliminates every unit block with the unit's
//! own solver, solves the Schur complement over the coupling DOFs with
//! GMRES and substitutes back. The Schur product is never formed; it is
//! applied by [`SchurProduct`].

use std::sync::Mutex;

use log::{debug, warn};

use crate::coupling::CouplingMatrices;
use crate::layout::DofLayout;
use crate::parallel::{StatusCode, fuse_all, fuse_status, run_per_unit};
use crate::system::{ModelSystem, NOT_CONFIGURED};
use crate::unit::{SimulationTime, UnitOperation};

use super::GmresError;

/// Matrix-free product with `S = I - sum F_i J_i^-1 N_i`.
///
/// Only units with an inlet and an outlet contribute; for all others either
/// `N_i` or `F_i` is empty.
pub(crate) struct SchurProduct<'a> {
    pub units: &'a mut [Box<dyn UnitOperation>],
    pub coupling: &'a CouplingMatrices,
    pub layout: &'a DofLayout,
    /// Global scratch vector, only unit blocks are written
    pub temp: &'a mut [f64],
    pub weight: &'a [f64],
    pub status: &'a mut [StatusCode],
    pub time: SimulationTime,
    pub alpha: f64,
    pub outer_tol: f64,
}

impl SchurProduct<'_> {
    /// `z = S x`
    pub fn apply(&mut self, x: &[f64], z: &mut [f64]) -> StatusCode {
        z.copy_from_slice(x);

        let (temp_blocks, _) = self.layout.split_mut(&mut *self.temp);
        let (weight_blocks, _) = self.layout.split(self.weight);
        let work: Vec<_> = temp_blocks.into_iter().zip(weight_blocks).collect();

        let mut local = vec![0; self.units.len()];
        let z = Mutex::new(z);
        let (coupling, time, alpha, outer_tol) = (self.coupling, self.time, self.alpha, self.outer_tol);

        run_per_unit(&mut *self.units, work, &mut local, |i, unit, (t, weight)| {
            if !(unit.has_inlet() && unit.has_outlet()) {
                return 0;
            }

            // t = J_i^-1 N_i x
            t.fill(0.0);
            coupling.inbound[i].multiply_add(x, t, 1.0);
            let status = unit.linear_solve(time, alpha, outer_tol, t, weight);

            // z -= F_i t, entries of z are shared between units
            match z.lock() {
                Ok(mut z) => {
                    coupling.outbound_plain[i].multiply_subtract(t, &mut **z);
                    status
                }
                Err(_) => -1,
            }
        });

        for (slot, code) in self.status.iter_mut().zip(&local) {
            *slot = fuse_status(*slot, *code);
        }
        fuse_all(local)
    }
}

impl ModelSystem {
    /// Solves `(dF/dy + alpha * time_factor * dF/dẏ) x = rhs` in place.
    ///
    /// Uses the Jacobians captured by the last residual evaluation with
    /// Jacobian. `weight` holds the error weights of all DOFs; `outer_tol`
    /// is the tolerance of the calling Newton iteration.
    pub fn linear_solve(
        &mut self,
        time: SimulationTime,
        alpha: f64,
        outer_tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
    ) -> StatusCode {
        if !self.check_configured("Linear solve") {
            return NOT_CONFIGURED;
        }
        self.reset_error_indicator();
        let layout = &self.layout;

        // Local solves: rhs_i <- J_i^-1 rhs_i
        {
            let (rhs_blocks, _) = layout.split_mut(rhs);
            let (weight_blocks, _) = layout.split(weight);
            let work: Vec<_> = rhs_blocks.into_iter().zip(weight_blocks).collect();
            run_per_unit(&mut self.units, work, &mut self.error_indicator, |_, unit, (rhs, weight)| {
                unit.linear_solve(time, alpha, outer_tol, rhs, weight)
            });
        }

        // Forward elimination: rhs_c -= sum F_i J_i^-1 rhs_i
        let (rhs_blocks, rhs_c) = layout.split_mut(rhs);
        for (outbound, block) in self.coupling.outbound_plain.iter().zip(&rhs_blocks) {
            outbound.multiply_subtract(block, rhs_c);
        }
        drop(rhs_blocks);

        let local_error = fuse_all(self.error_indicator.iter().copied());
        self.error_indicator.iter_mut().for_each(|s| *s = 0);

        let tolerance = (layout.num_dofs() as f64).sqrt() * outer_tol * self.solver.schur_safety;
        let schur_rhs = rhs_c.to_vec();
        let coupling_weight = &weight[layout.coupling_range()];

        let mut product = SchurProduct {
            units: &mut self.units,
            coupling: &self.coupling,
            layout,
            temp: &mut self.temp_state,
            weight,
            status: &mut self.error_indicator,
            time,
            alpha,
            outer_tol,
        };
        let result =
            self.gmres.solve(tolerance, coupling_weight, &schur_rhs, rhs_c, |x, z| product.apply(x, z));

        let gmres_status = match result {
            Ok(stats) => {
                debug!(
                    "Schur complement solved in {} iterations ({} restarts), residual {:e}",
                    stats.iterations, stats.restarts, stats.residual
                );
                0
            }
            Err(err @ GmresError::NotConverged { .. }) => {
                warn!("{}", err);
                err.status()
            }
            Err(err) => {
                warn!("Schur complement solve failed: {}", err);
                err.status()
            }
        };

        let fused = fuse_status(local_error, gmres_status);
        self.error_indicator.iter_mut().for_each(|s| *s = fused);

        // Back substitution: x_i = J_i^-1 rhs_i - J_i^-1 N_i x_c
        let (rhs_blocks, x_c) = layout.split_mut(rhs);
        let x_c: &[f64] = x_c;
        let (temp_blocks, _) = layout.split_mut(&mut self.temp_state);
        let (weight_blocks, _) = layout.split(weight);
        let work: Vec<_> = rhs_blocks.into_iter().zip(temp_blocks).zip(weight_blocks).collect();
        let coupling = &self.coupling;

        run_per_unit(&mut self.units, work, &mut self.error_indicator, |i, unit, ((rhs, t), weight)| {
            if !unit.has_inlet() {
                return 0;
            }
            t.fill(0.0);
            coupling.inbound[i].multiply_add(x_c, t, 1.0);
            let status = unit.linear_solve(time, alpha, outer_tol, t, weight);
            for (r, v) in rhs.iter_mut().zip(t.iter()) {
                *r -= v;
            }
            status
        });

        self.total_error()
    }
}
