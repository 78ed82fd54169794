//! Global residual assembly.
//!
//! Unit residuals are evaluated in parallel, each into its own block. The
//! coupling equations are appended afterwards:
//!
//! ```text
//! res_i += N_i y_c          (inlet of unit i equals its coupling values)
//! res_c  = y_c + sum F_i y_i (coupling values equal the mixed outlets)
//! ```

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::autodiff::finite_difference_jacobian;
use crate::coupling::OutboundSelect;
use crate::parallel::{StatusCode, run_per_item, run_per_unit};
use crate::system::{ModelSystem, NOT_CONFIGURED};
use crate::unit::SimulationTime;

impl ModelSystem {
    /// Evaluates the global residual `F(t, y, ẏ)`. A missing `y_dot` is
    /// treated as zero.
    pub fn residual(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode {
        self.unit_residuals(time, y, y_dot, res, false)
    }

    /// Evaluates the global residual and refreshes all unit Jacobians.
    pub fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode {
        self.unit_residuals(time, y, y_dot, res, true)
    }

    fn unit_residuals(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
        with_jacobian: bool,
    ) -> StatusCode {
        if !self.check_configured("Residual") {
            return NOT_CONFIGURED;
        }
        self.reset_error_indicator();

        let (y_blocks, _) = self.layout.split(y);
        let y_dot_blocks: Vec<Option<&[f64]>> = match y_dot {
            Some(y_dot) => self.layout.split(y_dot).0.into_iter().map(Some).collect(),
            None => vec![None; self.units.len()],
        };
        let (res_blocks, _) = self.layout.split_mut(res);
        let work: Vec<_> = y_blocks.into_iter().zip(y_dot_blocks).zip(res_blocks).collect();

        run_per_unit(&mut self.units, work, &mut self.error_indicator, |_, unit, ((y, y_dot), res)| {
            if with_jacobian {
                unit.residual_with_jacobian(time, y, y_dot, res)
            } else {
                unit.residual(time, y, y_dot, res)
            }
        });

        self.residual_connect(y, res);
        self.total_error()
    }

    /// Appends the coupling equations to a residual of either scalar type.
    pub(crate) fn residual_connect<R: OutboundSelect>(&self, y: &[f64], res: &mut [R]) {
        let coupling = self.layout.coupling_range();
        let y_c = &y[coupling.clone()];

        for (i, inbound) in self.coupling.inbound.iter().enumerate() {
            inbound.multiply_add_into(y_c, &mut res[self.layout.unit_range(i)], 1.0);
        }

        let res_c = &mut res[coupling];
        for (r, &v) in res_c.iter_mut().zip(y_c) {
            *r = R::from_f64(v);
        }
        for i in 0..self.units.len() {
            R::outbound(&self.coupling, i).multiply_add(&y[self.layout.unit_range(i)], res_c, 1.0);
        }
    }

    /// Infinity norm of `F(t, y, ẏ)`, infinite if the residual cannot be
    /// evaluated.
    pub fn residual_norm(&mut self, time: SimulationTime, y: &[f64], y_dot: Option<&[f64]>) -> f64 {
        if !self.is_configured() {
            return f64::INFINITY;
        }
        let mut res = std::mem::take(&mut self.temp_state);
        res.resize(self.layout.num_dofs(), 0.0);
        self.residual(time, y, y_dot, &mut res);
        let norm = res.iter().fold(0.0_f64, |acc, r| acc.max(r.abs()));
        self.temp_state = res;
        norm
    }

    /// `ret = alpha * dF/dy * s + beta * ret` using the stored Jacobians.
    pub fn multiply_with_jacobian(&self, time: SimulationTime, s: &[f64], alpha: f64, beta: f64, ret: &mut [f64]) {
        if !self.check_configured("Jacobian product") {
            return;
        }
        let coupling = self.layout.coupling_range();
        let s_c = &s[coupling];
        let (s_blocks, _) = self.layout.split(s);
        let (ret_blocks, ret_c) = self.layout.split_mut(ret);

        let work: Vec<_> = self.units.iter().zip(&self.coupling.inbound).zip(s_blocks).zip(ret_blocks).collect();
        run_per_item(work, |_, (((unit, inbound), s), ret)| {
            unit.multiply_with_jacobian(time, s, alpha, beta, ret);
            inbound.multiply_add(s_c, ret, alpha);
        });

        for (r, &v) in ret_c.iter_mut().zip(s_c) {
            *r = alpha * v + beta * *r;
        }
        for (i, outbound) in self.coupling.outbound_plain.iter().enumerate() {
            outbound.multiply_add(&s[self.layout.unit_range(i)], ret_c, alpha);
        }
    }

    /// `ret = time_factor * dF/dẏ * s_dot`; the coupling equations do not
    /// depend on `ẏ`.
    pub fn multiply_with_derivative_jacobian(&self, time: SimulationTime, s_dot: &[f64], ret: &mut [f64]) {
        if !self.check_configured("Jacobian product") {
            return;
        }
        let (s_blocks, _) = self.layout.split(s_dot);
        let (ret_blocks, ret_c) = self.layout.split_mut(ret);

        let work: Vec<_> = self.units.iter().zip(s_blocks).zip(ret_blocks).collect();
        run_per_item(work, |_, ((unit, s_dot), ret)| {
            unit.multiply_with_derivative_jacobian(time, s_dot, ret);
        });
        ret_c.fill(0.0);
    }

    /// Dense Jacobians for debugging: forward differences of the residual
    /// and the matrix assembled from [`multiply_with_jacobian`](Self::multiply_with_jacobian).
    ///
    /// Returns `(finite differences, analytic)`. Units capture their
    /// Jacobian at `y` before the analytic matrix is formed.
    pub fn generate_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let n = self.layout.num_dofs();
        let fd = finite_difference_jacobian(
            |x, out| {
                self.residual(time, x, y_dot, out);
            },
            y,
            n,
            1e-6,
        );

        let mut res = vec![0.0; n];
        let status = self.residual_with_jacobian(time, y, y_dot, &mut res);
        if status != 0 {
            warn!("Residual evaluation for Jacobian returned status {}", status);
        }

        let mut analytic = DMatrix::zeros(n, n);
        let mut unit_vec = vec![0.0; n];
        let mut column = vec![0.0; n];
        for j in 0..n {
            unit_vec[j] = 1.0;
            self.multiply_with_jacobian(time, &unit_vec, 1.0, 0.0, &mut column);
            analytic.set_column(j, &DVector::from_column_slice(&column));
            unit_vec[j] = 0.0;
        }
        (fd, analytic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Inlet, Outlet, StirredTank};
    use crate::network::{ConnectionRow, SwitchSpec};
    use crate::solvers::SchurSolverConfig;
    use crate::unit::UnitId;
    use approx::assert_relative_eq;

    /// Two inlets mixed into a tank feeding an outlet.
    fn mixer() -> ModelSystem {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0, 2.0]))).unwrap();
        system.add_unit(Box::new(Inlet::new(UnitId(1), vec![3.0, 0.0]))).unwrap();
        system.add_unit(Box::new(StirredTank::new(UnitId(2), 2, 1.5))).unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(3), 2))).unwrap();
        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(2), 1.0),
            ConnectionRow::new(UnitId(1), UnitId(2), 3.0),
            ConnectionRow::new(UnitId(2), UnitId(3), 4.0),
        ]);
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
        system
    }

    /// State whose coupling values are the mixed outlets.
    fn mixed_state(system: &ModelSystem) -> Vec<f64> {
        let mut y = vec![0.0; system.num_dofs()];
        y[0..2].copy_from_slice(&[1.0, 2.0]);
        y[2..4].copy_from_slice(&[3.0, 0.0]);
        // tank: c_in (2), c (2), q (2)
        let tank = system.layout().unit_range(2);
        y[tank.start + 2] = 0.7;
        y[tank.start + 3] = 0.1;
        let c = system.layout().coupling_range();
        y[c.start] = 0.25 * 1.0 + 0.75 * 3.0;
        y[c.start + 1] = 0.25 * 2.0 + 0.75 * 0.0;
        y[c.start + 2] = 0.7;
        y[c.start + 3] = 0.1;
        y
    }

    #[test]
    fn test_coupling_rows_vanish_for_mixed_state() {
        let mut system = mixer();
        let y = mixed_state(&system);
        let mut res = vec![f64::NAN; system.num_dofs()];
        let status = system.residual(SimulationTime::new(0.0, 0), &y, None, &mut res);
        assert_eq!(status, 0);

        for &r in &res[system.layout().coupling_range()] {
            assert_relative_eq!(r, 0.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_inlet_rows_see_coupling_values() {
        let mut system = mixer();
        let y = mixed_state(&system);
        let mut res = vec![0.0; system.num_dofs()];
        system.residual(SimulationTime::new(0.0, 0), &y, None, &mut res);

        // Tank inlet residual is c_in - coupling, c_in is zero in the state
        let tank = system.layout().unit_range(2);
        let c = system.layout().coupling_range();
        assert_relative_eq!(res[tank.start], -y[c.start], epsilon = 1e-14);
        assert_relative_eq!(res[tank.start + 1], -y[c.start + 1], epsilon = 1e-14);
    }

    #[test]
    fn test_residual_norm() {
        let mut system = mixer();
        let y = mixed_state(&system);
        let mut res = vec![0.0; system.num_dofs()];
        system.residual(SimulationTime::new(0.0, 0), &y, None, &mut res);
        let expected = res.iter().fold(0.0_f64, |acc, r| acc.max(r.abs()));
        assert_eq!(system.residual_norm(SimulationTime::new(0.0, 0), &y, None), expected);
    }

    #[test]
    fn test_jacobian_product_matches_finite_differences() {
        let mut system = mixer();
        let y = mixed_state(&system);
        let y_dot = vec![0.1; system.num_dofs()];
        let (fd, analytic) = system.generate_jacobian(SimulationTime::new(0.0, 0), &y, Some(&y_dot));

        for i in 0..fd.nrows() {
            for j in 0..fd.ncols() {
                assert!((fd[(i, j)] - analytic[(i, j)]).abs() < 1e-6, "entry ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn test_derivative_product_has_empty_coupling_rows() {
        let mut system = mixer();
        let y = mixed_state(&system);
        let mut res = vec![0.0; system.num_dofs()];
        system.residual_with_jacobian(SimulationTime::new(0.0, 0), &y, None, &mut res);

        let s_dot = vec![1.0; system.num_dofs()];
        let mut ret = vec![f64::NAN; system.num_dofs()];
        system.multiply_with_derivative_jacobian(SimulationTime::new(0.0, 0), &s_dot, &mut ret);
        assert!(ret[system.layout().coupling_range()].iter().all(|&r| r == 0.0));
        assert!(ret.iter().all(|r| r.is_finite()));
    }
}
