//! Forward parameter sensitivities.
//!
//! Parameter derivatives `dF/dp` come from one AD residual evaluation in
//! which every sensitive parameter seeds its own direction. The sensitivity
//! residual of parameter `p` is
//!
//! ```text
//! res_s[p] = dF/dy * ys[p] + dF/dẏ * ys_dot[p] + dF/dp
//! ```
//!
//! Units combine their own blocks. The coupling rows are explicit in the
//! sensitivities and are formed here from `ys_c + sum F_i ys_i` and the
//! flow-rate derivatives carried by the active residual.

use log::{debug, warn};

use crate::autodiff::{Active, active, ad_value};
use crate::layout::DofLayout;
use crate::parallel::{StatusCode, fuse_status, run_per_unit};
use crate::system::{ModelSystem, NOT_CONFIGURED};
use crate::unit::{Fidelity, SimulationTime};

/// Regroups per-parameter vectors into per-unit lists of blocks.
fn unit_blocks<'a>(layout: &DofLayout, vectors: &'a [Vec<f64>]) -> Vec<Vec<&'a [f64]>> {
    let mut per_unit: Vec<Vec<&[f64]>> = (0..layout.num_units()).map(|_| Vec::new()).collect();
    for v in vectors {
        let (blocks, _) = layout.split(v);
        for (unit, block) in per_unit.iter_mut().zip(blocks) {
            unit.push(block);
        }
    }
    per_unit
}

fn unit_blocks_mut<'a>(layout: &DofLayout, vectors: &'a mut [Vec<f64>]) -> Vec<Vec<&'a mut [f64]>> {
    let mut per_unit: Vec<Vec<&mut [f64]>> = (0..layout.num_units()).map(|_| Vec::new()).collect();
    for v in vectors {
        let (blocks, _) = layout.split_mut(v);
        for (unit, block) in per_unit.iter_mut().zip(blocks) {
            unit.push(block);
        }
    }
    per_unit
}

impl ModelSystem {
    /// Allocates an AD residual vector of global size.
    pub fn new_ad_residual(&self) -> Vec<Active> {
        vec![active(0.0); self.num_dofs()]
    }

    /// AD residual of all units plus coupling; refreshes unit Jacobians.
    ///
    /// Direction `p` of `ad_res` receives `dF/dp` of the parameter seeded in
    /// direction `p`.
    pub fn d_res_dp_fwd_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode {
        self.ad_residual(time, y, y_dot, ad_res, true)
    }

    fn ad_residual(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
        with_jacobian: bool,
    ) -> StatusCode {
        if !self.check_configured("AD residual") {
            return NOT_CONFIGURED;
        }
        self.reset_error_indicator();

        let (y_blocks, _) = self.layout.split(y);
        let y_dot_blocks: Vec<Option<&[f64]>> = match y_dot {
            Some(y_dot) => self.layout.split(y_dot).0.into_iter().map(Some).collect(),
            None => vec![None; self.units.len()],
        };
        let (res_blocks, _) = self.layout.split_mut(ad_res);
        let work: Vec<_> = y_blocks.into_iter().zip(y_dot_blocks).zip(res_blocks).collect();

        run_per_unit(&mut self.units, work, &mut self.error_indicator, |_, unit, ((y, y_dot), res)| {
            if with_jacobian {
                unit.residual_sens_fwd_with_jacobian(time, y, y_dot, res)
            } else {
                unit.residual_sens_fwd_ad_only(time, y, y_dot, res)
            }
        });

        self.residual_connect(y, ad_res);
        self.total_error()
    }

    /// Evaluates the forward sensitivity residuals with the stored unit
    /// Jacobians.
    ///
    /// `ad_res` is overwritten with the AD residual at `(y, ẏ)`.
    #[allow(clippy::too_many_arguments)]
    pub fn residual_sens_fwd(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ys: &[Vec<f64>],
        ys_dot: &[Vec<f64>],
        res_s: &mut [Vec<f64>],
        ad_res: &mut [Active],
    ) -> StatusCode {
        let status = self.ad_residual(time, y, y_dot, ad_res, false);
        if status == NOT_CONFIGURED {
            return status;
        }
        self.combine_sensitivities(time, ys, ys_dot, res_s, ad_res)
    }

    /// Like [`residual_sens_fwd`](Self::residual_sens_fwd), refreshing the
    /// unit Jacobians at `(y, ẏ)` first.
    #[allow(clippy::too_many_arguments)]
    pub fn residual_sens_fwd_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ys: &[Vec<f64>],
        ys_dot: &[Vec<f64>],
        res_s: &mut [Vec<f64>],
        ad_res: &mut [Active],
    ) -> StatusCode {
        let status = self.ad_residual(time, y, y_dot, ad_res, true);
        if status == NOT_CONFIGURED {
            return status;
        }
        self.combine_sensitivities(time, ys, ys_dot, res_s, ad_res)
    }

    /// Infinity norm of every sensitivity residual, infinite if the system is
    /// not configured.
    pub fn residual_sens_fwd_norm(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ys: &[Vec<f64>],
        ys_dot: &[Vec<f64>],
        ad_res: &mut [Active],
    ) -> Vec<f64> {
        if !self.is_configured() {
            return vec![f64::INFINITY; ys.len()];
        }
        let mut res_s = vec![vec![0.0; self.num_dofs()]; ys.len()];
        self.residual_sens_fwd(time, y, y_dot, ys, ys_dot, &mut res_s, ad_res);
        res_s.iter().map(|r| r.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))).collect()
    }

    /// Forms all sensitivity residuals from an evaluated `ad_res`. Error
    /// indicators keep the status of the preceding AD residual.
    fn combine_sensitivities(
        &mut self,
        time: SimulationTime,
        ys: &[Vec<f64>],
        ys_dot: &[Vec<f64>],
        res_s: &mut [Vec<f64>],
        ad_res: &[Active],
    ) -> StatusCode {
        let layout = &self.layout;
        let coupling_range = layout.coupling_range();
        let coupling = &self.coupling;

        {
            let ys_c: Vec<&[f64]> = ys.iter().map(|v| &v[coupling_range.clone()]).collect();
            let ys_blocks = unit_blocks(layout, ys);
            let ys_dot_blocks = unit_blocks(layout, ys_dot);
            let res_blocks = unit_blocks_mut(layout, res_s);
            let (ad_blocks, _) = layout.split(ad_res);
            let work: Vec<_> = ys_blocks.into_iter().zip(ys_dot_blocks).zip(res_blocks).zip(ad_blocks).collect();

            run_per_unit(
                &mut self.units,
                work,
                &mut self.error_indicator,
                |i, unit, (((ys, ys_dot), mut res), ad)| {
                    let status = unit.residual_sens_fwd_combine(time, &ys, &ys_dot, &mut res, ad);
                    // Inlet rows see the coupling sensitivities
                    for (ys_c, res) in ys_c.iter().zip(res.iter_mut()) {
                        coupling.inbound[i].multiply_add(ys_c, res, 1.0);
                    }
                    status
                },
            );
        }

        let ad_c = &ad_res[coupling_range.clone()];
        for (param, (res, ys)) in res_s.iter_mut().zip(ys).enumerate() {
            let res_c = &mut res[coupling_range.clone()];
            for ((r, &s), ad) in res_c.iter_mut().zip(&ys[coupling_range.clone()]).zip(ad_c) {
                *r = s + ad_value(ad, param);
            }
            for (i, outbound) in coupling.outbound_plain.iter().enumerate() {
                outbound.multiply_add(&ys[layout.unit_range(i)], res_c, 1.0);
            }
        }

        self.total_error()
    }

    /// Computes consistent initial sensitivities `(ys, ys_dot)` at a
    /// consistent state `(y, ẏ)`.
    ///
    /// Mirrors [`consistent_initial_conditions`](Self::consistent_initial_conditions)
    /// with parameter instead of time derivatives. `ad_res` receives the AD
    /// residual at `(y, ẏ)`.
    #[allow(clippy::too_many_arguments)]
    pub fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_y_dot: &mut [Vec<f64>],
        ad_res: &mut [Active],
        fidelity: Fidelity,
    ) -> StatusCode {
        let res_status = self.d_res_dp_fwd_with_jacobian(time, y, Some(y_dot), ad_res);
        if res_status < 0 {
            warn!("AD residual during sensitivity initialization failed with status {}", res_status);
            return res_status;
        }

        self.reset_error_indicator();
        self.consistent_unit_sensitivities(time, y, y_dot, sens_y, sens_y_dot, ad_res, fidelity, false);

        // Coupling rows: ys_c + sum F_i ys_i + dF/dp = 0
        let coupling = self.layout.coupling_range();
        for (param, sy) in sens_y.iter_mut().enumerate() {
            for (s, ad) in sy[coupling.clone()].iter_mut().zip(&ad_res[coupling.clone()]) {
                *s = -ad_value(ad, param);
            }
            self.solve_coupling_dof(sy);
        }

        self.consistent_unit_sensitivities(time, y, y_dot, sens_y, sens_y_dot, ad_res, fidelity, true);

        // Time derivative of the coupling rows: -(dF/dp) ẏ on the right
        for (param, syd) in sens_y_dot.iter_mut().enumerate() {
            let (_, rhs) = self.layout.split_mut(syd);
            rhs.fill(0.0);
            for (i, outbound) in self.coupling.outbound.iter().enumerate() {
                outbound.derivative_multiply_add(param, &y_dot[self.layout.unit_range(i)], rhs, -1.0);
            }
            self.solve_coupling_dof(syd);
        }

        let status = fuse_status(res_status, self.total_error());
        debug!("Consistent sensitivity initialization of {} parameters: status {}", sens_y.len(), status);
        status
    }

    #[allow(clippy::too_many_arguments)]
    fn consistent_unit_sensitivities(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_y_dot: &mut [Vec<f64>],
        ad_res: &[Active],
        fidelity: Fidelity,
        with_inlet: bool,
    ) {
        let layout = &self.layout;
        let (y_blocks, _) = layout.split(y);
        let (y_dot_blocks, _) = layout.split(y_dot);
        let sens_blocks = unit_blocks_mut(layout, sens_y);
        let sens_dot_blocks = unit_blocks_mut(layout, sens_y_dot);
        let (ad_blocks, _) = layout.split(ad_res);
        let work: Vec<_> = y_blocks
            .into_iter()
            .zip(y_dot_blocks)
            .zip(sens_blocks)
            .zip(sens_dot_blocks)
            .zip(ad_blocks)
            .collect();

        run_per_unit(
            &mut self.units,
            work,
            &mut self.error_indicator,
            |_, unit, ((((y, y_dot), mut sens), mut sens_dot), ad)| {
                if unit.has_inlet() != with_inlet {
                    return 0;
                }
                unit.consistent_initial_sensitivity(time, y, y_dot, &mut sens, &mut sens_dot, ad, fidelity)
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Inlet, Outlet, StirredTank};
    use crate::network::{ConnectionRow, SwitchSpec};
    use crate::parameters::ParameterId;
    use crate::solvers::SchurSolverConfig;
    use crate::unit::UnitId;

    fn mixer() -> ModelSystem {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0, 2.0]))).unwrap();
        system.add_unit(Box::new(Inlet::new(UnitId(1), vec![3.0, 0.5]))).unwrap();
        system
            .add_unit(Box::new(StirredTank::new(UnitId(2), 2, 1.5).with_reaction_rate(0.1).with_phase_ratio(0.3)))
            .unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(3), 2))).unwrap();
        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(2), 1.0),
            ConnectionRow::new(UnitId(1), UnitId(2), 3.0),
            ConnectionRow::new(UnitId(2), UnitId(3), 4.0),
        ]);
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
        system
    }

    fn pattern(n: usize, scale: f64) -> Vec<f64> {
        (0..n).map(|i| scale * (((i * 13) % 7) as f64 - 3.0)).collect()
    }

    #[test]
    fn test_flow_rate_sensitivity_matches_central_differences() {
        let mut system = mixer();
        let time = SimulationTime::new(0.0, 0);
        let n = system.num_dofs();
        let id = ParameterId::flow_rate(UnitId(0), UnitId(2), 0);
        assert!(system.set_sensitive_parameter(&id, 0, 1.0));

        let y = pattern(n, 0.1);
        let y_dot = pattern(n, -0.05);
        let ys = vec![pattern(n, 0.02)];
        let ys_dot = vec![pattern(n, 0.01)];
        let mut res_s = vec![vec![0.0; n]];
        let mut ad_res = system.new_ad_residual();
        let status =
            system.residual_sens_fwd_with_jacobian(time, &y, Some(&y_dot), &ys, &ys_dot, &mut res_s, &mut ad_res);
        assert_eq!(status, 0);

        let h = 1e-4;
        let mut evaluate = |sign: f64| {
            system.set_parameter(&id, 1.0 + sign * h / 2.0);
            system.refresh_coupling();
            let y: Vec<f64> = y.iter().zip(&ys[0]).map(|(v, s)| v + sign * h / 2.0 * s).collect();
            let y_dot: Vec<f64> = y_dot.iter().zip(&ys_dot[0]).map(|(v, s)| v + sign * h / 2.0 * s).collect();
            let mut res = vec![0.0; n];
            system.residual(time, &y, Some(&y_dot), &mut res);
            res
        };
        let plus = evaluate(1.0);
        let minus = evaluate(-1.0);

        for i in 0..n {
            let fd = (plus[i] - minus[i]) / h;
            assert!((fd - res_s[0][i]).abs() < 1e-6, "row {}: {} vs {}", i, fd, res_s[0][i]);
        }
    }

    #[test]
    fn test_flow_rate_derivative_reaches_coupling_rows() {
        let mut system = mixer();
        let time = SimulationTime::new(0.0, 0);
        let n = system.num_dofs();
        system.set_sensitive_parameter(&ParameterId::flow_rate(UnitId(1), UnitId(2), 0), 0, 1.0);

        let y = pattern(n, 0.1);
        let zeros = vec![vec![0.0; n]];
        let mut ad_res = system.new_ad_residual();
        let norms = system.residual_sens_fwd_norm(time, &y, None, &zeros, &zeros, &mut ad_res);
        assert_eq!(norms.len(), 1);
        assert!(norms[0] > 0.0);

        // Mixing weights -r0 / (r0 + r1) and -r1 / (r0 + r1) differentiated by r1
        let c = system.layout().coupling_range();
        let expected = (y[0] - y[2]) / 16.0;
        assert!((ad_value(&ad_res[c.start], 0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_consistent_sensitivities_zero_sensitivity_residual() {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0, 2.0]).with_slope(vec![0.5, 0.1]).unwrap())).unwrap();
        system
            .add_unit(Box::new(
                StirredTank::new(UnitId(1), 2, 2.0)
                    .with_equilibrium(vec![1.2, 0.4])
                    .with_phase_ratio(0.25)
                    .with_reaction_rate(0.05),
            ))
            .unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(2), 2))).unwrap();
        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(1), 1.0),
            ConnectionRow::new(UnitId(1), UnitId(2), 1.0),
        ]);
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();

        assert!(system.set_sensitive_parameter(&ParameterId::unit_component(UnitId(1), "EQUILIBRIUM", 0), 0, 1.0));
        assert!(system.set_sensitive_parameter(&ParameterId::unit_component(UnitId(0), "CONST_COEFF", 1), 1, 1.0));

        let time = SimulationTime::new(0.0, 0);
        let n = system.num_dofs();
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        let tank = system.layout().unit_range(1);
        y[tank.start + 2] = 0.4;
        y[tank.start + 3] = 0.8;
        assert_eq!(system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, Fidelity::Full), 0);

        let mut sens_y = vec![vec![0.0; n]; 2];
        let mut sens_y_dot = vec![vec![0.0; n]; 2];
        let mut ad_res = system.new_ad_residual();
        let status = system.consistent_initial_sensitivity(
            time,
            &y,
            &y_dot,
            &mut sens_y,
            &mut sens_y_dot,
            &mut ad_res,
            Fidelity::Full,
        );
        assert_eq!(status, 0);

        // Bound phase sensitivity of component 0: q = K c
        assert!((sens_y[0][tank.start + 4] - 0.4).abs() < 1e-12);

        let mut res_s = vec![vec![0.0; n]; 2];
        system.residual_sens_fwd_with_jacobian(time, &y, Some(&y_dot), &sens_y, &sens_y_dot, &mut res_s, &mut ad_res);
        for res in &res_s {
            assert!(res.iter().all(|r| r.abs() < 1e-12), "{:?}", res);
        }
    }
}
