//! Consistent initialization of the coupled system.
//!
//! Algebraic unit states are only consistent once their inlets are known,
//! and inlets are only known once the upstream outlets are. Initialization
//! therefore runs source units first, propagates their outlets through the
//! coupling equations and then initializes every unit with an inlet. Time
//! derivatives follow from a residual evaluated at `ẏ = 0`.

use log::{debug, warn};

use crate::parallel::{StatusCode, fuse_status, run_per_unit};
use crate::system::{ModelSystem, NOT_CONFIGURED};
use crate::unit::{Fidelity, SimulationTime};

impl ModelSystem {
    /// Solves the coupling equations for the coupling block of `vec` and
    /// copies the result into the unit inlets.
    ///
    /// The coupling block must hold the right hand side `f` of
    /// `y_c + sum F_i y_i = f` on entry.
    pub fn solve_coupling_dof(&self, vec: &mut [f64]) {
        let (blocks, coupling) = self.layout.split_mut(vec);
        for (outbound, block) in self.coupling.outbound_plain.iter().zip(&blocks) {
            outbound.multiply_subtract(block, coupling);
        }

        for (i, (shape, block)) in self.shapes.iter().zip(blocks).enumerate() {
            let (Some(inlet), Some(range)) = (shape.inlet, self.coupling_map.range(i)) else {
                continue;
            };
            for (comp, idx) in range.enumerate() {
                block[inlet.position(comp)] = coupling[idx];
            }
        }
    }

    /// Computes consistent `y` and `ẏ` at `time`.
    ///
    /// Unit states are corrected in place, starting from the values in `y`.
    /// With [`Fidelity::Lean`] units only apply cheap corrections and use the
    /// values in `y_dot` as starting point. Unit Jacobians are refreshed at
    /// the consistent state. A non-recoverable status aborts before the time
    /// derivatives are computed.
    pub fn consistent_initial_conditions(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        y_dot: &mut [f64],
        error_tol: f64,
        fidelity: Fidelity,
    ) -> StatusCode {
        if !self.check_configured("Consistent initialization") {
            return NOT_CONFIGURED;
        }
        self.reset_error_indicator();

        // Units without inlet do not depend on anything else
        self.consistent_unit_states(time, y, error_tol, fidelity, false);

        y[self.layout.coupling_range()].fill(0.0);
        self.solve_coupling_dof(y);

        self.consistent_unit_states(time, y, error_tol, fidelity, true);

        let state_status = self.total_error();
        if state_status < 0 {
            warn!("Consistent initial state failed with status {}", state_status);
            return state_status;
        }

        // Residual at ẏ = 0 gives the right hand side for ẏ
        let mut res = std::mem::take(&mut self.temp_state);
        res.resize(self.layout.num_dofs(), 0.0);
        let res_status = self.residual_with_jacobian(time, y, None, &mut res);
        if res_status < 0 {
            self.temp_state = res;
            warn!("Residual evaluation during consistent initialization failed with status {}", res_status);
            return res_status;
        }

        self.reset_error_indicator();
        {
            let (y_blocks, _) = self.layout.split(y);
            let (y_dot_blocks, _) = self.layout.split_mut(y_dot);
            let (res_blocks, _) = self.layout.split(&res);
            let work: Vec<_> = y_blocks.into_iter().zip(y_dot_blocks).zip(res_blocks).collect();
            run_per_unit(&mut self.units, work, &mut self.error_indicator, |_, unit, ((y, y_dot), res)| {
                unit.consistent_initial_time_derivative(time, y, y_dot, res, fidelity)
            });
        }
        self.temp_state = res;

        y_dot[self.layout.coupling_range()].fill(0.0);
        self.solve_coupling_dof(y_dot);

        let status = fuse_status(fuse_status(state_status, res_status), self.total_error());
        debug!("Consistent initialization ({:?}) finished with status {}", fidelity, status);
        status
    }

    /// Runs the consistent state routine of all units with (`with_inlet`)
    /// or without an inlet.
    fn consistent_unit_states(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        error_tol: f64,
        fidelity: Fidelity,
        with_inlet: bool,
    ) {
        let (blocks, _) = self.layout.split_mut(y);
        run_per_unit(&mut self.units, blocks, &mut self.error_indicator, |_, unit, y| {
            if unit.has_inlet() != with_inlet {
                return 0;
            }
            unit.consistent_initial_state(time, y, error_tol, fidelity)
        });
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

    #[test]
    fn test_two_unit_chain() {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![2.5]))).unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(1), 1))).unwrap();
        let switch = SwitchSpec::new(0).with_connection(ConnectionRow::new(UnitId(0), UnitId(1), 1.0));
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();

        let mut y = vec![0.0; 3];
        let mut y_dot = vec![0.0; 3];
        let status =
            system.consistent_initial_conditions(SimulationTime::new(0.0, 0), &mut y, &mut y_dot, 1e-10, Fidelity::Full);
        assert_eq!(status, 0);

        // [inlet outlet, outlet inlet, coupling]
        assert_relative_eq!(y[0], 2.5);
        assert_relative_eq!(y[2], y[0]);
        assert_relative_eq!(y[1], y[2]);
    }

    fn tank_chain() -> ModelSystem {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0, 2.0]).with_slope(vec![0.5, -0.25]).unwrap())).unwrap();
        system
            .add_unit(Box::new(
                StirredTank::new(UnitId(1), 2, 3.0)
                    .with_reaction_rate(0.2)
                    .with_equilibrium(vec![1.5, 0.5])
                    .with_phase_ratio(0.4),
            ))
            .unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(2), 2))).unwrap();
        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(1), 2.0),
            ConnectionRow::new(UnitId(1), UnitId(2), 2.0),
        ]);
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
        system
    }

    #[test]
    fn test_full_initialization_zeroes_residual() {
        let mut system = tank_chain();
        let time = SimulationTime::new(0.0, 0);
        let n = system.num_dofs();
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        system.apply_initial_condition(&mut y, &mut y_dot);
        // Tank liquid starts away from the feed
        let tank = system.layout().unit_range(1);
        y[tank.start + 2] = 0.3;
        y[tank.start + 3] = 0.1;

        let status = system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, Fidelity::Full);
        assert_eq!(status, 0);
        assert!(system.residual_norm(time, &y, Some(&y_dot)) < 1e-12);
    }

    #[test]
    fn test_lean_initialization_keeps_bound_state() {
        let mut system = tank_chain();
        let time = SimulationTime::new(0.0, 0);
        let n = system.num_dofs();
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        let tank = system.layout().unit_range(1);
        y[tank.start + 2] = 0.3;
        y[tank.start + 3] = 0.1;
        y[tank.start + 4] = 0.7;

        let status = system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, Fidelity::Lean);
        assert_eq!(status, 0);

        // Bound phase untouched, inlet and coupling still consistent
        assert_eq!(y[tank.start + 4], 0.7);
        let c = system.layout().coupling_range();
        assert_relative_eq!(y[tank.start], 1.0);
        assert_relative_eq!(y[c.start + 2], 0.3);

        // Liquid rows of the tank satisfied
        let mut res = vec![0.0; n];
        system.residual(time, &y, Some(&y_dot), &mut res);
        assert!(res[tank.start + 2].abs() < 1e-12);
        assert!(res[tank.start + 3].abs() < 1e-12);
    }

    #[test]
    fn test_coupling_derivative_follows_inlet_slope() {
        let mut system = tank_chain();
        let n = system.num_dofs();
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        system.consistent_initial_conditions(SimulationTime::new(0.0, 0), &mut y, &mut y_dot, 1e-10, Fidelity::Full);

        let c = system.layout().coupling_range();
        assert_relative_eq!(y_dot[c.start], 0.5);
        assert_relative_eq!(y_dot[c.start + 1], -0.25);
    }
}
