//! Stirred tank with linear binding and first order decay.
//!
//! # State Variables
//! - Inlet concentration `c_in`: Algebraic, set by the network
//! - Liquid concentration `c`: Differential variable
//! - Bound concentration `q`: Algebraic (linear equilibrium)
//!
//! The DOF block is laid out as `[c_in (n), c (n), q (n)]`.
//!
//! # Parameters
//! - `VOLUME`: liquid volume `V`
//! - `REACTION_RATE`: first order decay constant `k`
//! - `PHASE_RATIO`: bound to liquid volume ratio `beta`
//! - `EQUILIBRIUM[comp]`: binding constant `K`
//!
//! # Balance Equations
//! - Inlet: `c_in = c_coupling` (coupling term added by the network)
//! - Component balance: `tf V (dc/dt + beta dq/dt) = F_in c_in - F_out c - V k c`
//! - Binding: `q = K c`
//!
//! The volume is constant; tanks marked with [`StirredTank::with_accumulation`]
//! are only exempt from the network flow balance.
//!
//! # Example
//!
//! ```
//! use nomata_network::models::StirredTank;
//! use nomata_network::unit::{UnitId, UnitOperation};
//!
//! let tank = StirredTank::new(UnitId(1), 2, 1.5)
//!     .with_reaction_rate(0.1)
//!     .with_equilibrium(vec![2.0, 0.5])
//!     .with_phase_ratio(0.25);
//!
//! assert_eq!(tank.num_dofs(), 6);
//! assert_eq!(tank.local_outlet_component_index(), 2);
//! ```

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::autodiff::{Active, CouplingScalar, active, ad_value, strip_ad, with_ad_value};
use crate::parallel::StatusCode;
use crate::recorder::{SolutionRecorder, UnitExport};
use crate::unit::{Fidelity, SimulationTime, UnitId, UnitOperation, UnitParameter};

const VOLUME: &str = "VOLUME";
const REACTION_RATE: &str = "REACTION_RATE";
const PHASE_RATIO: &str = "PHASE_RATIO";
const EQUILIBRIUM: &str = "EQUILIBRIUM";

/// Continuously stirred tank with a bound phase.
#[derive(Debug, Clone)]
pub struct StirredTank {
    id: UnitId,
    components: usize,
    can_accumulate: bool,

    // Parameters
    volume: Active,
    reaction_rate: Active,
    phase_ratio: Active,
    equilibrium: Vec<Active>,
    initial_concentration: Vec<f64>,

    // Set by the network
    flow_in: Active,
    flow_out: Active,

    /// dF/dy at the last Jacobian evaluation
    jacobian: DMatrix<f64>,
    /// dF/dẏ without time factor
    mass: DMatrix<f64>,
}

impl StirredTank {
    /// Creates a tank without reaction or binding.
    pub fn new(id: UnitId, components: usize, volume: f64) -> Self {
        let dofs = 3 * components;
        let mut tank = StirredTank {
            id,
            components,
            can_accumulate: false,
            volume: active(volume),
            reaction_rate: active(0.0),
            phase_ratio: active(0.0),
            equilibrium: vec![active(0.0); components],
            initial_concentration: vec![0.0; components],
            flow_in: active(0.0),
            flow_out: active(0.0),
            jacobian: DMatrix::zeros(dofs, dofs),
            mass: DMatrix::zeros(dofs, dofs),
        };
        tank.assemble_jacobian();
        tank
    }

    pub fn with_reaction_rate(mut self, rate: f64) -> Self {
        self.reaction_rate = active(rate);
        self
    }

    /// Sets the binding constants, one per component.
    pub fn with_equilibrium(mut self, equilibrium: Vec<f64>) -> Self {
        self.equilibrium = equilibrium.into_iter().map(active).collect();
        self.equilibrium.resize(self.components, active(0.0));
        self
    }

    pub fn with_phase_ratio(mut self, phase_ratio: f64) -> Self {
        self.phase_ratio = active(phase_ratio);
        self
    }

    /// Liquid concentration written by [`UnitOperation::apply_initial_condition`].
    pub fn with_initial_concentration(mut self, concentration: Vec<f64>) -> Self {
        self.initial_concentration = concentration;
        self.initial_concentration.resize(self.components, 0.0);
        self
    }

    pub fn with_accumulation(mut self, can_accumulate: bool) -> Self {
        self.can_accumulate = can_accumulate;
        self
    }

    pub fn volume(&self) -> f64 {
        self.volume.re
    }

    fn parameter_mut(&mut self, param: &UnitParameter) -> Option<&mut Active> {
        match (param.name.as_str(), param.component) {
            (VOLUME, None) => Some(&mut self.volume),
            (REACTION_RATE, None) => Some(&mut self.reaction_rate),
            (PHASE_RATIO, None) => Some(&mut self.phase_ratio),
            (EQUILIBRIUM, Some(comp)) => self.equilibrium.get_mut(comp),
            _ => None,
        }
    }

    fn tank_residual<T: CouplingScalar>(&self, time: SimulationTime, y: &[f64], y_dot: Option<&[f64]>, res: &mut [T]) {
        let n = self.components;
        let volume = T::from_active(&self.volume);
        let holdup = volume.scale(time.time_factor);
        let decay = volume * T::from_active(&self.reaction_rate);
        let phase_ratio = T::from_active(&self.phase_ratio);
        let flow_in = T::from_active(&self.flow_in);
        let flow_out = T::from_active(&self.flow_out);

        for i in 0..n {
            let (c_in, c, q) = (y[i], y[n + i], y[2 * n + i]);
            let (c_dot, q_dot) = y_dot.map_or((0.0, 0.0), |y_dot| (y_dot[n + i], y_dot[2 * n + i]));

            res[i] = T::from_f64(c_in);
            res[n + i] = holdup.clone() * (T::from_f64(c_dot) + phase_ratio.scale(q_dot)) - flow_in.scale(c_in)
                + flow_out.scale(c)
                + decay.scale(c);
            res[2 * n + i] = T::from_f64(q) - T::from_active(&self.equilibrium[i]).scale(c);
        }
    }

    fn assemble_jacobian(&mut self) {
        let n = self.components;
        let volume = self.volume.re;
        self.jacobian.fill(0.0);
        self.mass.fill(0.0);

        for i in 0..n {
            self.jacobian[(i, i)] = 1.0;

            self.jacobian[(n + i, i)] = -self.flow_in.re;
            self.jacobian[(n + i, n + i)] = self.flow_out.re + volume * self.reaction_rate.re;
            self.mass[(n + i, n + i)] = volume;
            self.mass[(n + i, 2 * n + i)] = volume * self.phase_ratio.re;

            self.jacobian[(2 * n + i, n + i)] = -self.equilibrium[i].re;
            self.jacobian[(2 * n + i, 2 * n + i)] = 1.0;
        }
    }

    /// Liquid holdup `tf V`, `None` if the component balance degenerates.
    fn holdup(&self, time: SimulationTime) -> Option<f64> {
        let holdup = time.time_factor * self.volume.re;
        (holdup != 0.0).then_some(holdup)
    }
}

impl UnitOperation for StirredTank {
    fn id(&self) -> UnitId {
        self.id
    }

    fn name(&self) -> &str {
        "STIRRED_TANK"
    }

    fn num_components(&self) -> usize {
        self.components
    }

    fn num_dofs(&self) -> usize {
        3 * self.components
    }

    fn has_inlet(&self) -> bool {
        true
    }

    fn has_outlet(&self) -> bool {
        true
    }

    fn can_accumulate(&self) -> bool {
        self.can_accumulate
    }

    fn local_inlet_component_index(&self) -> usize {
        0
    }

    fn local_inlet_component_stride(&self) -> usize {
        1
    }

    fn local_outlet_component_index(&self) -> usize {
        self.components
    }

    fn local_outlet_component_stride(&self) -> usize {
        1
    }

    fn residual(&mut self, time: SimulationTime, y: &[f64], y_dot: Option<&[f64]>, res: &mut [f64]) -> StatusCode {
        self.tank_residual(time, y, y_dot, res);
        0
    }

    fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode {
        self.assemble_jacobian();
        self.residual(time, y, y_dot, res)
    }

    fn residual_sens_fwd_ad_only(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode {
        self.tank_residual(time, y, y_dot, ad_res);
        0
    }

    fn residual_sens_fwd_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode {
        self.assemble_jacobian();
        self.residual_sens_fwd_ad_only(time, y, y_dot, ad_res)
    }

    fn multiply_with_jacobian(&self, _time: SimulationTime, s: &[f64], alpha: f64, beta: f64, ret: &mut [f64]) {
        let product = &self.jacobian * DVector::from_column_slice(s);
        for (r, p) in ret.iter_mut().zip(product.iter()) {
            *r = alpha * p + beta * *r;
        }
    }

    fn multiply_with_derivative_jacobian(&self, time: SimulationTime, s_dot: &[f64], ret: &mut [f64]) {
        let product = &self.mass * DVector::from_column_slice(s_dot);
        for (r, p) in ret.iter_mut().zip(product.iter()) {
            *r = time.time_factor * p;
        }
    }

    fn linear_solve(
        &mut self,
        time: SimulationTime,
        alpha: f64,
        _outer_tol: f64,
        rhs: &mut [f64],
        _weight: &[f64],
    ) -> StatusCode {
        let matrix = &self.jacobian + &self.mass * (alpha * time.time_factor);
        match matrix.lu().solve(&DVector::from_column_slice(rhs)) {
            Some(x) => {
                rhs.copy_from_slice(x.as_slice());
                0
            }
            None => {
                warn!("Singular iteration matrix in stirred tank {}", self.id);
                1
            }
        }
    }

    fn consistent_initial_state(
        &mut self,
        _time: SimulationTime,
        y: &mut [f64],
        _error_tol: f64,
        fidelity: Fidelity,
    ) -> StatusCode {
        if fidelity == Fidelity::Lean {
            return 0;
        }
        let n = self.components;
        for i in 0..n {
            y[2 * n + i] = self.equilibrium[i].re * y[n + i];
        }
        0
    }

    fn consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        _y: &[f64],
        y_dot: &mut [f64],
        res: &[f64],
        fidelity: Fidelity,
    ) -> StatusCode {
        let Some(holdup) = self.holdup(time) else {
            warn!("Stirred tank {} has no liquid holdup", self.id);
            return 1;
        };
        let n = self.components;
        let phase_ratio = self.phase_ratio.re;

        for i in 0..n {
            match fidelity {
                Fidelity::Full => {
                    let k = self.equilibrium[i].re;
                    y_dot[n + i] = -res[n + i] / (holdup * (1.0 + phase_ratio * k));
                    y_dot[2 * n + i] = k * y_dot[n + i];
                }
                Fidelity::Lean => {
                    y_dot[n + i] = -(res[n + i] + holdup * phase_ratio * y_dot[2 * n + i]) / holdup;
                }
            }
        }
        0
    }

    fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        _y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        fidelity: Fidelity,
    ) -> StatusCode {
        let Some(holdup) = self.holdup(time) else {
            warn!("Stirred tank {} has no liquid holdup", self.id);
            return 1;
        };
        let n = self.components;
        let phase_ratio = self.phase_ratio.re;
        let mut js = vec![0.0; self.num_dofs()];

        for (param, (sy, syd)) in sens_y.iter_mut().zip(sens_y_dot.iter_mut()).enumerate() {
            if fidelity == Fidelity::Full {
                for i in 0..n {
                    sy[2 * n + i] = self.equilibrium[i].re * sy[n + i] - ad_value(&ad_res[2 * n + i], param);
                }
            }

            self.multiply_with_jacobian(time, &**sy, 1.0, 0.0, &mut js);
            for i in 0..n {
                let rhs = js[n + i] + ad_value(&ad_res[n + i], param);
                match fidelity {
                    Fidelity::Full => {
                        let k = self.equilibrium[i].re;
                        let dk = ad_value(&self.equilibrium[i], param);
                        let c_dot = y_dot[n + i];
                        syd[n + i] = -(rhs + holdup * phase_ratio * dk * c_dot) / (holdup * (1.0 + phase_ratio * k));
                        syd[2 * n + i] = k * syd[n + i] + dk * c_dot;
                    }
                    Fidelity::Lean => {
                        syd[n + i] = -(rhs + holdup * phase_ratio * syd[2 * n + i]) / holdup;
                    }
                }
            }
        }
        0
    }

    fn set_flow_rates(&mut self, inflow: &Active, outflow: &Active) {
        self.flow_in = inflow.clone();
        self.flow_out = outflow.clone();
    }

    fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]) {
        let n = self.components;
        y.fill(0.0);
        y_dot.fill(0.0);
        for i in 0..n {
            y[n + i] = self.initial_concentration[i];
            y[2 * n + i] = self.equilibrium[i].re * self.initial_concentration[i];
        }
    }

    fn has_parameter(&self, param: &UnitParameter) -> bool {
        match (param.name.as_str(), param.component) {
            (VOLUME | REACTION_RATE | PHASE_RATIO, None) => true,
            (EQUILIBRIUM, Some(comp)) => comp < self.components,
            _ => false,
        }
    }

    fn set_parameter(&mut self, param: &UnitParameter, value: f64) -> bool {
        match self.parameter_mut(param) {
            Some(p) => {
                p.re = value;
                true
            }
            None => false,
        }
    }

    fn set_sensitive_parameter(&mut self, param: &UnitParameter, ad_direction: usize, ad_value: f64, width: usize) -> bool {
        match self.parameter_mut(param) {
            Some(p) => {
                *p = with_ad_value(p, ad_direction, ad_value, width);
                true
            }
            None => false,
        }
    }

    fn set_sensitive_parameter_value(&mut self, param: &UnitParameter, value: f64) {
        self.set_parameter(param, value);
    }

    fn clear_sens_params(&mut self) {
        self.volume = strip_ad(&self.volume);
        self.reaction_rate = strip_ad(&self.reaction_rate);
        self.phase_ratio = strip_ad(&self.phase_ratio);
        for k in &mut self.equilibrium {
            *k = strip_ad(k);
        }
    }

    fn all_parameter_values(&self) -> Vec<(UnitParameter, f64)> {
        let mut values = vec![
            (UnitParameter::new(VOLUME), self.volume.re),
            (UnitParameter::new(REACTION_RATE), self.reaction_rate.re),
            (UnitParameter::new(PHASE_RATIO), self.phase_ratio.re),
        ];
        values.extend(
            self.equilibrium.iter().enumerate().map(|(comp, k)| (UnitParameter::for_component(EQUILIBRIUM, comp), k.re)),
        );
        values
    }

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]) {
        let n = self.components;
        let export = UnitExport::new(self.id)
            .with_field("INLET", solution[..n].to_vec())
            .with_field("OUTLET", solution[n..2 * n].to_vec())
            .with_field("SOLID", solution[2 * n..].to_vec());
        recorder.begin_unit_operation(self.id, &export);
        recorder.end_unit_operation();
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        let n = self.components;
        recorder.unit_operation_structure(self.id, self.name(), &[("INLET", n), ("OUTLET", n), ("SOLID", n)]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::finite_difference_jacobian;
    use approx::assert_relative_eq;

    fn tank() -> StirredTank {
        let mut tank = StirredTank::new(UnitId(1), 2, 2.0)
            .with_reaction_rate(0.3)
            .with_equilibrium(vec![1.5, 0.5])
            .with_phase_ratio(0.4);
        tank.set_flow_rates(&active(1.0), &active(1.0));
        tank
    }

    #[test]
    fn test_jacobian_matches_finite_differences() {
        let mut tank = tank();
        let time = SimulationTime::new(0.0, 0);
        let y = vec![1.0, 0.5, 0.8, 0.2, 1.2, 0.1];
        let y_dot = vec![0.0, 0.0, 0.1, -0.2, 0.15, -0.1];
        let mut res = vec![0.0; 6];
        tank.residual_with_jacobian(time, &y, Some(&y_dot), &mut res);

        let mut probe = tank.clone();
        let fd = finite_difference_jacobian(
            |x, out| {
                probe.residual(time, x, Some(&y_dot), out);
            },
            &y,
            6,
            1e-7,
        );
        for i in 0..6 {
            for j in 0..6 {
                assert!((fd[(i, j)] - tank.jacobian[(i, j)]).abs() < 1e-5, "entry ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn test_linear_solve_inverts_iteration_matrix() {
        let mut tank = tank();
        let time = SimulationTime::new(0.0, 0).with_time_factor(2.0);
        let y = vec![0.0; 6];
        let mut res = vec![0.0; 6];
        tank.residual_with_jacobian(time, &y, None, &mut res);

        let x = vec![0.5, -1.0, 2.0, 0.25, 1.0, -0.5];
        let alpha = 3.0;
        let mut rhs = vec![0.0; 6];
        let mut mass = vec![0.0; 6];
        tank.multiply_with_jacobian(time, &x, 1.0, 0.0, &mut rhs);
        tank.multiply_with_derivative_jacobian(time, &x, &mut mass);
        for (r, m) in rhs.iter_mut().zip(&mass) {
            *r += alpha * m;
        }

        assert_eq!(tank.linear_solve(time, alpha, 1e-6, &mut rhs, &[1.0; 6]), 0);
        for (a, b) in rhs.iter().zip(&x) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_full_state_equilibrates_bound_phase() {
        let mut tank = tank();
        let mut y = vec![1.0, 1.0, 0.4, 0.8, 0.0, 0.0];
        tank.consistent_initial_state(SimulationTime::new(0.0, 0), &mut y, 1e-10, Fidelity::Full);
        assert_relative_eq!(y[4], 0.6);
        assert_relative_eq!(y[5], 0.4);

        let mut lean = vec![1.0, 1.0, 0.4, 0.8, 0.0, 0.0];
        tank.consistent_initial_state(SimulationTime::new(0.0, 0), &mut lean, 1e-10, Fidelity::Lean);
        assert_eq!(lean[4], 0.0);
    }

    #[test]
    fn test_no_holdup_is_recoverable_error() {
        let mut tank = StirredTank::new(UnitId(0), 1, 0.0);
        let mut y_dot = vec![0.0; 3];
        let status = tank.consistent_initial_time_derivative(
            SimulationTime::new(0.0, 0),
            &[0.0; 3],
            &mut y_dot,
            &[0.0; 3],
            Fidelity::Full,
        );
        assert_eq!(status, 1);
    }

    #[test]
    fn test_volume_sensitivity_in_residual() {
        let mut tank = tank();
        assert!(tank.set_sensitive_parameter(&UnitParameter::new(VOLUME), 0, 1.0, 1));
        let y = vec![1.0, 0.5, 0.8, 0.2, 1.2, 0.1];
        let y_dot = vec![0.0, 0.0, 0.1, -0.2, 0.15, -0.1];
        let mut ad_res = vec![active(0.0); 6];
        tank.residual_sens_fwd_ad_only(SimulationTime::new(0.0, 0), &y, Some(&y_dot), &mut ad_res);

        // d/dV [V (c_dot + beta q_dot) + V k c] for component 0
        let expected = (0.1 + 0.4 * 0.15) + 0.3 * 0.8;
        assert_relative_eq!(ad_value(&ad_res[2], 0), expected, epsilon = 1e-14);
        assert_eq!(ad_value(&ad_res[4], 0), 0.0);

        tank.clear_sens_params();
        tank.residual_sens_fwd_ad_only(SimulationTime::new(0.0, 0), &y, Some(&y_dot), &mut ad_res);
        assert_eq!(ad_value(&ad_res[2], 0), 0.0);
    }

    #[test]
    fn test_parameters() {
        let mut tank = tank();
        assert!(tank.has_parameter(&UnitParameter::for_component(EQUILIBRIUM, 1)));
        assert!(!tank.has_parameter(&UnitParameter::for_component(EQUILIBRIUM, 2)));
        assert!(!tank.has_parameter(&UnitParameter::for_component(VOLUME, 0)));
        assert!(tank.set_parameter(&UnitParameter::new(VOLUME), 4.0));
        assert_eq!(tank.volume(), 4.0);
        assert_eq!(tank.all_parameter_values().len(), 5);
    }
}
