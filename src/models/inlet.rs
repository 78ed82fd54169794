//! Inlet (feed) unit operation.
//!
//! A pure source: its DOFs are the outlet concentrations, prescribed per
//! section as a linear profile `c(t) = c0 + c1 * t` in section time.
//!
//! # Parameters
//! - `CONST_COEFF[comp]`: constant coefficient `c0`
//! - `LIN_COEFF[comp]`: linear coefficient `c1`
//!
//! Parameters without a section address section 0.

use crate::autodiff::{Active, CouplingScalar, active, ad_value, strip_ad, with_ad_value};
use crate::error::{NetworkError, NetworkResult};
use crate::parallel::StatusCode;
use crate::recorder::{SolutionRecorder, UnitExport};
use crate::unit::{Fidelity, SimulationTime, UnitId, UnitOperation, UnitParameter};

const CONST_COEFF: &str = "CONST_COEFF";
const LIN_COEFF: &str = "LIN_COEFF";

/// Feed profile of one section.
#[derive(Debug, Clone)]
pub struct InletSection {
    pub constant: Vec<Active>,
    pub slope: Vec<Active>,
}

impl InletSection {
    fn new(constant: &[f64], slope: &[f64]) -> Self {
        InletSection {
            constant: constant.iter().copied().map(active).collect(),
            slope: slope.iter().copied().map(active).collect(),
        }
    }
}

/// Source unit with a piecewise linear feed profile.
#[derive(Debug, Clone)]
pub struct Inlet {
    id: UnitId,
    components: usize,
    sections: Vec<InletSection>,
}

impl Inlet {
    /// Creates an inlet with a constant feed of `concentration`.
    pub fn new(id: UnitId, concentration: Vec<f64>) -> Self {
        let slope = vec![0.0; concentration.len()];
        Inlet { id, components: concentration.len(), sections: vec![InletSection::new(&concentration, &slope)] }
    }

    /// Sets the linear coefficients of section 0.
    pub fn with_slope(mut self, slope: Vec<f64>) -> NetworkResult<Self> {
        self.check_coefficients(LIN_COEFF, &slope)?;
        self.sections[0].slope = slope.into_iter().map(active).collect();
        Ok(self)
    }

    /// Appends a section profile. Sections past the last one reuse it.
    pub fn with_section(mut self, constant: Vec<f64>, slope: Vec<f64>) -> NetworkResult<Self> {
        self.check_coefficients(CONST_COEFF, &constant)?;
        self.check_coefficients(LIN_COEFF, &slope)?;
        self.sections.push(InletSection::new(&constant, &slope));
        Ok(self)
    }

    fn check_coefficients(&self, name: &str, values: &[f64]) -> NetworkResult<()> {
        if values.len() == self.components {
            return Ok(());
        }
        Err(NetworkError::InvalidValue {
            field: format!("{} of inlet {}", name, self.id),
            reason: format!("expected {} components, got {}", self.components, values.len()),
        })
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    fn section(&self, section: usize) -> &InletSection {
        &self.sections[section.min(self.sections.len() - 1)]
    }

    fn coefficient_mut(&mut self, param: &UnitParameter) -> Option<&mut Active> {
        let comp = param.component?;
        if comp >= self.components {
            return None;
        }
        let section = self.sections.get_mut(param.section.unwrap_or(0))?;
        match param.name.as_str() {
            CONST_COEFF => section.constant.get_mut(comp),
            LIN_COEFF => section.slope.get_mut(comp),
            _ => None,
        }
    }

    /// `res = y - c(t)`
    fn profile_residual<T: CouplingScalar>(&self, time: SimulationTime, y: &[f64], res: &mut [T]) {
        let section = self.section(time.section);
        for (i, r) in res.iter_mut().enumerate() {
            let feed = T::from_active(&section.constant[i]) + T::from_active(&section.slope[i]).scale(time.t);
            *r = T::from_f64(y[i]) - feed;
        }
    }
}

impl UnitOperation for Inlet {
    fn id(&self) -> UnitId {
        self.id
    }

    fn name(&self) -> &str {
        "INLET"
    }

    fn num_components(&self) -> usize {
        self.components
    }

    fn num_dofs(&self) -> usize {
        self.components
    }

    fn has_inlet(&self) -> bool {
        false
    }

    fn has_outlet(&self) -> bool {
        true
    }

    fn local_inlet_component_index(&self) -> usize {
        0
    }

    fn local_inlet_component_stride(&self) -> usize {
        0
    }

    fn local_outlet_component_index(&self) -> usize {
        0
    }

    fn local_outlet_component_stride(&self) -> usize {
        1
    }

    fn residual(&mut self, time: SimulationTime, y: &[f64], _y_dot: Option<&[f64]>, res: &mut [f64]) -> StatusCode {
        self.profile_residual(time, y, res);
        0
    }

    fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode {
        // Jacobian is the identity
        self.residual(time, y, y_dot, res)
    }

    fn residual_sens_fwd_ad_only(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        _y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode {
        self.profile_residual(time, y, ad_res);
        0
    }

    fn residual_sens_fwd_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode {
        self.residual_sens_fwd_ad_only(time, y, y_dot, ad_res)
    }

    fn multiply_with_jacobian(&self, _time: SimulationTime, s: &[f64], alpha: f64, beta: f64, ret: &mut [f64]) {
        for (r, v) in ret.iter_mut().zip(s) {
            *r = alpha * v + beta * *r;
        }
    }

    fn multiply_with_derivative_jacobian(&self, _time: SimulationTime, _s_dot: &[f64], ret: &mut [f64]) {
        ret.fill(0.0);
    }

    fn linear_solve(
        &mut self,
        _time: SimulationTime,
        _alpha: f64,
        _outer_tol: f64,
        _rhs: &mut [f64],
        _weight: &[f64],
    ) -> StatusCode {
        0
    }

    fn consistent_initial_state(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        _error_tol: f64,
        _fidelity: Fidelity,
    ) -> StatusCode {
        let section = self.section(time.section);
        for (i, v) in y.iter_mut().enumerate() {
            *v = section.constant[i].re + section.slope[i].re * time.t;
        }
        0
    }

    fn consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        _y: &[f64],
        y_dot: &mut [f64],
        _res: &[f64],
        _fidelity: Fidelity,
    ) -> StatusCode {
        let section = self.section(time.section);
        for (v, slope) in y_dot.iter_mut().zip(&section.slope) {
            *v = slope.re;
        }
        0
    }

    fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        _y: &[f64],
        _y_dot: &[f64],
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        _fidelity: Fidelity,
    ) -> StatusCode {
        let section = self.section(time.section);
        for (param, (sy, syd)) in sens_y.iter_mut().zip(sens_y_dot.iter_mut()).enumerate() {
            for i in 0..self.components {
                sy[i] = -ad_value(&ad_res[i], param);
                syd[i] = ad_value(&section.slope[i], param);
            }
        }
        0
    }

    fn set_flow_rates(&mut self, _inflow: &Active, _outflow: &Active) {}

    fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]) {
        let section = self.section(0);
        for i in 0..self.components {
            y[i] = section.constant[i].re;
            y_dot[i] = section.slope[i].re;
        }
    }

    fn has_parameter(&self, param: &UnitParameter) -> bool {
        (param.name == CONST_COEFF || param.name == LIN_COEFF)
            && param.component.is_some_and(|c| c < self.components)
            && param.section.unwrap_or(0) < self.sections.len()
    }

    fn set_parameter(&mut self, param: &UnitParameter, value: f64) -> bool {
        match self.coefficient_mut(param) {
            Some(coeff) => {
                coeff.re = value;
                true
            }
            None => false,
        }
    }

    fn set_sensitive_parameter(&mut self, param: &UnitParameter, ad_direction: usize, ad_value: f64, width: usize) -> bool {
        match self.coefficient_mut(param) {
            Some(coeff) => {
                *coeff = with_ad_value(coeff, ad_direction, ad_value, width);
                true
            }
            None => false,
        }
    }

    fn set_sensitive_parameter_value(&mut self, param: &UnitParameter, value: f64) {
        self.set_parameter(param, value);
    }

    fn clear_sens_params(&mut self) {
        for section in &mut self.sections {
            for coeff in section.constant.iter_mut().chain(section.slope.iter_mut()) {
                *coeff = strip_ad(coeff);
            }
        }
    }

    fn all_parameter_values(&self) -> Vec<(UnitParameter, f64)> {
        let mut values = Vec::with_capacity(2 * self.components * self.sections.len());
        for (s, section) in self.sections.iter().enumerate() {
            for (comp, coeff) in section.constant.iter().enumerate() {
                values.push((UnitParameter::for_section(CONST_COEFF, comp, s), coeff.re));
            }
            for (comp, coeff) in section.slope.iter().enumerate() {
                values.push((UnitParameter::for_section(LIN_COEFF, comp, s), coeff.re));
            }
        }
        values
    }

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]) {
        let export = UnitExport::new(self.id).with_field("OUTLET", solution.to_vec());
        recorder.begin_unit_operation(self.id, &export);
        recorder.end_unit_operation();
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        recorder.unit_operation_structure(self.id, self.name(), &[("OUTLET", self.components)]);
    }
}
