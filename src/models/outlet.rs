//! Outlet (product) unit operation.
//!
//! A pure sink whose DOFs are a copy of its inlet concentrations. Useful to
//! record what leaves the network.

use crate::autodiff::{Active, CouplingScalar};
use crate::parallel::StatusCode;
use crate::recorder::{SolutionRecorder, UnitExport};
use crate::unit::{Fidelity, SimulationTime, UnitId, UnitOperation, UnitParameter};

/// Sink unit without parameters.
#[derive(Debug, Clone)]
pub struct Outlet {
    id: UnitId,
    components: usize,
}

impl Outlet {
    pub fn new(id: UnitId, components: usize) -> Self {
        Outlet { id, components }
    }

    /// `res = y`, the network adds `-c_coupling`.
    fn sink_residual<T: CouplingScalar>(y: &[f64], res: &mut [T]) {
        for (r, &v) in res.iter_mut().zip(y) {
            *r = T::from_f64(v);
        }
    }
}

impl UnitOperation for Outlet {
    fn id(&self) -> UnitId {
        self.id
    }

    fn name(&self) -> &str {
        "OUTLET"
    }

    fn num_components(&self) -> usize {
        self.components
    }

    fn num_dofs(&self) -> usize {
        self.components
    }

    fn has_inlet(&self) -> bool {
        true
    }

    fn has_outlet(&self) -> bool {
        false
    }

    fn local_inlet_component_index(&self) -> usize {
        0
    }

    fn local_inlet_component_stride(&self) -> usize {
        1
    }

    fn local_outlet_component_index(&self) -> usize {
        0
    }

    fn local_outlet_component_stride(&self) -> usize {
        0
    }

    fn residual(&mut self, _time: SimulationTime, y: &[f64], _y_dot: Option<&[f64]>, res: &mut [f64]) -> StatusCode {
        Self::sink_residual(y, res);
        0
    }

    fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode {
        self.residual(time, y, y_dot, res)
    }

    fn residual_sens_fwd_ad_only(
        &mut self,
        _time: SimulationTime,
        y: &[f64],
        _y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode {
        Self::sink_residual(y, ad_res);
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
        _time: SimulationTime,
        _y: &mut [f64],
        _error_tol: f64,
        _fidelity: Fidelity,
    ) -> StatusCode {
        0
    }

    fn consistent_initial_time_derivative(
        &mut self,
        _time: SimulationTime,
        _y: &[f64],
        _y_dot: &mut [f64],
        _res: &[f64],
        _fidelity: Fidelity,
    ) -> StatusCode {
        0
    }

    fn consistent_initial_sensitivity(
        &mut self,
        _time: SimulationTime,
        _y: &[f64],
        _y_dot: &[f64],
        _sens_y: &mut [&mut [f64]],
        _sens_y_dot: &mut [&mut [f64]],
        _ad_res: &[Active],
        _fidelity: Fidelity,
    ) -> StatusCode {
        0
    }

    fn set_flow_rates(&mut self, _inflow: &Active, _outflow: &Active) {}

    fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]) {
        y.fill(0.0);
        y_dot.fill(0.0);
    }

    fn has_parameter(&self, _param: &UnitParameter) -> bool {
        false
    }

    fn set_parameter(&mut self, _param: &UnitParameter, _value: f64) -> bool {
        false
    }

    fn set_sensitive_parameter(&mut self, _param: &UnitParameter, _ad_direction: usize, _ad_value: f64, _width: usize) -> bool {
        false
    }

    fn set_sensitive_parameter_value(&mut self, _param: &UnitParameter, _value: f64) {}

    fn clear_sens_params(&mut self) {}

    fn all_parameter_values(&self) -> Vec<(UnitParameter, f64)> {
        Vec::new()
    }

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]) {
        let export = UnitExport::new(self.id).with_field("INLET", solution.to_vec());
        recorder.begin_unit_operation(self.id, &export);
        recorder.end_unit_operation();
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        recorder.unit_operation_structure(self.id, self.name(), &[("INLET", self.components)]);
    }
}
