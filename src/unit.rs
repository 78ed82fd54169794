//! The unit operation contract consumed by the coupling layer.
//!
//! A unit operation is an opaque DAE subsystem with its own block of the
//! global state vector. The coupling layer only needs to know how large the
//! block is, where the inlet and outlet concentrations live inside it, and
//! how to delegate residual evaluation, linear solves and consistent
//! initialization to it.

use std::fmt;
use std::sync::Arc;

use crate::autodiff::Active;
use crate::external::ExternalFunction;
use crate::parallel::StatusCode;
use crate::recorder::SolutionRecorder;

/// Unique, user-assigned identifier of a unit operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub usize);

impl UnitId {
    /// Returns the raw id.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point in simulated time handed to every residual-type call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationTime {
    /// Time within the current section
    pub t: f64,
    /// Index of the current section
    pub section: usize,
    /// Pre-factor of all time derivatives (time transformation)
    pub time_factor: f64,
}

impl SimulationTime {
    /// Creates a time point with unit time factor.
    pub fn new(t: f64, section: usize) -> Self {
        SimulationTime { t, section, time_factor: 1.0 }
    }

    /// Sets the time transformation factor.
    pub fn with_time_factor(mut self, time_factor: f64) -> Self {
        self.time_factor = time_factor;
        self
    }
}

/// Fidelity of consistent initialization.
///
/// `Lean` skips corrections that are expensive and not required for the
/// integrator to start (e.g. re-equilibrating bound phases).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fidelity {
    #[default]
    Full,
    Lean,
}

/// Location of per-component port values inside a unit's DOF block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    /// Local index of component 0
    pub index: usize,
    /// Distance between consecutive components
    pub stride: usize,
}

impl PortLayout {
    pub fn new(index: usize, stride: usize) -> Self {
        PortLayout { index, stride }
    }

    /// Local index of `component`.
    #[inline]
    pub fn position(&self, component: usize) -> usize {
        self.index + component * self.stride
    }
}

/// Structural description of a unit operation.
///
/// Captured once when the network is configured; everything the layout,
/// validation and matrix assembly need without touching the unit itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitShape {
    pub id: UnitId,
    pub components: usize,
    pub dofs: usize,
    pub inlet: Option<PortLayout>,
    pub outlet: Option<PortLayout>,
    /// Exempt from the flow balance check
    pub can_accumulate: bool,
}

impl UnitShape {
    /// Creates a shape without ports.
    pub fn new(id: UnitId, components: usize, dofs: usize) -> Self {
        UnitShape { id, components, dofs, inlet: None, outlet: None, can_accumulate: false }
    }

    /// Reads the shape of a unit operation.
    pub fn of(unit: &dyn UnitOperation) -> Self {
        UnitShape {
            id: unit.id(),
            components: unit.num_components(),
            dofs: unit.num_dofs(),
            inlet: unit.has_inlet().then(|| {
                PortLayout::new(unit.local_inlet_component_index(), unit.local_inlet_component_stride())
            }),
            outlet: unit.has_outlet().then(|| {
                PortLayout::new(
                    unit.local_outlet_component_index(),
                    unit.local_outlet_component_stride(),
                )
            }),
            can_accumulate: unit.can_accumulate(),
        }
    }

    /// Adds an inlet port.
    pub fn with_inlet(mut self, index: usize, stride: usize) -> Self {
        self.inlet = Some(PortLayout::new(index, stride));
        self
    }

    /// Adds an outlet port.
    pub fn with_outlet(mut self, index: usize, stride: usize) -> Self {
        self.outlet = Some(PortLayout::new(index, stride));
        self
    }

    /// Marks the unit as able to accumulate volume.
    pub fn with_accumulation(mut self, can_accumulate: bool) -> Self {
        self.can_accumulate = can_accumulate;
        self
    }

    pub fn has_inlet(&self) -> bool {
        self.inlet.is_some()
    }

    pub fn has_outlet(&self) -> bool {
        self.outlet.is_some()
    }
}

/// Name of a parameter owned by a unit operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitParameter {
    /// Upper-case parameter name, e.g. `VOLUME`
    pub name: String,
    /// Component the parameter belongs to, `None` if component independent
    pub component: Option<usize>,
    /// Section the parameter is valid in, `None` if section independent
    pub section: Option<usize>,
}

impl UnitParameter {
    /// Component independent parameter.
    pub fn new(name: &str) -> Self {
        UnitParameter { name: name.to_string(), component: None, section: None }
    }

    /// Parameter of a single component.
    pub fn for_component(name: &str, component: usize) -> Self {
        UnitParameter { name: name.to_string(), component: Some(component), section: None }
    }

    /// Parameter of a single component within one section.
    pub fn for_section(name: &str, component: usize, section: usize) -> Self {
        UnitParameter { name: name.to_string(), component: Some(component), section: Some(section) }
    }
}

impl fmt::Display for UnitParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(comp) = self.component {
            write!(f, "[{}]", comp)?;
        }
        if let Some(section) = self.section {
            write!(f, " in section {}", section)?;
        }
        Ok(())
    }
}

/// A self-contained DAE subsystem that can be placed in a network.
///
/// Residual slices (`y`, `y_dot`, `res`, ...) always cover exactly the
/// unit's own DOF block. Returned status codes follow the convention
/// `0` = success, `> 0` = recoverable, `< 0` = fatal.
///
/// Jacobian-dependent methods (`linear_solve`, `multiply_with_jacobian`)
/// use the Jacobian captured by the most recent `residual_with_jacobian`
/// or `residual_sens_fwd_with_jacobian` call.
pub trait UnitOperation: Send + Sync {
    fn id(&self) -> UnitId;

    /// Human readable model name.
    fn name(&self) -> &str;

    fn num_components(&self) -> usize;
    fn num_dofs(&self) -> usize;

    /// DOFs excluding inlet DOFs.
    fn num_pure_dofs(&self) -> usize {
        if self.has_inlet() {
            self.num_dofs().saturating_sub(self.num_components())
        } else {
            self.num_dofs()
        }
    }

    fn has_inlet(&self) -> bool;
    fn has_outlet(&self) -> bool;

    /// Units that may accumulate volume are exempt from the flow balance.
    fn can_accumulate(&self) -> bool {
        false
    }

    fn local_inlet_component_index(&self) -> usize;
    fn local_inlet_component_stride(&self) -> usize;
    fn local_outlet_component_index(&self) -> usize;
    fn local_outlet_component_stride(&self) -> usize;

    /// Whether the unit computes its Jacobian with AD directions.
    fn uses_ad(&self) -> bool {
        false
    }

    /// Number of AD directions the unit needs for its own Jacobian.
    fn required_ad_dirs(&self) -> usize {
        0
    }

    /// Evaluates `F(t, y, ẏ)`. A missing `y_dot` means `ẏ = 0`.
    fn residual(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode;

    /// Evaluates the residual and refreshes the stored Jacobian.
    fn residual_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        res: &mut [f64],
    ) -> StatusCode;

    /// Residual with parameter derivatives in `ad_res` (no Jacobian update).
    fn residual_sens_fwd_ad_only(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode;

    /// Residual with parameter derivatives in `ad_res` and Jacobian update.
    fn residual_sens_fwd_with_jacobian(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: Option<&[f64]>,
        ad_res: &mut [Active],
    ) -> StatusCode;

    /// `ret = alpha * dF/dy * s + beta * ret`
    fn multiply_with_jacobian(&self, time: SimulationTime, s: &[f64], alpha: f64, beta: f64, ret: &mut [f64]);

    /// `ret = time_factor * dF/dẏ * s_dot`
    fn multiply_with_derivative_jacobian(&self, time: SimulationTime, s_dot: &[f64], ret: &mut [f64]);

    /// Combines Jacobian products and AD parameter derivatives into the
    /// forward sensitivity residuals
    /// `res_s[p] = dF/dy * ys[p] + dF/dẏ * ys_dot[p] + dF/dp`.
    ///
    /// Sensitivity `p` reads AD direction `p` of `ad_res`.
    fn residual_sens_fwd_combine(
        &self,
        time: SimulationTime,
        ys: &[&[f64]],
        ys_dot: &[&[f64]],
        res_s: &mut [&mut [f64]],
        ad_res: &[Active],
    ) -> StatusCode {
        let mut tmp = vec![0.0; self.num_dofs()];
        for (param, res) in res_s.iter_mut().enumerate() {
            let res: &mut [f64] = res;
            self.multiply_with_jacobian(time, ys[param], 1.0, 0.0, res);
            self.multiply_with_derivative_jacobian(time, ys_dot[param], &mut tmp);
            for (i, r) in res.iter_mut().enumerate() {
                *r += tmp[i] + crate::autodiff::ad_value(&ad_res[i], param);
            }
        }
        0
    }

    /// Solves `(dF/dy + alpha * time_factor * dF/dẏ) x = rhs` in place.
    fn linear_solve(
        &mut self,
        time: SimulationTime,
        alpha: f64,
        outer_tol: f64,
        rhs: &mut [f64],
        weight: &[f64],
    ) -> StatusCode;

    /// Makes the algebraic part of `y` consistent (inlet values are given).
    fn consistent_initial_state(
        &mut self,
        time: SimulationTime,
        y: &mut [f64],
        error_tol: f64,
        fidelity: Fidelity,
    ) -> StatusCode;

    /// Computes `ẏ` from `res = F(t, y, 0)`.
    fn consistent_initial_time_derivative(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &mut [f64],
        res: &[f64],
        fidelity: Fidelity,
    ) -> StatusCode;

    /// Consistent initial parameter sensitivities; `ad_res` holds `dF/dp`.
    fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        fidelity: Fidelity,
    ) -> StatusCode;

    /// Total volumetric inflow and outflow of the active network switch.
    fn set_flow_rates(&mut self, inflow: &Active, outflow: &Active);

    fn notify_discontinuous_section_transition(&mut self, _t: f64, _section: usize) {}

    fn set_section_times(&mut self, _times: &[f64], _continuity: &[bool]) {}

    fn set_external_functions(&mut self, _functions: &[Option<Arc<dyn ExternalFunction>>]) {}

    /// Writes default initial values.
    fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]);

    /// Expands a user error tolerance specification onto this unit's DOFs.
    fn expand_error_tol(&self, spec: &[f64], out: &mut [f64]) {
        if spec.len() == out.len() {
            out.copy_from_slice(spec);
        } else if let Some(first) = spec.first() {
            out.fill(*first);
        }
    }

    fn has_parameter(&self, param: &UnitParameter) -> bool;
    fn set_parameter(&mut self, param: &UnitParameter, value: f64) -> bool;

    /// Registers `param` as sensitive, seeding AD direction `ad_direction`.
    /// Seeded values carry `width` derivative directions.
    fn set_sensitive_parameter(
        &mut self,
        param: &UnitParameter,
        ad_direction: usize,
        ad_value: f64,
        width: usize,
    ) -> bool;

    /// Changes the value of an already sensitive parameter.
    fn set_sensitive_parameter_value(&mut self, param: &UnitParameter, value: f64);

    fn clear_sens_params(&mut self);

    fn all_parameter_values(&self) -> Vec<(UnitParameter, f64)>;

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]);

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_position() {
        let port = PortLayout::new(3, 2);
        assert_eq!(port.position(0), 3);
        assert_eq!(port.position(2), 7);
    }

    #[test]
    fn test_shape_builder() {
        let shape = UnitShape::new(UnitId(4), 2, 6).with_inlet(0, 1).with_accumulation(true);
        assert!(shape.has_inlet());
        assert!(!shape.has_outlet());
        assert!(shape.can_accumulate);
        assert_eq!(shape.inlet, Some(PortLayout::new(0, 1)));
    }

    #[test]
    fn test_parameter_display() {
        assert_eq!(UnitParameter::new("VOLUME").to_string(), "VOLUME");
        assert_eq!(UnitParameter::for_component("EQUILIBRIUM", 1).to_string(), "EQUILIBRIUM[1]");
    }

    #[test]
    fn test_simulation_time_builder() {
        let time = SimulationTime::new(1.5, 2).with_time_factor(0.5);
        assert_eq!(time.section, 2);
        assert_eq!(time.time_factor, 0.5);
    }
}
