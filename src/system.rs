//! The model system: a network of unit operations solved as one DAE.
//!
//! [`ModelSystem`] owns every unit operation, the DOF layout, the network
//! switches and the coupling matrices. The global residual, linear solves,
//! consistent initialization and sensitivities are implemented on it in
//! their own modules ([`crate::residual`], [`crate::solvers::schur`],
//! [`crate::init`], [`crate::sensitivity`]).
//!
//! # Example
//!
//! ```
//! use nomata_network::models::{Inlet, Outlet};
//! use nomata_network::network::{ConnectionRow, SwitchSpec};
//! use nomata_network::solvers::SchurSolverConfig;
//! use nomata_network::system::ModelSystem;
//! use nomata_network::unit::UnitId;
//!
//! let mut system = ModelSystem::new();
//! system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0]))).unwrap();
//! system.add_unit(Box::new(Outlet::new(UnitId(1), 1))).unwrap();
//!
//! let switch = SwitchSpec::new(0).with_connection(ConnectionRow::new(UnitId(0), UnitId(1), 1.0));
//! system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
//!
//! // 1 inlet DOF + 1 outlet DOF + 1 coupling DOF
//! assert_eq!(system.num_dofs(), 3);
//! ```

use std::sync::Arc;

use log::{debug, error, warn};

use crate::coupling::CouplingMatrices;
use crate::error::{NetworkError, NetworkResult};
use crate::external::ExternalFunction;
use crate::layout::{CouplingIndexMap, DofLayout};
use crate::network::{Network, SwitchSpec};
use crate::parallel::{StatusCode, fuse_all};
use crate::parameters::SensitivityRegistry;
use crate::recorder::SolutionRecorder;
use crate::solvers::{Gmres, SchurSolverConfig};
use crate::unit::{UnitId, UnitOperation, UnitShape};

/// Status of evaluations on a system that needs to be (re)configured.
pub const NOT_CONFIGURED: StatusCode = -2;

/// A network of unit operations coupled into one global DAE system.
pub struct ModelSystem {
    pub(crate) units: Vec<Box<dyn UnitOperation>>,
    pub(crate) shapes: Vec<UnitShape>,
    pub(crate) layout: DofLayout,
    pub(crate) coupling_map: CouplingIndexMap,
    pub(crate) network: Option<Network>,
    pub(crate) coupling: CouplingMatrices,
    pub(crate) solver: SchurSolverConfig,
    pub(crate) gmres: Gmres,
    /// One status slot per unit, written only by that unit's task
    pub(crate) error_indicator: Vec<StatusCode>,
    /// Scratch vector of global size
    pub(crate) temp_state: Vec<f64>,
    pub(crate) external_functions: Vec<Option<Arc<dyn ExternalFunction>>>,
    pub(crate) sensitivities: SensitivityRegistry,
    /// Switch specs of the last successful configuration
    pub(crate) switch_specs: Vec<SwitchSpec>,
}

impl Default for ModelSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModelSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSystem")
            .field("units", &self.units.iter().map(|u| u.id()).collect::<Vec<_>>())
            .field("layout", &self.layout)
            .field("network", &self.network)
            .field("solver", &self.solver)
            .finish_non_exhaustive()
    }
}

impl ModelSystem {
    /// Creates an empty system.
    pub fn new() -> Self {
        let solver = SchurSolverConfig::default();
        ModelSystem {
            units: Vec::new(),
            shapes: Vec::new(),
            layout: DofLayout::default(),
            coupling_map: CouplingIndexMap::default(),
            network: None,
            coupling: CouplingMatrices::default(),
            gmres: Gmres::new(0, &solver),
            solver,
            error_indicator: Vec::new(),
            temp_state: Vec::new(),
            external_functions: Vec::new(),
            sensitivities: SensitivityRegistry::default(),
            switch_specs: Vec::new(),
        }
    }

    /// Registers a unit operation. The system has to be (re)configured
    /// before it is evaluated.
    pub fn add_unit(&mut self, unit: Box<dyn UnitOperation>) -> NetworkResult<()> {
        let id = unit.id();
        if self.unit_position(id).is_some() {
            return Err(NetworkError::DuplicateUnit(id));
        }
        self.units.push(unit);
        self.network = None;
        Ok(())
    }

    /// Removes a unit operation and hands it back.
    pub fn remove_unit(&mut self, id: UnitId) -> NetworkResult<Box<dyn UnitOperation>> {
        let pos = self.unit_position(id).ok_or(NetworkError::UnknownUnit(id))?;
        self.network = None;
        Ok(self.units.remove(pos))
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    /// Position of unit `id` in registration order.
    pub fn unit_position(&self, id: UnitId) -> Option<usize> {
        self.units.iter().position(|u| u.id() == id)
    }

    pub fn unit(&self, id: UnitId) -> Option<&dyn UnitOperation> {
        self.units.iter().find(|u| u.id() == id).map(|u| u.as_ref())
    }

    pub fn unit_mut(&mut self, id: UnitId) -> Option<&mut (dyn UnitOperation + 'static)> {
        self.units.iter_mut().find(|u| u.id() == id).map(|u| u.as_mut())
    }

    pub fn unit_by_index(&self, index: usize) -> Option<&dyn UnitOperation> {
        self.units.get(index).map(|u| u.as_ref())
    }

    /// Largest registered unit id.
    pub fn max_unit_operation_id(&self) -> Option<UnitId> {
        self.units.iter().map(|u| u.id()).max()
    }

    pub fn layout(&self) -> &DofLayout {
        &self.layout
    }

    pub fn coupling_index_map(&self) -> &CouplingIndexMap {
        &self.coupling_map
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    pub fn coupling(&self) -> &CouplingMatrices {
        &self.coupling
    }

    pub fn solver_config(&self) -> &SchurSolverConfig {
        &self.solver
    }

    pub fn num_dofs(&self) -> usize {
        self.layout.num_dofs()
    }

    pub fn num_pure_dofs(&self) -> usize {
        self.layout.num_pure_dofs()
    }

    pub fn num_coupling_dofs(&self) -> usize {
        self.layout.num_coupling_dofs()
    }

    pub fn is_configured(&self) -> bool {
        self.network.is_some()
    }

    /// Builds layout, switches and coupling matrices for the current units.
    ///
    /// Flow-rate sensitivities registered before are dropped; unit parameter
    /// sensitivities are kept and reseeded.
    pub fn configure(&mut self, switches: Vec<SwitchSpec>, solver: SchurSolverConfig) -> NetworkResult<()> {
        let shapes: Vec<UnitShape> = self.units.iter().map(|u| UnitShape::of(u.as_ref())).collect();
        let network = Network::configure(&switches, &shapes)?;

        self.layout = DofLayout::new(&shapes);
        self.coupling_map = CouplingIndexMap::new(&shapes);
        self.coupling = CouplingMatrices::allocate(&shapes, &network);
        self.gmres = Gmres::new(self.layout.num_coupling_dofs(), &solver);
        self.error_indicator = vec![0; shapes.len()];
        self.temp_state = vec![0.0; self.layout.num_dofs()];
        self.shapes = shapes;
        self.network = Some(network);
        self.solver = solver;
        self.switch_specs = switches;

        for unit in &mut self.units {
            unit.set_external_functions(&self.external_functions);
        }

        self.reseed_unit_sensitivities();
        self.refresh_coupling();
        debug!(
            "Configured {} units, {} DOFs ({} coupling)",
            self.units.len(),
            self.layout.num_dofs(),
            self.layout.num_coupling_dofs()
        );
        Ok(())
    }

    /// Replaces the switches keeping units, layout and solver settings.
    pub fn reconfigure_switches(&mut self, switches: Vec<SwitchSpec>) -> NetworkResult<()> {
        if self.network.is_none() {
            return Err(NetworkError::NotConfigured);
        }
        let network = Network::configure(&switches, &self.shapes)?;
        self.coupling = CouplingMatrices::allocate(&self.shapes, &network);
        self.network = Some(network);
        self.switch_specs = switches;
        self.reseed_unit_sensitivities();
        self.refresh_coupling();
        Ok(())
    }

    /// Updates GMRES settings; the Krylov dimension is fixed at configure.
    pub fn set_solver_settings(&mut self, solver: SchurSolverConfig) {
        self.gmres.set_orthogonalization(solver.orthogonalization);
        self.gmres.set_max_restarts(solver.max_restarts);
        self.solver.orthogonalization = solver.orthogonalization;
        self.solver.max_restarts = solver.max_restarts;
        self.solver.schur_safety = solver.schur_safety;
    }

    /// Re-applies the active switch: passes total flow rates to the units
    /// and reassembles the coupling matrices.
    pub fn refresh_coupling(&mut self) {
        let Some(network) = &self.network else {
            return;
        };
        let switch = network.active();
        let (inflow, outflow) = switch.flow_totals(self.units.len());
        for ((unit, inflow), outflow) in self.units.iter_mut().zip(&inflow).zip(&outflow) {
            unit.set_flow_rates(inflow, outflow);
        }
        self.coupling.assemble(&self.shapes, &self.coupling_map, switch);
    }

    /// Activates the switch valid in `section` and notifies all units.
    ///
    /// Coupling matrices are reassembled when the simulation (re)starts at
    /// section 0 or the active switch changes.
    pub fn notify_discontinuous_section_transition(&mut self, t: f64, section: usize) {
        let Some(network) = self.network.as_mut() else {
            warn!("Section transition at t = {} ignored, model system is not configured", t);
            return;
        };
        let changed = network.advance(section);

        let switch = network.active();
        let (inflow, outflow) = switch.flow_totals(self.units.len());
        for ((unit, inflow), outflow) in self.units.iter_mut().zip(&inflow).zip(&outflow) {
            unit.set_flow_rates(inflow, outflow);
            unit.notify_discontinuous_section_transition(t, section);
        }

        if section == 0 || changed {
            self.coupling.assemble(&self.shapes, &self.coupling_map, switch);
        }
    }

    pub fn uses_ad(&self) -> bool {
        self.units.iter().any(|u| u.uses_ad())
    }

    /// Units are independent, so the system needs as many AD directions as
    /// the most demanding unit.
    pub fn required_ad_dirs(&self) -> usize {
        self.units.iter().map(|u| u.required_ad_dirs()).max().unwrap_or(0)
    }

    /// Registers an external function; `None` keeps the slot of a source
    /// that failed to configure.
    pub fn add_external_function(&mut self, function: Option<Arc<dyn ExternalFunction>>) -> usize {
        self.external_functions.push(function);
        for unit in &mut self.units {
            unit.set_external_functions(&self.external_functions);
        }
        self.external_functions.len() - 1
    }

    /// Replaces the whole registry and forwards it to the units.
    pub fn set_external_functions(&mut self, functions: Vec<Option<Arc<dyn ExternalFunction>>>) {
        self.external_functions = functions;
        for unit in &mut self.units {
            unit.set_external_functions(&self.external_functions);
        }
    }

    pub fn external_functions(&self) -> &[Option<Arc<dyn ExternalFunction>>] {
        &self.external_functions
    }

    pub fn set_section_times(&mut self, times: &[f64], continuity: &[bool]) {
        for unit in &mut self.units {
            unit.set_section_times(times, continuity);
        }
        for function in self.external_functions.iter().flatten() {
            function.set_section_times(times, continuity);
        }
    }

    /// Expands user error tolerances onto the unit DOFs.
    ///
    /// A specification covering all unit DOFs is split per unit,
    /// anything else is handed to every unit as is. Coupling DOFs keep the
    /// values already in `out`.
    pub fn expand_error_tol(&self, spec: &[f64], out: &mut [f64]) {
        let (blocks, _) = self.layout.split_mut(out);
        let per_unit = spec.len() == self.layout.coupling_offset();
        for (i, (unit, block)) in self.units.iter().zip(blocks).enumerate() {
            if per_unit {
                unit.expand_error_tol(&spec[self.layout.unit_range(i)], block);
            } else {
                unit.expand_error_tol(spec, block);
            }
        }
    }

    /// Writes per-unit default initial values.
    pub fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]) {
        let (y_blocks, _) = self.layout.split_mut(y);
        let (y_dot_blocks, _) = self.layout.split_mut(y_dot);
        for ((unit, y), y_dot) in self.units.iter().zip(y_blocks).zip(y_dot_blocks) {
            unit.apply_initial_condition(y, y_dot);
        }
    }

    /// Forwards every unit's part of `solution` to the recorder.
    pub fn report_solution(&self, recorder: &mut dyn SolutionRecorder, solution: &[f64]) {
        for (i, unit) in self.units.iter().enumerate() {
            unit.report_solution(recorder, &solution[self.layout.unit_range(i)]);
        }
    }

    pub fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        for unit in &self.units {
            unit.report_solution_structure(recorder);
        }
    }

    /// Reports one time step with state, derivative and sensitivities.
    ///
    /// Sensitivity `i` is reported under the first parameter registered for
    /// AD direction `i`.
    pub fn report_timestep(
        &self,
        recorder: &mut dyn SolutionRecorder,
        t: f64,
        y: &[f64],
        y_dot: Option<&[f64]>,
        sens_y: &[Vec<f64>],
        sens_y_dot: &[Vec<f64>],
    ) {
        recorder.begin_timestep(t);

        recorder.begin_solution();
        self.report_solution(recorder, y);
        recorder.end_solution();

        if let Some(y_dot) = y_dot {
            recorder.begin_solution_derivative();
            self.report_solution(recorder, y_dot);
            recorder.end_solution_derivative();
        }

        for (idx, sens) in sens_y.iter().enumerate() {
            let Some(param) = self.sensitivities.entries().iter().find(|e| e.direction == idx) else {
                continue;
            };
            recorder.begin_sensitivity(&param.id, idx);
            self.report_solution(recorder, sens);
            recorder.end_sensitivity(&param.id, idx);

            if let Some(sens_dot) = sens_y_dot.get(idx) {
                recorder.begin_sensitivity_derivative(&param.id, idx);
                self.report_solution(recorder, sens_dot);
                recorder.end_sensitivity_derivative(&param.id, idx);
            }
        }

        recorder.end_timestep();
    }

    /// Fused status of all units.
    /// Logs and returns `false` when the unit list changed after the last
    /// configuration. Layout and coupling matrices are stale then.
    pub(crate) fn check_configured(&self, operation: &str) -> bool {
        if self.is_configured() {
            return true;
        }
        error!("{} requested, but the model system is not configured for its units", operation);
        false
    }

    pub(crate) fn total_error(&self) -> StatusCode {
        fuse_all(self.error_indicator.iter().copied())
    }

    pub(crate) fn reset_error_indicator(&mut self) {
        self.error_indicator.iter_mut().for_each(|s| *s = 0);
    }
}
