//! Solution output forwarding.
//!
//! The network does not format or store results itself. At every reported
//! time step it brackets the per-unit reports with begin/end calls so a
//! [`SolutionRecorder`] knows whether it is looking at the state, its time
//! derivative or a sensitivity.

use std::collections::{BTreeMap, HashMap};

use crate::parameters::ParameterId;
use crate::unit::UnitId;

/// Named values exported by one unit operation.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitExport {
    pub unit: UnitId,
    /// `(field name, values)` pairs, e.g. `("OUTLET", [..])`
    pub fields: Vec<(&'static str, Vec<f64>)>,
}

impl UnitExport {
    pub fn new(unit: UnitId) -> Self {
        UnitExport { unit, fields: Vec::new() }
    }

    /// Appends a field.
    pub fn with_field(mut self, name: &'static str, values: Vec<f64>) -> Self {
        self.fields.push((name, values));
        self
    }

    pub fn field(&self, name: &str) -> Option<&[f64]> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v.as_slice())
    }
}

/// Receiver of reported solutions.
///
/// All methods except [`begin_unit_operation`](Self::begin_unit_operation)
/// have empty default implementations.
pub trait SolutionRecorder {
    /// Announces the fields a unit exports and their lengths.
    fn unit_operation_structure(&mut self, _unit: UnitId, _name: &str, _fields: &[(&'static str, usize)]) {}

    fn begin_timestep(&mut self, _t: f64) {}
    fn end_timestep(&mut self) {}

    fn begin_unit_operation(&mut self, unit: UnitId, export: &UnitExport);
    fn end_unit_operation(&mut self) {}

    fn begin_solution(&mut self) {}
    fn end_solution(&mut self) {}
    fn begin_solution_derivative(&mut self) {}
    fn end_solution_derivative(&mut self) {}
    fn begin_sensitivity(&mut self, _param: &ParameterId, _sens_idx: usize) {}
    fn end_sensitivity(&mut self, _param: &ParameterId, _sens_idx: usize) {}
    fn begin_sensitivity_derivative(&mut self, _param: &ParameterId, _sens_idx: usize) {}
    fn end_sensitivity_derivative(&mut self, _param: &ParameterId, _sens_idx: usize) {}
}

/// What a recorded series holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Solution,
    SolutionDerivative,
    Sensitivity(usize),
    SensitivityDerivative(usize),
}

/// Recorder keeping every reported field in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    time: Vec<f64>,
    current: Option<RecordKind>,
    series: HashMap<(UnitId, RecordKind, &'static str), Vec<Vec<f64>>>,
    structure: BTreeMap<UnitId, (String, Vec<(&'static str, usize)>)>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported time points.
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    /// All recorded values of one field, one entry per time step.
    pub fn series(&self, unit: UnitId, kind: RecordKind, field: &str) -> Option<&[Vec<f64>]> {
        self.series
            .iter()
            .find(|((u, k, f), _)| *u == unit && *k == kind && *f == field)
            .map(|(_, v)| v.as_slice())
    }

    /// Structure announced by a unit.
    pub fn structure(&self, unit: UnitId) -> Option<&(String, Vec<(&'static str, usize)>)> {
        self.structure.get(&unit)
    }

    pub fn clear(&mut self) {
        self.time.clear();
        self.current = None;
        self.series.clear();
    }
}

impl SolutionRecorder for InMemoryRecorder {
    fn unit_operation_structure(&mut self, unit: UnitId, name: &str, fields: &[(&'static str, usize)]) {
        self.structure.insert(unit, (name.to_string(), fields.to_vec()));
    }

    fn begin_timestep(&mut self, t: f64) {
        self.time.push(t);
    }

    fn begin_unit_operation(&mut self, unit: UnitId, export: &UnitExport) {
        let Some(kind) = self.current else {
            return;
        };
        for (name, values) in &export.fields {
            self.series.entry((unit, kind, *name)).or_default().push(values.clone());
        }
    }

    fn begin_solution(&mut self) {
        self.current = Some(RecordKind::Solution);
    }

    fn end_solution(&mut self) {
        self.current = None;
    }

    fn begin_solution_derivative(&mut self) {
        self.current = Some(RecordKind::SolutionDerivative);
    }

    fn end_solution_derivative(&mut self) {
        self.current = None;
    }

    fn begin_sensitivity(&mut self, _param: &ParameterId, sens_idx: usize) {
        self.current = Some(RecordKind::Sensitivity(sens_idx));
    }

    fn end_sensitivity(&mut self, _param: &ParameterId, _sens_idx: usize) {
        self.current = None;
    }

    fn begin_sensitivity_derivative(&mut self, _param: &ParameterId, sens_idx: usize) {
        self.current = Some(RecordKind::SensitivityDerivative(sens_idx));
    }

    fn end_sensitivity_derivative(&mut self, _param: &ParameterId, _sens_idx: usize) {
        self.current = None;
    }
}
