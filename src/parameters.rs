//! Parameter addressing and sensitivity registration.
//!
//! The network owns one kind of parameter itself: the flow rate of every
//! distinct `(source, destination)` pair of every switch. All other
//! parameters belong to unit operations and are forwarded.
//!
//! Seeded derivative vectors of all sensitive parameters must have the same
//! width. When a registration opens a new AD direction, every previous
//! registration is replayed with the wider derivative vector.

use std::fmt;

use log::{debug, warn};

use crate::autodiff::{Active, ad_value, strip_ad, with_ad_value};
use crate::system::ModelSystem;
use crate::unit::{UnitId, UnitParameter};

/// Address of a tunable parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterId {
    /// Flow rate of a unit pair in a switch
    FlowRate { source: UnitId, destination: UnitId, switch: usize },
    /// Parameter owned by a unit operation
    Unit { unit: UnitId, param: UnitParameter },
}

impl ParameterId {
    pub fn flow_rate(source: UnitId, destination: UnitId, switch: usize) -> Self {
        ParameterId::FlowRate { source, destination, switch }
    }

    pub fn unit(unit: UnitId, name: &str) -> Self {
        ParameterId::Unit { unit, param: UnitParameter::new(name) }
    }

    pub fn unit_component(unit: UnitId, name: &str, component: usize) -> Self {
        ParameterId::Unit { unit, param: UnitParameter::for_component(name, component) }
    }

    pub fn unit_section(unit: UnitId, name: &str, component: usize, section: usize) -> Self {
        ParameterId::Unit { unit, param: UnitParameter::for_section(name, component, section) }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterId::FlowRate { source, destination, switch } => {
                write!(f, "CONNECTION[{} -> {}, switch {}]", source, destination, switch)
            }
            ParameterId::Unit { unit, param } => write!(f, "unit {} {}", unit, param),
        }
    }
}

/// One sensitive parameter registration.
#[derive(Debug, Clone, PartialEq)]
pub struct SensitiveParameter {
    pub id: ParameterId,
    pub direction: usize,
    pub seed: f64,
}

/// Registered sensitivities and the current derivative width.
#[derive(Debug, Clone, Default)]
pub struct SensitivityRegistry {
    width: usize,
    entries: Vec<SensitiveParameter>,
}

impl SensitivityRegistry {
    /// Number of AD directions carried by seeded values.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn entries(&self) -> &[SensitiveParameter] {
        &self.entries
    }

    pub fn contains(&self, id: &ParameterId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }
}

impl ModelSystem {
    /// Locates the owning connection row of a flow-rate parameter.
    fn flow_rate_slot(&mut self, id: &ParameterId) -> Option<&mut Active> {
        let ParameterId::FlowRate { source, destination, switch } = id else {
            return None;
        };
        let src = self.unit_position(*source)?;
        let dst = self.unit_position(*destination)?;
        let switch = self.network.as_mut()?.switch_mut(*switch)?;
        let row = switch.owner_row(src, dst)?;
        Some(&mut switch.connections[row].flow_rate)
    }

    pub fn has_parameter(&self, id: &ParameterId) -> bool {
        match id {
            ParameterId::FlowRate { source, destination, switch } => {
                let (Some(src), Some(dst)) = (self.unit_position(*source), self.unit_position(*destination))
                else {
                    return false;
                };
                self.network
                    .as_ref()
                    .and_then(|n| n.switch(*switch))
                    .and_then(|s| s.owner_row(src, dst))
                    .is_some()
            }
            ParameterId::Unit { unit, param } => self.unit(*unit).is_some_and(|u| u.has_parameter(param)),
        }
    }

    /// Sets a parameter value; derivative seeds are kept.
    ///
    /// Flow-rate changes take effect at the next switch assembly or after
    /// [`refresh_coupling`](Self::refresh_coupling).
    pub fn set_parameter(&mut self, id: &ParameterId, value: f64) -> bool {
        match id {
            ParameterId::FlowRate { .. } => match self.flow_rate_slot(id) {
                Some(rate) => {
                    rate.re = value;
                    true
                }
                None => {
                    warn!("Flow rate parameter {} not found", id);
                    false
                }
            },
            ParameterId::Unit { unit, param } => {
                self.unit_mut(*unit).is_some_and(|u| u.set_parameter(param, value))
            }
        }
    }

    /// Changes the value of a parameter only if it is registered as sensitive.
    pub fn set_sensitive_parameter_value(&mut self, id: &ParameterId, value: f64) {
        if !self.sensitivities.contains(id) {
            return;
        }
        match id {
            ParameterId::FlowRate { .. } => {
                if let Some(rate) = self.flow_rate_slot(id) {
                    rate.re = value;
                }
            }
            ParameterId::Unit { unit, param } => {
                if let Some(u) = self.unit_mut(*unit) {
                    u.set_sensitive_parameter_value(param, value);
                }
            }
        }
    }

    /// Marks a parameter as sensitive and seeds AD direction `direction`.
    ///
    /// Returns `false` if no parameter with this id exists. The coupling
    /// matrices of the active switch are refreshed so the seed takes part in
    /// the next residual evaluation.
    pub fn set_sensitive_parameter(&mut self, id: &ParameterId, direction: usize, seed: f64) -> bool {
        let width = self.sensitivities.width.max(direction + 1);
        if !self.seed_parameter(id, direction, seed, width) {
            return false;
        }
        debug!("Sensitive parameter {}: direction {} seeded with {}", id, direction, seed);

        self.sensitivities.entries.retain(|e| !(e.id == *id && e.direction == direction));
        self.sensitivities.entries.push(SensitiveParameter { id: id.clone(), direction, seed });

        if width > self.sensitivities.width {
            self.sensitivities.width = width;
            let entries = self.sensitivities.entries.clone();
            for entry in &entries {
                self.seed_parameter(&entry.id, entry.direction, entry.seed, width);
            }
        }

        self.refresh_coupling();
        true
    }

    fn seed_parameter(&mut self, id: &ParameterId, direction: usize, seed: f64, width: usize) -> bool {
        match id {
            ParameterId::FlowRate { .. } => match self.flow_rate_slot(id) {
                Some(rate) => {
                    *rate = with_ad_value(rate, direction, seed, width);
                    true
                }
                None => false,
            },
            ParameterId::Unit { unit, param } => self
                .unit_mut(*unit)
                .is_some_and(|u| u.set_sensitive_parameter(param, direction, seed, width)),
        }
    }

    /// Removes all sensitivity registrations and derivative seeds.
    pub fn clear_sens_params(&mut self) {
        if let Some(network) = self.network.as_mut() {
            let count = network.num_switches();
            for idx in 0..count {
                if let Some(switch) = network.switch_mut(idx) {
                    for conn in &mut switch.connections {
                        conn.flow_rate = strip_ad(&conn.flow_rate);
                    }
                }
            }
        }
        for unit in &mut self.units {
            unit.clear_sens_params();
        }
        self.sensitivities = SensitivityRegistry::default();
        self.refresh_coupling();
    }

    /// Drops flow-rate registrations and reseeds the unit parameter ones.
    ///
    /// Called after the switches were replaced: the old flow-rate seeds are
    /// gone with them, so the derivative width is recomputed from the
    /// remaining registrations and every unit is reseeded with it.
    pub(crate) fn reseed_unit_sensitivities(&mut self) {
        let registry = std::mem::take(&mut self.sensitivities);
        for unit in &mut self.units {
            unit.clear_sens_params();
        }

        let kept: Vec<_> = registry
            .entries
            .into_iter()
            .filter(|e| matches!(e.id, ParameterId::Unit { .. }))
            .collect();
        let width = kept.iter().map(|e| e.direction + 1).max().unwrap_or(0);

        for entry in kept {
            if self.seed_parameter(&entry.id, entry.direction, entry.seed, width) {
                self.sensitivities.entries.push(entry);
            } else {
                warn!("Sensitive parameter {} no longer exists, registration dropped", entry.id);
            }
        }
        self.sensitivities.width = if self.sensitivities.entries.is_empty() { 0 } else { width };
    }

    /// All parameter values: flow rates of every switch followed by the
    /// parameters reported by the units.
    pub fn all_parameter_values(&self) -> Vec<(ParameterId, f64)> {
        let mut values = Vec::new();
        if let Some(network) = &self.network {
            for (idx, switch) in network.switches().iter().enumerate() {
                for (row, conn) in switch.connections.iter().enumerate() {
                    if conn.is_owner(row) {
                        let id = ParameterId::flow_rate(
                            self.shapes[conn.source].id,
                            self.shapes[conn.destination].id,
                            idx,
                        );
                        values.push((id, conn.flow_rate.re));
                    }
                }
            }
        }
        for unit in &self.units {
            let id = unit.id();
            values.extend(
                unit.all_parameter_values()
                    .into_iter()
                    .map(|(param, v)| (ParameterId::Unit { unit: id, param }, v)),
            );
        }
        values
    }

    /// Registered sensitive parameters.
    pub fn sensitive_parameters(&self) -> &SensitivityRegistry {
        &self.sensitivities
    }

    /// Derivative of a flow-rate parameter in `direction` (zero if unseeded).
    pub fn flow_rate_seed(&self, id: &ParameterId, direction: usize) -> Option<f64> {
        let ParameterId::FlowRate { source, destination, switch } = id else {
            return None;
        };
        let src = self.unit_position(*source)?;
        let dst = self.unit_position(*destination)?;
        let switch = self.network.as_ref()?.switch(*switch)?;
        let row = switch.owner_row(src, dst)?;
        Some(ad_value(&switch.connections[row].flow_rate, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_id_display() {
        let id = ParameterId::flow_rate(UnitId(0), UnitId(2), 1);
        assert_eq!(id.to_string(), "CONNECTION[0 -> 2, switch 1]");
        let id = ParameterId::unit_component(UnitId(3), "EQUILIBRIUM", 0);
        assert_eq!(id.to_string(), "unit 3 EQUILIBRIUM[0]");
        let id = ParameterId::unit_section(UnitId(0), "LIN_COEFF", 1, 2);
        assert_eq!(id.to_string(), "unit 0 LIN_COEFF[1] in section 2");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = SensitivityRegistry::default();
        let id = ParameterId::unit(UnitId(1), "VOLUME");
        assert!(!registry.contains(&id));
        registry.entries.push(SensitiveParameter { id: id.clone(), direction: 0, seed: 1.0 });
        registry.width = 1;
        assert!(registry.contains(&id));
        assert_eq!(registry.width(), 1);
        assert_eq!(registry.entries().len(), 1);
    }

    fn tank_chain() -> ModelSystem {
        use crate::models::{Inlet, Outlet, StirredTank};
        use crate::network::{ConnectionRow, SwitchSpec};
        use crate::solvers::SchurSolverConfig;

        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0]))).unwrap();
        system.add_unit(Box::new(StirredTank::new(UnitId(1), 1, 2.0))).unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(2), 1))).unwrap();
        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(1), 0.5),
            ConnectionRow::new(UnitId(1), UnitId(2), 0.5),
        ]);
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
        system
    }

    #[test]
    fn test_flow_rate_seeds_and_clear() {
        let mut system = tank_chain();
        let rate = ParameterId::flow_rate(UnitId(0), UnitId(1), 0);
        assert!(system.has_parameter(&rate));
        assert!(!system.has_parameter(&ParameterId::flow_rate(UnitId(0), UnitId(2), 0)));

        assert!(system.set_sensitive_parameter(&rate, 1, 1.0));
        assert!(system.set_sensitive_parameter(&ParameterId::unit(UnitId(1), "VOLUME"), 0, 1.0));
        assert_eq!(system.sensitive_parameters().width(), 2);
        assert_eq!(system.flow_rate_seed(&rate, 1), Some(1.0));
        assert_eq!(system.flow_rate_seed(&rate, 0), Some(0.0));

        // Value changes of registered parameters keep the seed
        system.set_sensitive_parameter_value(&rate, 0.75);
        assert_eq!(system.flow_rate_seed(&rate, 1), Some(1.0));
        assert!(system.all_parameter_values().contains(&(rate.clone(), 0.75)));

        system.clear_sens_params();
        assert_eq!(system.sensitive_parameters().entries().len(), 0);
        assert_eq!(system.flow_rate_seed(&rate, 1), Some(0.0));
    }

    #[test]
    fn test_unit_sensitivities_survive_reconfiguration() {
        use crate::network::{ConnectionRow, SwitchSpec};
        use crate::unit::SimulationTime;

        let mut system = tank_chain();
        let volume = ParameterId::unit(UnitId(1), "VOLUME");
        let old_rate = ParameterId::flow_rate(UnitId(0), UnitId(1), 0);
        assert!(system.set_sensitive_parameter(&volume, 1, 1.0));
        assert!(system.set_sensitive_parameter(&old_rate, 2, 1.0));
        assert_eq!(system.sensitive_parameters().width(), 3);

        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(1), 0.25),
            ConnectionRow::new(UnitId(1), UnitId(2), 0.25),
        ]);
        system.reconfigure_switches(vec![switch]).unwrap();

        // The flow rate belonged to the replaced switch
        assert_eq!(system.sensitive_parameters().entries().len(), 1);
        assert_eq!(system.sensitive_parameters().width(), 2);
        assert_eq!(system.flow_rate_seed(&old_rate, 2), Some(0.0));

        let rate = ParameterId::flow_rate(UnitId(0), UnitId(1), 0);
        assert!(system.set_sensitive_parameter(&rate, 0, 1.0));
        assert_eq!(system.sensitive_parameters().width(), 2);

        let n = system.num_dofs();
        let y = vec![0.5; n];
        let y_dot = vec![0.1; n];
        let mut ad_res = system.new_ad_residual();
        let status = system.d_res_dp_fwd_with_jacobian(SimulationTime::new(0.0, 0), &y, Some(&y_dot), &mut ad_res);
        assert_eq!(status, 0);

        // Tank liquid row: tf V dc/dt - F_in c_in + F_out c
        let row = system.layout().unit_range(1).start + 1;
        assert!((ad_value(&ad_res[row], 1) - 0.1).abs() < 1e-12);
        assert!((ad_value(&ad_res[row], 0) + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_configure_drops_removed_units_from_registry() {
        use crate::models::StirredTank;
        use crate::network::{ConnectionRow, SwitchSpec};
        use crate::solvers::SchurSolverConfig;

        let mut system = tank_chain();
        assert!(system.set_sensitive_parameter(&ParameterId::unit(UnitId(1), "VOLUME"), 0, 1.0));
        system.remove_unit(UnitId(1)).unwrap();
        system.add_unit(Box::new(StirredTank::new(UnitId(3), 1, 1.0))).unwrap();

        let switch = SwitchSpec::new(0).with_connections([
            ConnectionRow::new(UnitId(0), UnitId(3), 0.5),
            ConnectionRow::new(UnitId(3), UnitId(2), 0.5),
        ]);
        system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
        assert!(system.sensitive_parameters().entries().is_empty());
        assert_eq!(system.sensitive_parameters().width(), 0);
    }

    #[test]
    fn test_unknown_parameters() {
        let mut system = tank_chain();
        assert!(!system.set_parameter(&ParameterId::flow_rate(UnitId(2), UnitId(0), 0), 1.0));
        assert!(!system.set_parameter(&ParameterId::unit(UnitId(9), "VOLUME"), 1.0));
        assert!(!system.set_sensitive_parameter(&ParameterId::unit(UnitId(2), "VOLUME"), 0, 1.0));
        assert!(system.set_parameter(&ParameterId::unit(UnitId(1), "VOLUME"), 3.0));
        assert_eq!(system.sensitive_parameters().width(), 0);
    }
}
