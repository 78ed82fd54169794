//! JSON configuration of a model system.
//!
//! The unit operations themselves are added in code; the configuration
//! holds the network switches, Schur solver settings, external function
//! sources and optional full-state initial values:
//!
//! ```json
//! {
//!   "connections": {
//!     "NSWITCHES": 1,
//!     "switch_000": { "SECTION": 0, "CONNECTIONS": [0, 1, -1, -1, 1.0] }
//!   },
//!   "solver": { "MAX_KRYLOV": 0, "GS_TYPE": 1, "MAX_RESTARTS": 10, "SCHUR_SAFETY": 1e-8 },
//!   "external": { "source_000": { "EXTFUN_TYPE": "LINEAR_INTERP" } },
//!   "INIT_STATE_Y": [1.0, 1.0, 1.0]
//! }
//! ```
//!
//! Each connection row has five columns: source unit, destination unit,
//! source component, destination component (`-1` for all) and flow rate.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NetworkError, NetworkResult};
use crate::external::ExternalFunction;
use crate::network::{SwitchSpec, parse_connection_matrix};
use crate::solvers::{Orthogonalization, SchurSolverConfig};
use crate::system::ModelSystem;

/// Top level configuration of a [`ModelSystem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSystemConfig {
    pub connections: ConnectionsConfig,
    pub solver: SolverSection,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external: Option<ExternalSection>,
    #[serde(rename = "INIT_STATE_Y", skip_serializing_if = "Option::is_none", default)]
    pub init_state_y: Option<Vec<f64>>,
    #[serde(rename = "INIT_STATE_YDOT", skip_serializing_if = "Option::is_none", default)]
    pub init_state_ydot: Option<Vec<f64>>,
}

/// Switch list, `switch_000` to `switch_{NSWITCHES - 1}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(rename = "NSWITCHES")]
    pub num_switches: usize,
    #[serde(flatten)]
    pub switches: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(rename = "SECTION")]
    pub section: usize,
    /// Flat row-major matrix with five columns per connection
    #[serde(rename = "CONNECTIONS")]
    pub connections: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSection {
    #[serde(rename = "MAX_KRYLOV")]
    pub max_krylov: usize,
    #[serde(rename = "GS_TYPE")]
    pub gs_type: i64,
    #[serde(rename = "MAX_RESTARTS")]
    pub max_restarts: usize,
    #[serde(rename = "SCHUR_SAFETY")]
    pub schur_safety: f64,
}

/// External function sources, `source_000`, `source_001`, ...
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExternalSection {
    #[serde(flatten)]
    pub sources: BTreeMap<String, Value>,
}

fn switch_key(index: usize) -> String {
    format!("switch_{:03}", index)
}

fn source_key(index: usize) -> String {
    format!("source_{:03}", index)
}

impl ModelSystemConfig {
    pub fn from_json(json: &str) -> NetworkResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decodes all switches in order.
    pub fn switch_specs(&self) -> NetworkResult<Vec<SwitchSpec>> {
        if self.connections.num_switches == 0 {
            return Err(NetworkError::NoSwitches);
        }

        (0..self.connections.num_switches)
            .map(|i| {
                let key = switch_key(i);
                let raw = self
                    .connections
                    .switches
                    .get(&key)
                    .ok_or_else(|| NetworkError::MissingField(format!("connections/{}", key)))?;
                let switch: SwitchConfig = serde_json::from_value(raw.clone())?;
                let rows = parse_connection_matrix(&switch.connections, i)?;
                Ok(SwitchSpec::new(switch.section).with_connections(rows))
            })
            .collect()
    }

    pub fn solver_config(&self) -> NetworkResult<SchurSolverConfig> {
        self.solver.to_config()
    }
}

impl SolverSection {
    pub fn to_config(&self) -> NetworkResult<SchurSolverConfig> {
        if self.schur_safety.is_nan() || self.schur_safety <= 0.0 {
            return Err(NetworkError::InvalidValue {
                field: "SCHUR_SAFETY".to_string(),
                reason: format!("must be positive, got {}", self.schur_safety),
            });
        }
        Ok(SchurSolverConfig::new()
            .with_max_krylov(self.max_krylov)
            .with_orthogonalization(Orthogonalization::from_gs_type(self.gs_type)?)
            .with_max_restarts(self.max_restarts)
            .with_schur_safety(self.schur_safety))
    }
}

impl ExternalSection {
    /// Creates and configures every source with `factory`.
    ///
    /// Failed sources leave an empty slot so that indices stay stable. The
    /// flag is `false` if any source failed.
    pub fn instantiate<F>(&self, factory: F) -> (Vec<Option<Arc<dyn ExternalFunction>>>, bool)
    where
        F: Fn(&str) -> Option<Arc<dyn ExternalFunction>>,
    {
        let mut functions = Vec::new();
        let mut success = true;

        while let Some(params) = self.sources.get(&source_key(functions.len())) {
            let index = functions.len();
            let Some(type_name) = params.get("EXTFUN_TYPE").and_then(Value::as_str) else {
                error!("External function source {} has no EXTFUN_TYPE", index);
                functions.push(None);
                success = false;
                continue;
            };
            let Some(function) = factory(type_name) else {
                error!("Unknown external function type {} for source {}", type_name, index);
                functions.push(None);
                success = false;
                continue;
            };
            if !function.configure(params) {
                error!("Failed to configure external function source {} ({})", index, type_name);
                functions.push(None);
                success = false;
                continue;
            }
            functions.push(Some(function));
        }

        (functions, success)
    }
}

impl ModelSystem {
    /// Configures the network for the units added so far.
    ///
    /// Returns `Ok(false)` if some external function source could not be
    /// created or configured; the network itself is usable in that case.
    pub fn configure_from<F>(&mut self, config: &ModelSystemConfig, factory: F) -> NetworkResult<bool>
    where
        F: Fn(&str) -> Option<Arc<dyn ExternalFunction>>,
    {
        let switches = config.switch_specs()?;
        let solver = config.solver_config()?;
        let (functions, success) = external_functions(config, factory);

        self.set_external_functions(functions);
        self.configure(switches, solver)?;
        Ok(success)
    }

    /// Re-reads switches, solver settings and external sources of an
    /// already configured system. The Krylov dimension is kept.
    pub fn reconfigure_from<F>(&mut self, config: &ModelSystemConfig, factory: F) -> NetworkResult<bool>
    where
        F: Fn(&str) -> Option<Arc<dyn ExternalFunction>>,
    {
        let switches = config.switch_specs()?;
        let solver = config.solver_config()?;
        self.reconfigure_switches(switches)?;
        self.set_solver_settings(solver);

        let (functions, success) = external_functions(config, factory);
        self.set_external_functions(functions);
        debug!("Reconfigured network with {} switches", config.connections.num_switches);
        Ok(success)
    }

    /// Writes initial values, preferring full-state values from `config`.
    ///
    /// `INIT_STATE_Y` is used if it covers all DOFs; unit defaults are
    /// skipped then and `INIT_STATE_YDOT` is copied if it covers all DOFs
    /// as well. Otherwise every unit writes its own defaults.
    pub fn apply_initial_condition_from(&self, config: &ModelSystemConfig, y: &mut [f64], y_dot: &mut [f64]) {
        let n = self.num_dofs();
        let covers = |values: &&Vec<f64>| values.len() >= n;

        let Some(init_y) = config.init_state_y.as_ref().filter(covers) else {
            self.apply_initial_condition(y, y_dot);
            return;
        };
        y[..n].copy_from_slice(&init_y[..n]);
        if let Some(init_y_dot) = config.init_state_ydot.as_ref().filter(covers) {
            y_dot[..n].copy_from_slice(&init_y_dot[..n]);
        }
    }
}

fn external_functions<F>(config: &ModelSystemConfig, factory: F) -> (Vec<Option<Arc<dyn ExternalFunction>>>, bool)
where
    F: Fn(&str) -> Option<Arc<dyn ExternalFunction>>,
{
    match &config.external {
        Some(section) => section.instantiate(factory),
        None => (Vec::new(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Inlet, Outlet, StirredTank};
    use crate::unit::UnitId;
    use std::sync::Mutex;

    struct ConstantFunction {
        value: Mutex<f64>,
    }

    impl ExternalFunction for ConstantFunction {
        fn type_name(&self) -> &str {
            "CONSTANT"
        }

        fn configure(&self, params: &Value) -> bool {
            let Some(value) = params.get("VALUE").and_then(Value::as_f64) else {
                return false;
            };
            match self.value.lock() {
                Ok(mut v) => {
                    *v = value;
                    true
                }
                Err(_) => false,
            }
        }
    }

    fn factory(type_name: &str) -> Option<Arc<dyn ExternalFunction>> {
        match type_name {
            "CONSTANT" => Some(Arc::new(ConstantFunction { value: Mutex::new(0.0) })),
            _ => None,
        }
    }

    const CHAIN: &str = r#"{
        "connections": {
            "NSWITCHES": 2,
            "switch_000": { "SECTION": 0, "CONNECTIONS": [0, 1, -1, -1, 1.0, 1, 2, -1, -1, 1.0] },
            "switch_001": { "SECTION": 1, "CONNECTIONS": [0, 1, -1, -1, 2.0, 1, 2, -1, -1, 2.0] }
        },
        "solver": { "MAX_KRYLOV": 0, "GS_TYPE": 2, "MAX_RESTARTS": 5, "SCHUR_SAFETY": 1e-6 }
    }"#;

    fn chain() -> ModelSystem {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0]))).unwrap();
        system.add_unit(Box::new(StirredTank::new(UnitId(1), 1, 2.0))).unwrap();
        system.add_unit(Box::new(Outlet::new(UnitId(2), 1))).unwrap();
        system
    }

    #[test]
    fn test_configure_from_json() {
        let config = ModelSystemConfig::from_json(CHAIN).unwrap();
        let mut system = chain();
        assert!(system.configure_from(&config, factory).unwrap());

        assert_eq!(system.num_dofs(), 1 + 3 + 1 + 2);
        assert_eq!(system.network().unwrap().num_switches(), 2);
        assert_eq!(system.solver_config().orthogonalization, Orthogonalization::Classical);
        assert_eq!(system.solver_config().max_restarts, 5);
    }

    #[test]
    fn test_missing_switch_entry() {
        let mut config = ModelSystemConfig::from_json(CHAIN).unwrap();
        config.connections.switches.remove("switch_001");
        let err = config.switch_specs().unwrap_err();
        assert!(matches!(err, NetworkError::MissingField(ref f) if f == "connections/switch_001"));

        config.connections.num_switches = 0;
        assert!(matches!(config.switch_specs().unwrap_err(), NetworkError::NoSwitches));
    }

    #[test]
    fn test_invalid_solver_settings() {
        let mut config = ModelSystemConfig::from_json(CHAIN).unwrap();
        config.solver.gs_type = 3;
        assert!(matches!(config.solver_config().unwrap_err(), NetworkError::InvalidValue { .. }));

        config.solver.gs_type = 1;
        config.solver.schur_safety = 0.0;
        assert!(matches!(config.solver_config().unwrap_err(), NetworkError::InvalidValue { .. }));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(ModelSystemConfig::from_json("{ \"connections\": 1 }").unwrap_err(), NetworkError::Json(_)));
    }

    #[test]
    fn test_external_sources_partial_failure() {
        let mut config = ModelSystemConfig::from_json(CHAIN).unwrap();
        let mut sources = BTreeMap::new();
        sources.insert("source_000".to_string(), serde_json::json!({ "EXTFUN_TYPE": "CONSTANT", "VALUE": 2.0 }));
        sources.insert("source_001".to_string(), serde_json::json!({ "EXTFUN_TYPE": "SPLINE" }));
        sources.insert("source_002".to_string(), serde_json::json!({ "EXTFUN_TYPE": "CONSTANT" }));
        config.external = Some(ExternalSection { sources });

        let mut system = chain();
        assert!(!system.configure_from(&config, factory).unwrap());

        let functions = system.external_functions();
        assert_eq!(functions.len(), 3);
        assert!(functions[0].is_some());
        assert!(functions[1].is_none());
        assert!(functions[2].is_none());
    }

    #[test]
    fn test_reconfigure_keeps_units() {
        let config = ModelSystemConfig::from_json(CHAIN).unwrap();
        let mut system = chain();
        system.configure_from(&config, factory).unwrap();

        let mut changed = config.clone();
        changed.connections.num_switches = 1;
        changed.solver.gs_type = 1;
        changed.solver.max_krylov = 1;
        assert!(system.reconfigure_from(&changed, factory).unwrap());

        assert_eq!(system.num_units(), 3);
        assert_eq!(system.network().unwrap().num_switches(), 1);
        assert_eq!(system.solver_config().orthogonalization, Orthogonalization::Modified);
        assert_eq!(system.solver_config().max_krylov, 0);
    }

    #[test]
    fn test_initial_state_overrides() {
        let mut config = ModelSystemConfig::from_json(CHAIN).unwrap();
        let mut system = chain();
        system.configure_from(&config, factory).unwrap();
        let n = system.num_dofs();

        // Too short: unit defaults
        config.init_state_y = Some(vec![9.0; n - 1]);
        let mut y = vec![5.0; n];
        let mut y_dot = vec![5.0; n];
        system.apply_initial_condition_from(&config, &mut y, &mut y_dot);
        assert_eq!(y[0], 1.0);

        config.init_state_y = Some((0..n).map(|i| i as f64).collect());
        config.init_state_ydot = Some(vec![0.5; n]);
        system.apply_initial_condition_from(&config, &mut y, &mut y_dot);
        assert_eq!(y[n - 1], (n - 1) as f64);
        assert!(y_dot.iter().all(|&v| v == 0.5));
    }
}
