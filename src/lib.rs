//! # Nomata Network: Coupling Unit Operations into One DAE
//!
//! A coupling layer that assembles a network of independently discretized
//! unit operations (inlets, tanks, columns, outlets, ...) into a single
//! differential-algebraic system `F(t, y, ẏ, p) = 0`.
//!
//! Every unit owns a contiguous block of the global state vector. A block
//! of coupling DOFs at the end holds the mixed inlet concentrations of all
//! units with an inlet. The network (which outlet feeds which inlet, at
//! what flow rate) may change at section boundaries ("switches").
//!
//! The layer provides:
//!
//! - Global residual assembly with the coupling equations ([`residual`])
//! - Linear solves by block elimination and a Schur complement GMRES
//!   ([`solvers`])
//! - Consistent initialization in full and lean fidelity ([`init`])
//! - Forward parameter sensitivities with dual numbers ([`sensitivity`])
//! - Network switching and flow-rate parameters ([`network`], [`parameters`])
//!
//! ## Example
//!
//! ```
//! use nomata_network::models::{Inlet, Outlet, StirredTank};
//! use nomata_network::network::{ConnectionRow, SwitchSpec};
//! use nomata_network::solvers::SchurSolverConfig;
//! use nomata_network::system::ModelSystem;
//! use nomata_network::unit::{Fidelity, SimulationTime, UnitId};
//!
//! let mut system = ModelSystem::new();
//! system.add_unit(Box::new(Inlet::new(UnitId(0), vec![1.0]))).unwrap();
//! system.add_unit(Box::new(StirredTank::new(UnitId(1), 1, 2.0))).unwrap();
//! system.add_unit(Box::new(Outlet::new(UnitId(2), 1))).unwrap();
//!
//! let switch = SwitchSpec::new(0).with_connections([
//!     ConnectionRow::new(UnitId(0), UnitId(1), 1.0),
//!     ConnectionRow::new(UnitId(1), UnitId(2), 1.0),
//! ]);
//! system.configure(vec![switch], SchurSolverConfig::default()).unwrap();
//!
//! let n = system.num_dofs();
//! let (mut y, mut y_dot) = (vec![0.0; n], vec![0.0; n]);
//! let time = SimulationTime::new(0.0, 0);
//! let status = system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, Fidelity::Full);
//! assert_eq!(status, 0);
//! assert!(system.residual_norm(time, &y, Some(&y_dot)) < 1e-12);
//! ```
//!
//! ## Status Codes
//!
//! Runtime calls return a [`StatusCode`](parallel::StatusCode): `0` is
//! success, positive codes are recoverable (the caller may retry with a
//! smaller step) and negative codes are fatal. Configuration problems are
//! reported as [`NetworkError`].
//!
//! ## Optional Features
//!
//! - **`parallel`** (default): per-unit phases run on the `rayon` thread pool
//!
//! Disable it for a purely sequential build:
//! ```toml
//! [dependencies]
//! nomata-network = { version = "0.1", default-features = false }
//! ```

pub mod autodiff;
pub mod config;
pub mod coupling;
pub mod error;
pub mod external;
pub mod init;
pub mod layout;
pub mod models;
pub mod network;
pub mod parallel;
pub mod parameters;
pub mod recorder;
pub mod residual;
pub mod sensitivity;
pub mod solvers;
pub mod system;
pub mod unit;

pub use config::ModelSystemConfig;
pub use error::{NetworkError, NetworkResult};
pub use parameters::ParameterId;
pub use system::ModelSystem;
pub use unit::{Fidelity, SimulationTime, UnitId, UnitOperation};
