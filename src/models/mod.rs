//! Unit operation models that can be placed in a [`ModelSystem`](crate::system::ModelSystem).
//!
//! - **Inlet**: piecewise linear feed profile (source only)
//! - **StirredTank**: stirred tank with linear binding and first order decay
//! - **Outlet**: product sink that mirrors its inlet
//!
//! ## Example
//!
//! ```
//! use nomata_network::models::{Inlet, Outlet, StirredTank};
//! use nomata_network::network::{ConnectionRow, SwitchSpec};
//! use nomata_network::solvers::SchurSolverConfig;
//! use nomata_network::system::ModelSystem;
//! use nomata_network::unit::UnitId;
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
//! assert_eq!(system.num_dofs(), 1 + 3 + 1 + 2);
//! ```
//!
//! # Creating a New Model
//!
//! Implement [`UnitOperation`](crate::unit::UnitOperation). The residual
//! is best written once, generic over
//! [`CouplingScalar`](crate::autodiff::CouplingScalar), and called from
//! both the plain and the AD entry points.

pub mod cstr;
pub mod inlet;
pub mod outlet;

pub use cstr::StirredTank;
pub use inlet::{Inlet, InletSection};
pub use outlet::Outlet;
