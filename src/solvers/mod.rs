//! Numerical solvers of the coupling layer.
//!
//! The global Jacobian of a unit network has arrow structure: one diagonal
//! block per unit operation, sparse inbound/outbound blocks linking units to
//! the coupling DOFs and an identity block for the coupling equations.
//!
//! ```text
//! | J_0                 N_0 |   | x_0 |   | b_0 |
//! |      J_1            N_1 |   | x_1 |   | b_1 |
//! |           ...       ... | * | ... | = | ... |
//! |                J_n  N_n |   | x_n |   | b_n |
//! | F_0  F_1  ...  F_n   I  |   | x_c |   | b_c |
//! ```
//!
//! Linear systems are solved by block elimination. The diagonal blocks are
//! delegated to the unit operations; the reduced system over the coupling
//! DOFs (the Schur complement `S = I - sum F_i J_i^-1 N_i`) is solved with
//! restarted GMRES without ever forming `S`.
//!
//! # Submodules
//!
//! - [`gmres`]: Matrix-free restarted GMRES with Givens rotations
//! - [`schur`]: Block elimination and the Schur complement product

pub mod gmres;
pub mod schur;

use crate::error::{NetworkError, NetworkResult};
use crate::parallel::StatusCode;

pub use gmres::{Gmres, GmresStats};

/// Errors of the Krylov solver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GmresError {
    /// Residual still above tolerance after all restarts
    #[error("GMRES did not converge after {iterations} iterations (residual {residual:e})")]
    NotConverged { iterations: usize, residual: f64 },
    /// Singular Hessenberg system, the Krylov space degenerated
    #[error("GMRES breakdown in iteration {0}")]
    Breakdown(usize),
    /// The matrix-vector product reported a failure
    #[error("Matrix-vector product failed with status {0}")]
    MatrixVector(StatusCode),
}

impl GmresError {
    /// Status code of the failure: non-convergence is recoverable, a
    /// breakdown is not, product failures keep their own code.
    pub fn status(&self) -> StatusCode {
        match self {
            GmresError::NotConverged { .. } => 1,
            GmresError::Breakdown(_) => -1,
            GmresError::MatrixVector(code) => *code,
        }
    }
}

/// Orthogonalization scheme of the Arnoldi process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orthogonalization {
    /// Modified Gram-Schmidt (`GS_TYPE = 1`)
    #[default]
    Modified,
    /// Classical Gram-Schmidt (`GS_TYPE = 2`)
    Classical,
}

impl Orthogonalization {
    /// Decodes the `GS_TYPE` configuration value.
    pub fn from_gs_type(gs_type: i64) -> NetworkResult<Self> {
        match gs_type {
            1 => Ok(Orthogonalization::Modified),
            2 => Ok(Orthogonalization::Classical),
            other => Err(NetworkError::InvalidValue {
                field: "GS_TYPE".to_string(),
                reason: format!("expected 1 (modified) or 2 (classical), got {}", other),
            }),
        }
    }
}

/// Settings of the Schur complement solver.
#[derive(Debug, Clone, PartialEq)]
pub struct SchurSolverConfig {
    /// Krylov subspace dimension, 0 = number of coupling DOFs
    pub max_krylov: usize,
    pub orthogonalization: Orthogonalization,
    /// Number of GMRES restarts
    pub max_restarts: usize,
    /// Safety factor applied to the outer tolerance
    pub schur_safety: f64,
}

impl Default for SchurSolverConfig {
    fn default() -> Self {
        SchurSolverConfig {
            max_krylov: 0,
            orthogonalization: Orthogonalization::Modified,
            max_restarts: 10,
            schur_safety: 1e-8,
        }
    }
}

impl SchurSolverConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_krylov(mut self, max_krylov: usize) -> Self {
        self.max_krylov = max_krylov;
        self
    }

    pub fn with_orthogonalization(mut self, orthogonalization: Orthogonalization) -> Self {
        self.orthogonalization = orthogonalization;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_schur_safety(mut self, schur_safety: f64) -> Self {
        self.schur_safety = schur_safety;
        self
    }

    /// Krylov dimension for a system of `size` unknowns.
    pub fn krylov_dimension(&self, size: usize) -> usize {
        if self.max_krylov == 0 || self.max_krylov > size { size } else { self.max_krylov }
    }
}
