//! Configuration errors raised while assembling a unit operation network.
//!
//! Runtime numerical difficulties are not errors in this sense; they are
//! reported as fused integer status codes (see [`crate::parallel`]).

use std::fmt;

use crate::unit::UnitId;

/// Result type for configuration operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Side of a connection row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The unit operation the flow leaves
    Source,
    /// The unit operation the flow enters
    Destination,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Source => write!(f, "source"),
            Endpoint::Destination => write!(f, "destination"),
        }
    }
}

/// Errors that abort network configuration.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Two unit operations share the same id
    #[error("Unit operation id {0} is already registered")]
    DuplicateUnit(UnitId),
    /// No unit operation with this id exists
    #[error("Unit operation id {0} is not registered")]
    UnknownUnit(UnitId),
    /// A connection row references an id that is negative or not registered
    #[error("Switch {switch}, row {row}: {endpoint} unit operation id {id} not found")]
    UnknownConnectionUnit { switch: usize, row: usize, endpoint: Endpoint, id: i64 },
    /// The source unit of a connection has no outlet
    #[error("Switch {switch}, row {row}: source unit operation {unit} does not have an outlet")]
    MissingOutlet { switch: usize, row: usize, unit: UnitId },
    /// The destination unit of a connection has no inlet
    #[error("Switch {switch}, row {row}: destination unit operation {unit} does not have an inlet")]
    MissingInlet { switch: usize, row: usize, unit: UnitId },
    /// Component index exceeds the number of components of the unit
    #[error(
        "Switch {switch}, row {row}: {endpoint} component index {component} exceeds number of components {count} of unit operation {unit}"
    )]
    ComponentOutOfRange {
        switch: usize,
        row: usize,
        endpoint: Endpoint,
        unit: UnitId,
        component: usize,
        count: usize,
    },
    /// Only one side of a connection selects all components
    #[error(
        "Switch {switch}, row {row}: only one side connects all components in connection from unit {upstream} to {downstream}"
    )]
    OneSidedWildcard { switch: usize, row: usize, upstream: UnitId, downstream: UnitId },
    /// All-component connection between units with different component counts
    #[error(
        "Switch {switch}, row {row}: number of components not equal when connecting all components from unit {upstream} ({upstream_count}) to {downstream} ({downstream_count})"
    )]
    WildcardComponentMismatch {
        switch: usize,
        row: usize,
        upstream: UnitId,
        downstream: UnitId,
        upstream_count: usize,
        downstream_count: usize,
    },
    /// Total inflow and outflow of a unit differ
    #[error("Switch {switch}: flow rate balance is not closed for unit operation {unit}, imbalanced by {imbalance:e}")]
    UnbalancedFlow { switch: usize, unit: UnitId, imbalance: f64 },
    /// Section indices of consecutive switches do not increase
    #[error("Switch {switch}: SECTION index {section} has to be greater than previous index {previous}")]
    NonIncreasingSection { switch: usize, section: usize, previous: usize },
    /// The first switch does not start at section 0
    #[error("First SECTION index has to be 0, got {0}")]
    FirstSectionNotZero(usize),
    /// Connection matrix is not a 5 column matrix of integral ids and indices
    #[error("Switch {switch}: malformed CONNECTIONS matrix, {reason}")]
    MalformedConnections { switch: usize, reason: String },
    /// No switch was configured
    #[error("At least one valve switch is required")]
    NoSwitches,
    /// A required configuration entry is absent
    #[error("Missing configuration entry: {0}")]
    MissingField(String),
    /// A configuration entry has an unusable value
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    /// The unit list changed after the last call to configure
    #[error("Model system is not configured for the current unit list")]
    NotConfigured,
    /// Configuration document could not be decoded
    #[error("Failed to decode configuration: {0}")]
    Json(#[from] serde_json::Error),
}
