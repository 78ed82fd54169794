//! External (time or space varying) driving functions.
//!
//! The network owns the registry and forwards it to every unit operation;
//! evaluating a function is entirely up to the units that use it.

use serde_json::Value;

/// A configurable external function source.
///
/// Sources are shared between the network and its units, so configuration
/// goes through `&self`; implementations keep mutable state behind a lock.
pub trait ExternalFunction: Send + Sync {
    /// Type tag matching `EXTFUN_TYPE` in the configuration.
    fn type_name(&self) -> &str;

    /// Reads the source settings. Returns `false` if they are unusable.
    fn configure(&self, params: &Value) -> bool;

    fn set_section_times(&self, _times: &[f64], _continuity: &[bool]) {}
}
