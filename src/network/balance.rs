//! Volumetric flow balance of a switch.

use crate::error::{NetworkError, NetworkResult};
use crate::unit::UnitShape;

use super::connection::Connection;

/// Imbalance (absolute, or relative to the outflow) at which a unit counts
/// as unbalanced.
pub const FLOW_BALANCE_TOLERANCE: f64 = 1e-15;

/// Returns `true` if `inflow` and `outflow` differ by at least the tolerance.
///
/// The difference is compared both absolutely and relative to `|outflow|`;
/// reaching either threshold is an imbalance. An exact match is balanced
/// even when `outflow` is zero.
pub fn is_unbalanced(inflow: f64, outflow: f64) -> bool {
    let diff = (inflow - outflow).abs();
    diff > 0.0 && (diff >= FLOW_BALANCE_TOLERANCE || diff >= FLOW_BALANCE_TOLERANCE * outflow.abs())
}

/// Total inflow and outflow per unit, counting every unit pair once with
/// the flow rate of its first row.
pub(crate) fn flow_totals(connections: &[Connection], num_units: usize) -> (Vec<f64>, Vec<f64>) {
    let mut inflow = vec![0.0; num_units];
    let mut outflow = vec![0.0; num_units];
    for (row, conn) in connections.iter().enumerate() {
        if !conn.is_owner(row) {
            continue;
        }
        let rate = conn.flow_rate.re;
        inflow[conn.destination] += rate;
        outflow[conn.source] += rate;
    }
    (inflow, outflow)
}

/// Checks every unit that has to conserve volume.
///
/// Exempt are units with a single port, units that may accumulate and
/// units without an outgoing connection in this switch.
pub(crate) fn check_balance(connections: &[Connection], shapes: &[UnitShape], switch: usize) -> NetworkResult<()> {
    let (inflow, outflow) = flow_totals(connections, shapes.len());

    for (i, shape) in shapes.iter().enumerate() {
        if !shape.has_inlet() || !shape.has_outlet() || shape.can_accumulate {
            continue;
        }
        let terminal = !connections.iter().any(|c| c.source == i);
        if terminal {
            continue;
        }
        if is_unbalanced(inflow[i], outflow[i]) {
            return Err(NetworkError::UnbalancedFlow {
                switch,
                unit: shape.id,
                imbalance: (inflow[i] - outflow[i]).abs(),
            });
        }
    }
    Ok(())
}
