//! Off-diagonal blocks of the global Jacobian.
//!
//! For every unit `i` the network keeps two sparse blocks:
//!
//! - `inbound[i]` (coupling -> unit): a `-1` at `(inlet row of comp, coupling
//!   index of comp)`. Fixed by the layout, independent of the topology.
//! - `outbound[i]` (unit -> coupling): `-rate / total inflow of destination`
//!   at `(coupling index of the destination comp, outlet column of the
//!   source comp)`. Rebuilt on every switch change.
//!
//! The outbound blocks carry flow-rate derivatives; a plain copy is kept for
//! residual and linear-solve paths that do not need them.

pub mod matrix;

use log::debug;

use crate::autodiff::{Active, CouplingScalar, active};
use crate::layout::CouplingIndexMap;
use crate::network::{ComponentSelector, Network, Switch};
use crate::unit::UnitShape;

pub use matrix::{Entry, SparseCoupling};

/// Inbound and outbound coupling blocks of all units.
#[derive(Debug, Clone, Default)]
pub struct CouplingMatrices {
    pub inbound: Vec<SparseCoupling<f64>>,
    pub outbound: Vec<SparseCoupling<Active>>,
    pub outbound_plain: Vec<SparseCoupling<f64>>,
    /// Total inflow of every unit in the assembled switch
    pub total_inflow: Vec<Active>,
}

impl CouplingMatrices {
    /// Reserves the worst-case number of entries over all switches.
    pub fn allocate(shapes: &[UnitShape], network: &Network) -> Self {
        let n = shapes.len();
        let mut matrices = CouplingMatrices {
            inbound: Vec::with_capacity(n),
            outbound: Vec::with_capacity(n),
            outbound_plain: Vec::with_capacity(n),
            total_inflow: vec![active(0.0); n],
        };
        for (i, shape) in shapes.iter().enumerate() {
            let inbound = if shape.has_inlet() { shape.components } else { 0 };
            let outbound = network.max_fan_out(i);
            matrices.inbound.push(SparseCoupling::with_capacity(inbound));
            matrices.outbound.push(SparseCoupling::with_capacity(outbound));
            matrices.outbound_plain.push(SparseCoupling::with_capacity(outbound));
        }
        matrices
    }

    /// Rebuilds all blocks for `switch`.
    pub fn assemble(&mut self, shapes: &[UnitShape], map: &CouplingIndexMap, switch: &Switch) {
        for (inbound, outbound) in self.inbound.iter_mut().zip(self.outbound.iter_mut()) {
            inbound.clear();
            outbound.clear();
        }

        for (i, shape) in shapes.iter().enumerate() {
            let (Some(inlet), Some(range)) = (shape.inlet, map.range(i)) else {
                continue;
            };
            for (comp, coupling) in range.enumerate() {
                self.inbound[i].add_element(inlet.position(comp), coupling, -1.0);
            }
        }

        let (inflow, _) = switch.flow_totals(shapes.len());
        self.total_inflow = inflow;

        for (row, conn) in switch.connections.iter().enumerate() {
            let Some(outlet) = shapes[conn.source].outlet else {
                continue;
            };
            let total = &self.total_inflow[conn.destination];
            if total.re == 0.0 {
                // Closed connection, the destination sees no contribution
                continue;
            }
            let weight = -(switch.rate(row).clone() / total.clone());

            match (conn.source_component, conn.destination_component) {
                (ComponentSelector::Component(src), ComponentSelector::Component(dst)) => {
                    if let Some(coupling) = map.index(conn.destination, dst) {
                        self.outbound[conn.source].add_element(coupling, outlet.position(src), weight);
                    }
                }
                _ => {
                    for comp in 0..shapes[conn.source].components {
                        if let Some(coupling) = map.index(conn.destination, comp) {
                            self.outbound[conn.source].add_element(coupling, outlet.position(comp), weight.clone());
                        }
                    }
                }
            }
        }

        for (plain, outbound) in self.outbound_plain.iter_mut().zip(&self.outbound) {
            plain.copy_from(outbound);
        }

        debug!(
            "Assembled coupling matrices: {} outbound entries",
            self.outbound.iter().map(SparseCoupling::len).sum::<usize>()
        );
    }
}

/// Selects the outbound block matching the residual scalar.
///
/// Plain residuals use the stripped copy; active residuals use the blocks
/// carrying flow-rate derivatives.
pub trait OutboundSelect: CouplingScalar {
    fn outbound(matrices: &CouplingMatrices, unit: usize) -> &SparseCoupling<Self>;
}

impl OutboundSelect for f64 {
    fn outbound(matrices: &CouplingMatrices, unit: usize) -> &SparseCoupling<f64> {
        &matrices.outbound_plain[unit]
    }
}

impl OutboundSelect for Active {
    fn outbound(matrices: &CouplingMatrices, unit: usize) -> &SparseCoupling<Active> {
        &matrices.outbound[unit]
    }
}
