//! Network topology: valve switches and their connection tables.
//!
//! A network holds an ordered list of switches. Each switch becomes active
//! at the start of a time section and stays active until the next switch.
//! Connections are validated against the registered unit shapes when the
//! network is configured; after that only flow-rate values may change.
//!
//! # Example
//!
//! ```
//! use nomata_network::network::{ConnectionRow, Network, SwitchSpec};
//! use nomata_network::unit::{UnitId, UnitShape};
//!
//! let shapes = vec![
//!     UnitShape::new(UnitId(0), 1, 1).with_outlet(0, 1),
//!     UnitShape::new(UnitId(1), 1, 1).with_inlet(0, 1),
//! ];
//! let spec = SwitchSpec::new(0).with_connection(ConnectionRow::new(UnitId(0), UnitId(1), 1.0));
//! let network = Network::configure(&[spec], &shapes).unwrap();
//! assert_eq!(network.num_switches(), 1);
//! ```

pub mod balance;
pub mod connection;

use log::debug;

use crate::autodiff::{Active, active};
use crate::error::{NetworkError, NetworkResult};
use crate::unit::UnitShape;

pub use balance::{FLOW_BALANCE_TOLERANCE, is_unbalanced};
pub use connection::{ComponentSelector, Connection, ConnectionRow, parse_connection_matrix};

/// User description of one switch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SwitchSpec {
    /// Section in which the switch becomes active
    pub section: usize,
    pub connections: Vec<ConnectionRow>,
}

impl SwitchSpec {
    pub fn new(section: usize) -> Self {
        SwitchSpec { section, connections: Vec::new() }
    }

    pub fn with_connection(mut self, row: ConnectionRow) -> Self {
        self.connections.push(row);
        self
    }

    pub fn with_connections(mut self, rows: impl IntoIterator<Item = ConnectionRow>) -> Self {
        self.connections.extend(rows);
        self
    }
}

/// A validated switch.
#[derive(Debug, Clone)]
pub struct Switch {
    pub section: usize,
    pub connections: Vec<Connection>,
}

impl Switch {
    /// Flow rate used for `row` (the rate owned by the first row of the
    /// same unit pair).
    pub fn rate(&self, row: usize) -> &Active {
        &self.connections[self.connections[row].owner].flow_rate
    }

    /// Row owning the flow rate of `source -> destination`.
    pub fn owner_row(&self, source: usize, destination: usize) -> Option<usize> {
        self.connections.iter().position(|c| c.source == source && c.destination == destination)
    }

    /// Total inflow and outflow of every unit as active values.
    pub fn flow_totals(&self, num_units: usize) -> (Vec<Active>, Vec<Active>) {
        let mut inflow = vec![active(0.0); num_units];
        let mut outflow = vec![active(0.0); num_units];
        for (row, conn) in self.connections.iter().enumerate() {
            if !conn.is_owner(row) {
                continue;
            }
            inflow[conn.destination] += conn.flow_rate.clone();
            outflow[conn.source] += conn.flow_rate.clone();
        }
        (inflow, outflow)
    }
}

/// Ordered switches and the index of the active one.
#[derive(Debug, Clone)]
pub struct Network {
    switches: Vec<Switch>,
    active: usize,
    /// Largest number of outbound coupling entries per unit over all switches
    fan_out: Vec<usize>,
}

impl Network {
    /// Validates `specs` against the unit shapes.
    pub fn configure(specs: &[SwitchSpec], shapes: &[UnitShape]) -> NetworkResult<Self> {
        let Some(first) = specs.first() else {
            return Err(NetworkError::NoSwitches);
        };

        let mut switches = Vec::with_capacity(specs.len());
        let mut fan_out = vec![0; shapes.len()];
        for (idx, spec) in specs.iter().enumerate() {
            if idx > 0 && spec.section <= specs[idx - 1].section {
                return Err(NetworkError::NonIncreasingSection {
                    switch: idx,
                    section: spec.section,
                    previous: specs[idx - 1].section,
                });
            }

            let connections = connection::validate_rows(&spec.connections, shapes, idx)?;
            balance::check_balance(&connections, shapes, idx)?;

            let mut local = vec![0; shapes.len()];
            for conn in &connections {
                local[conn.source] += conn.fan_out(shapes);
            }
            for (max, n) in fan_out.iter_mut().zip(local) {
                *max = (*max).max(n);
            }

            debug!("Switch {} (section {}): {} connections", idx, spec.section, connections.len());
            switches.push(Switch { section: spec.section, connections });
        }

        if first.section != 0 {
            return Err(NetworkError::FirstSectionNotZero(first.section));
        }

        Ok(Network { switches, active: 0, fan_out })
    }

    pub fn num_switches(&self) -> usize {
        self.switches.len()
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    pub fn switch(&self, idx: usize) -> Option<&Switch> {
        self.switches.get(idx)
    }

    pub(crate) fn switch_mut(&mut self, idx: usize) -> Option<&mut Switch> {
        self.switches.get_mut(idx)
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active(&self) -> &Switch {
        &self.switches[self.active]
    }

    /// Worst-case number of outbound coupling entries of unit `index`.
    pub fn max_fan_out(&self, index: usize) -> usize {
        self.fan_out.get(index).copied().unwrap_or(0)
    }

    /// Moves to the switch valid in `section`; returns `true` on change.
    ///
    /// Section 0 resets to the first switch. Section indices wrap modulo the
    /// number of switches so that a periodic schedule cycles back from the
    /// last switch to the first one.
    pub fn advance(&mut self, section: usize) -> bool {
        let prev = self.active;
        if section == 0 {
            self.active = 0;
        }

        let n = self.switches.len();
        let wrap = section % n;

        if self.active + 1 < n && self.switches[self.active + 1].section <= wrap {
            self.active += 1;
        } else if self.active + 1 == n && self.switches[0].section == wrap {
            self.active = 0;
        }

        debug!("Switching from configuration {} to {} (section {}, wrapped {})", prev, self.active, section, wrap);
        prev != self.active
    }
}
