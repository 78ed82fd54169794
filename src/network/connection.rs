//! Connection rows and their validation against the registered units.

use crate::autodiff::{Active, active};
use crate::error::{Endpoint, NetworkError, NetworkResult};
use crate::unit::{UnitId, UnitShape};

/// Component selection on one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentSelector {
    /// A single component index
    Component(usize),
    /// All components, mapped one to one
    All,
}

impl ComponentSelector {
    /// Decodes the `-1 = all components` convention of connection matrices.
    pub fn from_raw(raw: i64) -> Self {
        if raw < 0 { ComponentSelector::All } else { ComponentSelector::Component(raw as usize) }
    }
}

/// One connection as given by the user, addressed by unit ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRow {
    pub source: UnitId,
    pub destination: UnitId,
    pub source_component: ComponentSelector,
    pub destination_component: ComponentSelector,
    /// Volumetric flow rate
    pub flow_rate: f64,
}

impl ConnectionRow {
    /// Connects all components of `source` to `destination`.
    pub fn new(source: UnitId, destination: UnitId, flow_rate: f64) -> Self {
        ConnectionRow {
            source,
            destination,
            source_component: ComponentSelector::All,
            destination_component: ComponentSelector::All,
            flow_rate,
        }
    }

    /// Restricts the connection to a single component pair.
    pub fn with_components(mut self, source: usize, destination: usize) -> Self {
        self.source_component = ComponentSelector::Component(source);
        self.destination_component = ComponentSelector::Component(destination);
        self
    }
}

/// Parses a flat, row-major connection matrix with five columns
/// `[source, destination, source comp, destination comp, flow rate]`.
pub fn parse_connection_matrix(values: &[f64], switch: usize) -> NetworkResult<Vec<ConnectionRow>> {
    if values.len() % 5 != 0 {
        return Err(NetworkError::MalformedConnections {
            switch,
            reason: format!("has to have 5 columns ({} values given)", values.len()),
        });
    }

    values
        .chunks_exact(5)
        .enumerate()
        .map(|(row, c)| {
            let source = integral_entry(c[0], switch, row, 0)?;
            let destination = integral_entry(c[1], switch, row, 1)?;
            if source < 0 {
                return Err(NetworkError::UnknownConnectionUnit {
                    switch,
                    row,
                    endpoint: Endpoint::Source,
                    id: source,
                });
            }
            if destination < 0 {
                return Err(NetworkError::UnknownConnectionUnit {
                    switch,
                    row,
                    endpoint: Endpoint::Destination,
                    id: destination,
                });
            }
            Ok(ConnectionRow {
                source: UnitId(source as usize),
                destination: UnitId(destination as usize),
                source_component: ComponentSelector::from_raw(integral_entry(c[2], switch, row, 2)?),
                destination_component: ComponentSelector::from_raw(integral_entry(c[3], switch, row, 3)?),
                flow_rate: c[4],
            })
        })
        .collect()
}

/// Reads an id or component column, which must hold a whole number.
fn integral_entry(value: f64, switch: usize, row: usize, column: usize) -> NetworkResult<i64> {
    if value.is_finite() && value.fract() == 0.0 {
        Ok(value as i64)
    } else {
        Err(NetworkError::MalformedConnections {
            switch,
            reason: format!("row {}, column {}: {} is not an integer", row, column, value),
        })
    }
}

/// A validated connection, addressed by unit positions.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Position of the source unit
    pub source: usize,
    /// Position of the destination unit
    pub destination: usize,
    pub source_component: ComponentSelector,
    pub destination_component: ComponentSelector,
    pub flow_rate: Active,
    /// Row of the first connection with the same unit pair; that row owns
    /// the flow rate used for the whole pair
    pub owner: usize,
}

impl Connection {
    /// Whether this row owns the flow rate of its unit pair.
    pub fn is_owner(&self, row: usize) -> bool {
        self.owner == row
    }

    /// Number of component entries this row expands to.
    pub fn fan_out(&self, shapes: &[UnitShape]) -> usize {
        match self.source_component {
            ComponentSelector::All => shapes[self.source].components,
            ComponentSelector::Component(_) => 1,
        }
    }
}

/// Translates ids to positions and checks ports and component indices.
pub(crate) fn validate_rows(
    rows: &[ConnectionRow],
    shapes: &[UnitShape],
    switch: usize,
) -> NetworkResult<Vec<Connection>> {
    let position = |id: UnitId, row: usize, endpoint: Endpoint| {
        shapes.iter().position(|s| s.id == id).ok_or(NetworkError::UnknownConnectionUnit {
            switch,
            row,
            endpoint,
            id: id.0 as i64,
        })
    };

    let mut validated: Vec<Connection> = Vec::with_capacity(rows.len());
    for (row, conn) in rows.iter().enumerate() {
        let source = position(conn.source, row, Endpoint::Source)?;
        let destination = position(conn.destination, row, Endpoint::Destination)?;
        let src = &shapes[source];
        let dst = &shapes[destination];

        if !src.has_outlet() {
            return Err(NetworkError::MissingOutlet { switch, row, unit: src.id });
        }
        if !dst.has_inlet() {
            return Err(NetworkError::MissingInlet { switch, row, unit: dst.id });
        }

        check_component(conn.source_component, src, switch, row, Endpoint::Source)?;
        check_component(conn.destination_component, dst, switch, row, Endpoint::Destination)?;

        match (conn.source_component, conn.destination_component) {
            (ComponentSelector::All, ComponentSelector::All) => {
                if src.components != dst.components {
                    return Err(NetworkError::WildcardComponentMismatch {
                        switch,
                        row,
                        upstream: src.id,
                        downstream: dst.id,
                        upstream_count: src.components,
                        downstream_count: dst.components,
                    });
                }
            }
            (ComponentSelector::All, _) | (_, ComponentSelector::All) => {
                return Err(NetworkError::OneSidedWildcard {
                    switch,
                    row,
                    upstream: src.id,
                    downstream: dst.id,
                });
            }
            _ => {}
        }

        let owner = validated
            .iter()
            .position(|c| c.source == source && c.destination == destination)
            .unwrap_or(row);

        validated.push(Connection {
            source,
            destination,
            source_component: conn.source_component,
            destination_component: conn.destination_component,
            flow_rate: active(conn.flow_rate),
            owner,
        });
    }

    Ok(validated)
}

fn check_component(
    selector: ComponentSelector,
    shape: &UnitShape,
    switch: usize,
    row: usize,
    endpoint: Endpoint,
) -> NetworkResult<()> {
    match selector {
        ComponentSelector::Component(component) if component >= shape.components => {
            Err(NetworkError::ComponentOutOfRange {
                switch,
                row,
                endpoint,
                unit: shape.id,
                component,
                count: shape.components,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes() -> Vec<UnitShape> {
        vec![
            UnitShape::new(UnitId(0), 2, 2).with_outlet(0, 1),
            UnitShape::new(UnitId(1), 2, 6).with_inlet(0, 1).with_outlet(2, 1),
            UnitShape::new(UnitId(2), 3, 3).with_inlet(0, 1),
        ]
    }

    #[test]
    fn test_parse_connection_matrix() {
        let rows = parse_connection_matrix(&[0.0, 1.0, -1.0, -1.0, 2.5, 1.0, 2.0, 1.0, 0.0, 2.5], 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ConnectionRow::new(UnitId(0), UnitId(1), 2.5));
        assert_eq!(rows[1], ConnectionRow::new(UnitId(1), UnitId(2), 2.5).with_components(1, 0));
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let err = parse_connection_matrix(&[0.0, 1.0, -1.0, -1.0], 3).unwrap_err();
        assert!(matches!(err, NetworkError::MalformedConnections { switch: 3, .. }));
        assert_eq!(
            err.to_string(),
            "Switch 3: malformed CONNECTIONS matrix, has to have 5 columns (4 values given)"
        );

        let err = parse_connection_matrix(&[-1.0, 1.0, -1.0, -1.0, 1.0], 0).unwrap_err();
        assert!(matches!(err, NetworkError::UnknownConnectionUnit { endpoint: Endpoint::Source, id: -1, .. }));
    }

    #[test]
    fn test_parse_rejects_fractional_entries() {
        let err = parse_connection_matrix(&[0.0, 1.5, -1.0, -1.0, 1.0], 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Switch 2: malformed CONNECTIONS matrix, row 0, column 1: 1.5 is not an integer"
        );

        let values = [0.0, 1.0, -1.0, -1.0, 1.0, 1.0, 2.0, f64::NAN, 0.0, 1.0];
        let err = parse_connection_matrix(&values, 0).unwrap_err();
        assert!(matches!(err, NetworkError::MalformedConnections { switch: 0, .. }));
        assert!(err.to_string().contains("row 1, column 2"));

        // The flow rate column may be fractional
        assert!(parse_connection_matrix(&[0.0, 1.0, 0.0, 0.0, 0.25], 0).is_ok());
    }

    #[test]
    fn test_validate_port_errors() {
        let err = validate_rows(&[ConnectionRow::new(UnitId(2), UnitId(1), 1.0)], &shapes(), 0).unwrap_err();
        assert!(matches!(err, NetworkError::MissingOutlet { unit: UnitId(2), .. }));

        let err = validate_rows(&[ConnectionRow::new(UnitId(1), UnitId(0), 1.0)], &shapes(), 0).unwrap_err();
        assert!(matches!(err, NetworkError::MissingInlet { unit: UnitId(0), .. }));

        let err = validate_rows(&[ConnectionRow::new(UnitId(7), UnitId(1), 1.0)], &shapes(), 0).unwrap_err();
        assert!(matches!(err, NetworkError::UnknownConnectionUnit { id: 7, .. }));
    }

    #[test]
    fn test_validate_component_errors() {
        let row = ConnectionRow::new(UnitId(0), UnitId(1), 1.0).with_components(2, 0);
        let err = validate_rows(&[row], &shapes(), 0).unwrap_err();
        assert!(matches!(err, NetworkError::ComponentOutOfRange { component: 2, count: 2, .. }));

        let mut row = ConnectionRow::new(UnitId(0), UnitId(1), 1.0);
        row.destination_component = ComponentSelector::Component(0);
        let err = validate_rows(&[row], &shapes(), 0).unwrap_err();
        assert!(matches!(err, NetworkError::OneSidedWildcard { .. }));

        let err = validate_rows(&[ConnectionRow::new(UnitId(1), UnitId(2), 1.0)], &shapes(), 0).unwrap_err();
        assert!(matches!(
            err,
            NetworkError::WildcardComponentMismatch { upstream_count: 2, downstream_count: 3, .. }
        ));
    }

    #[test]
    fn test_duplicate_pair_owner() {
        let rows = [
            ConnectionRow::new(UnitId(0), UnitId(1), 1.0).with_components(0, 0),
            ConnectionRow::new(UnitId(1), UnitId(2), 1.0).with_components(0, 0),
            ConnectionRow::new(UnitId(0), UnitId(1), 5.0).with_components(1, 1),
        ];
        let validated = validate_rows(&rows, &shapes(), 0).unwrap();
        assert_eq!(validated[0].owner, 0);
        assert_eq!(validated[1].owner, 1);
        assert_eq!(validated[2].owner, 0);
        assert!(!validated[2].is_owner(2));
    }
}
