//! Global DOF layout.
//!
//! The global state vector is the concatenation of all unit blocks in
//! registration order, followed by one coupling DOF per component of every
//! unit that has an inlet:
//!
//! ```text
//! [ unit 0 | unit 1 | ... | unit n-1 | coupling ]
//! ```

use log::debug;

use crate::unit::{UnitId, UnitShape};

/// Offsets of every unit block and the coupling block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DofLayout {
    /// `offsets[i]` = first global index of unit `i`; the last entry is the
    /// start of the coupling block
    offsets: Vec<usize>,
    num_coupling: usize,
    num_pure: usize,
}

impl DofLayout {
    /// Computes the layout of the given units.
    pub fn new(shapes: &[UnitShape]) -> Self {
        let mut offsets = Vec::with_capacity(shapes.len() + 1);
        let mut next = 0;
        let mut num_coupling = 0;
        let mut num_pure = 0;
        for shape in shapes {
            offsets.push(next);
            next += shape.dofs;
            if shape.has_inlet() {
                num_coupling += shape.components;
                num_pure += shape.dofs.saturating_sub(shape.components);
            } else {
                num_pure += shape.dofs;
            }
        }
        offsets.push(next);

        debug!("DOF offsets {:?}, {} coupling DOFs", offsets, num_coupling);
        DofLayout { offsets, num_coupling, num_pure }
    }

    pub fn num_units(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// First global index of unit `index`.
    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn unit_range(&self, index: usize) -> std::ops::Range<usize> {
        self.offsets[index]..self.offsets[index + 1]
    }

    pub fn coupling_offset(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn coupling_range(&self) -> std::ops::Range<usize> {
        let start = self.coupling_offset();
        start..start + self.num_coupling
    }

    pub fn num_coupling_dofs(&self) -> usize {
        self.num_coupling
    }

    /// Total number of DOFs including the coupling block.
    pub fn num_dofs(&self) -> usize {
        self.coupling_offset() + self.num_coupling
    }

    /// DOFs excluding inlet and coupling DOFs.
    pub fn num_pure_dofs(&self) -> usize {
        self.num_pure
    }

    /// Splits a global vector into per-unit blocks and the coupling block.
    pub fn split<'a, T>(&self, v: &'a [T]) -> (Vec<&'a [T]>, &'a [T]) {
        let mut blocks = Vec::with_capacity(self.num_units());
        let mut rest = v;
        for i in 0..self.num_units() {
            let (head, tail) = rest.split_at(self.offsets[i + 1] - self.offsets[i]);
            blocks.push(head);
            rest = tail;
        }
        (blocks, &rest[..self.num_coupling])
    }

    /// Mutable version of [`split`](Self::split).
    pub fn split_mut<'a, T>(&self, v: &'a mut [T]) -> (Vec<&'a mut [T]>, &'a mut [T]) {
        let mut blocks = Vec::with_capacity(self.num_units());
        let mut rest = v;
        for i in 0..self.num_units() {
            let (head, tail) = rest.split_at_mut(self.offsets[i + 1] - self.offsets[i]);
            blocks.push(head);
            rest = tail;
        }
        let (coupling, _) = rest.split_at_mut(self.num_coupling);
        (blocks, coupling)
    }
}

/// Maps `(unit, component)` of units with an inlet to coupling indices.
///
/// Coupling indices are contiguous, assigned in unit order and component
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CouplingIndexMap {
    ids: Vec<UnitId>,
    starts: Vec<Option<usize>>,
    components: Vec<usize>,
}

impl CouplingIndexMap {
    pub fn new(shapes: &[UnitShape]) -> Self {
        let mut next = 0;
        let mut starts = Vec::with_capacity(shapes.len());
        for shape in shapes {
            if shape.has_inlet() {
                starts.push(Some(next));
                next += shape.components;
            } else {
                starts.push(None);
            }
        }
        CouplingIndexMap {
            ids: shapes.iter().map(|s| s.id).collect(),
            starts,
            components: shapes.iter().map(|s| s.components).collect(),
        }
    }

    /// Coupling index of `component` of the unit at position `index`.
    pub fn index(&self, index: usize, component: usize) -> Option<usize> {
        let start = self.starts.get(index).copied().flatten()?;
        (component < self.components[index]).then_some(start + component)
    }

    /// Coupling index of `component` of unit `id`.
    pub fn index_of(&self, id: UnitId, component: usize) -> Option<usize> {
        let pos = self.ids.iter().position(|u| *u == id)?;
        self.index(pos, component)
    }

    /// Range of coupling indices owned by the unit at position `index`.
    pub fn range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        let start = self.starts.get(index).copied().flatten()?;
        Some(start..start + self.components[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes() -> Vec<UnitShape> {
        vec![
            // Source: 3 components, outlet only
            UnitShape::new(UnitId(0), 3, 3).with_outlet(0, 1),
            // Tank: 3 components, inlet + outlet
            UnitShape::new(UnitId(1), 3, 9).with_inlet(0, 1).with_outlet(3, 1),
            // Sink: 2 components, inlet only
            UnitShape::new(UnitId(2), 2, 2).with_inlet(0, 1),
        ]
    }

    #[test]
    fn test_coupling_block_size() {
        let layout = DofLayout::new(&shapes());
        assert_eq!(layout.num_coupling_dofs(), 5);
        assert_eq!(layout.coupling_offset(), 14);
        assert_eq!(layout.num_dofs(), 19);
        assert_eq!(layout.num_pure_dofs(), 3 + 6);
        assert_eq!(layout.unit_range(1), 3..12);
    }

    #[test]
    fn test_coupling_index_map() {
        let map = CouplingIndexMap::new(&shapes());
        assert_eq!(map.index(0, 0), None);
        assert_eq!(map.index(1, 0), Some(0));
        assert_eq!(map.index(1, 2), Some(2));
        assert_eq!(map.index(2, 1), Some(4));
        assert_eq!(map.index(2, 2), None);
        assert_eq!(map.index_of(UnitId(2), 0), Some(3));
        assert_eq!(map.range(1), Some(0..3));
    }

    #[test]
    fn test_split_mut_blocks() {
        let layout = DofLayout::new(&shapes());
        let mut v: Vec<f64> = (0..layout.num_dofs()).map(|i| i as f64).collect();
        let (blocks, coupling) = layout.split_mut(&mut v);

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], &[0.0, 1.0, 2.0]);
        assert_eq!(blocks[2], &[12.0, 13.0]);
        assert_eq!(coupling, &[14.0, 15.0, 16.0, 17.0, 18.0]);
    }
}
