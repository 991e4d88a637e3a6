/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sweep boundaries.
//!
//! Three kinds, one interface: a boundary answers incoming-flux reads on
//! INCOMING boundary faces and absorbs outgoing-flux writes on OUTGOING
//! ones. Vacuum and isotropic-incident boundaries are stateless; reflecting
//! boundaries store the outgoing flux per direction and hand it back to the
//! mirrored direction, with a one-iteration lag for directions whose mirror
//! has not been swept yet this iteration.

use crate::mesh::{GridView, Neighbor};
use crate::quadrature::AngularQuadrature;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

/// Boundaries by boundary id, shared by all angle-sets of a groupset.
pub type BoundaryMap = BTreeMap<u64, SweepBoundary>;

#[derive(Debug)]
pub enum SweepBoundary {
    Vacuum,
    /// Uniform incident angular flux, per global group.
    IsotropicIncident { strength: Vec<f64> },
    Reflecting(ReflectingBoundary),
}

impl SweepBoundary {
    pub fn is_reflecting(&self) -> bool {
        matches!(self, SweepBoundary::Reflecting(_))
    }

    /// Whether this boundary injects a fixed surface source (as opposed to
    /// coupling angular unknowns, like a reflecting boundary does).
    pub fn is_fixed_surface_source(&self) -> bool {
        matches!(self, SweepBoundary::IsotropicIncident { .. })
    }

    /// Incoming angular flux at a boundary face node for `direction`.
    pub fn psi_incoming(
        &self,
        direction: usize,
        cell_local_id: u32,
        face: usize,
        node: usize,
        group: usize,
    ) -> f64 {
        match self {
            SweepBoundary::Vacuum => 0.0,
            SweepBoundary::IsotropicIncident { strength } => strength[group],
            SweepBoundary::Reflecting(reflecting) => {
                reflecting.psi_incoming(direction, cell_local_id, face, node, group)
            }
        }
    }

    /// Deposits outgoing angular flux; only reflecting boundaries retain it.
    pub fn set_outgoing(
        &mut self,
        direction: usize,
        cell_local_id: u32,
        face: usize,
        node: usize,
        group: usize,
        value: f64,
    ) {
        if let SweepBoundary::Reflecting(reflecting) = self {
            reflecting.set_outgoing(direction, cell_local_id, face, node, group, value);
        }
    }

    /// End-of-iteration reset; reflecting boundaries roll their buffers.
    pub fn reset(&mut self) {
        if let SweepBoundary::Reflecting(reflecting) = self {
            reflecting.reset();
        }
    }
}

/// A planar reflecting boundary.
#[derive(Debug)]
pub struct ReflectingBoundary {
    /// `refl_map[d]` is the direction that mirrors `d` through the plane.
    refl_map: Vec<usize>,
    num_groups: usize,
    /// Node base of every (cell, face) on this boundary.
    face_base: HashMap<(u32, usize), usize>,
    /// Nodal storage size per direction.
    stride: usize,
    /// Flux deposited this iteration, indexed by the consuming direction.
    psi_new: Vec<f64>,
    /// Flux deposited last iteration.
    psi_old: Vec<f64>,
    /// Whether the consuming direction's slot was filled this iteration.
    ready: Vec<bool>,
}

impl ReflectingBoundary {
    /// Registers every local boundary face carrying `boundary_id` and sizes
    /// the per-direction storage.
    pub fn new(
        grid: &GridView,
        boundary_id: u64,
        quadrature: &AngularQuadrature,
        normal_axis: usize,
        num_groups: usize,
    ) -> Result<Self> {
        let refl_map = quadrature.reflection_map(normal_axis)?;
        let mut face_base = HashMap::new();
        let mut total_nodes = 0usize;
        for cell in &grid.local_cells {
            for (f, face) in cell.faces.iter().enumerate() {
                if face.neighbor == Neighbor::Boundary(boundary_id) {
                    face_base.insert((cell.local_id, f), total_nodes);
                    total_nodes += face.nodes.len();
                }
            }
        }
        let stride = total_nodes * num_groups;
        let num_angles = quadrature.num_angles();
        Ok(ReflectingBoundary {
            refl_map,
            num_groups,
            face_base,
            stride,
            psi_new: vec![0.0; stride * num_angles],
            psi_old: vec![0.0; stride * num_angles],
            ready: vec![false; num_angles],
        })
    }

    #[inline]
    fn index(&self, direction: usize, base: usize, node: usize, group: usize) -> usize {
        direction * self.stride + (base + node) * self.num_groups + group
    }

    fn psi_incoming(
        &self,
        direction: usize,
        cell_local_id: u32,
        face: usize,
        node: usize,
        group: usize,
    ) -> f64 {
        let base = self.face_base[&(cell_local_id, face)];
        let idx = self.index(direction, base, node, group);
        if self.ready[direction] {
            self.psi_new[idx]
        } else {
            self.psi_old[idx]
        }
    }

    fn set_outgoing(
        &mut self,
        direction: usize,
        cell_local_id: u32,
        face: usize,
        node: usize,
        group: usize,
        value: f64,
    ) {
        let mirrored = self.refl_map[direction];
        let base = self.face_base[&(cell_local_id, face)];
        let idx = self.index(mirrored, base, node, group);
        self.psi_new[idx] = value;
        self.ready[mirrored] = true;
    }

    /// Rolls this iteration's deposits into the lagged buffer.
    pub fn reset(&mut self) {
        std::mem::swap(&mut self.psi_old, &mut self.psi_new);
        self.ready.iter_mut().for_each(|r| *r = false);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mesh::orthogonal::{uniform_cuts, OrthogonalMesher, XMIN};

    #[test]
    fn test_reflecting_lag() {
        let grid = OrthogonalMesher::slab(uniform_cuts(3, 1.0)).build(0, 1).unwrap();
        let quad = AngularQuadrature::gauss_legendre_1d(2).unwrap();
        let mut boundary =
            SweepBoundary::Reflecting(ReflectingBoundary::new(&grid, XMIN, &quad, 0, 1).unwrap());

        // Direction 0 is -mu and hits XMIN; its mirror is direction 1.
        boundary.set_outgoing(0, 0, 0, 0, 0, 2.5);
        // The mirror reads its own slot immediately within the iteration.
        assert_eq!(boundary.psi_incoming(1, 0, 0, 0, 0), 2.5);
        // An unready direction reads the lagged (zero) buffer.
        assert_eq!(boundary.psi_incoming(0, 0, 0, 0, 0), 0.0);

        boundary.reset();
        // After the roll the deposit is served as last iteration's value.
        assert_eq!(boundary.psi_incoming(1, 0, 0, 0, 0), 2.5);
    }

    #[test]
    fn test_vacuum_and_incident() {
        let vacuum = SweepBoundary::Vacuum;
        assert_eq!(vacuum.psi_incoming(0, 0, 0, 0, 0), 0.0);
        let incident = SweepBoundary::IsotropicIncident {
            strength: vec![1.5, 0.25],
        };
        assert_eq!(incident.psi_incoming(3, 9, 1, 0, 1), 0.25);
        assert!(!incident.is_reflecting());
    }
}
