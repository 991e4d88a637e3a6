/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Spatial mesh types and the immutable per-rank grid view.
//!
//! A [`GridView`] is the per-rank slice of a distributed mesh: the cells the
//! rank owns, plus fully materialized *ghost* copies of every neighboring
//! cell owned by another rank. Views are immutable after construction; the
//! sweep machinery only ever reads them.

pub mod orthogonal;

use crate::errors::SweepError;
use crate::math::norm;
use anyhow::{ensure, Result};
use std::collections::HashMap;

pub mod prelude {
    pub use super::orthogonal::{OrthogonalMesher, Partition};
    pub use super::{Cell, CellType, Face, FaceHistogram, GridView, Neighbor};
}

/// Geometric cell classes supported by the sweep core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Slab,
    Polygon,
    Polyhedron,
}

/// What lies on the other side of a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neighbor {
    /// A cell owned by this rank, by local id.
    Local(u32),
    /// A cell owned by another rank; a ghost copy is available.
    Ghost { rank: u32, global_id: u64 },
    /// A domain boundary, by boundary id.
    Boundary(u64),
}

impl Neighbor {
    pub fn is_boundary(&self) -> bool {
        matches!(self, Neighbor::Boundary(_))
    }
}

/// A cell face: an ordered node list, an outward unit normal and a neighbor.
#[derive(Debug, Clone)]
pub struct Face {
    /// Indices into the grid node table, ordered consistently with the cell.
    pub nodes: Vec<usize>,
    /// Outward unit normal.
    pub normal: [f64; 3],
    pub area: f64,
    pub centroid: [f64; 3],
    pub neighbor: Neighbor,
}

impl Face {
    pub fn has_neighbor(&self) -> bool {
        !self.neighbor.is_boundary()
    }
}

/// A mesh cell with its ordered face list.
#[derive(Debug, Clone)]
pub struct Cell {
    pub global_id: u64,
    /// Dense on the owning rank; meaningless for ghost copies.
    pub local_id: u32,
    pub material_id: u32,
    pub cell_type: CellType,
    pub centroid: [f64; 3],
    pub volume: f64,
    pub faces: Vec<Face>,
}

impl Cell {
    /// Diameter of the cell bounding box, used to scale node-matching
    /// tolerances.
    pub fn diameter(&self, grid: &GridView) -> f64 {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for face in &self.faces {
            for &n in &face.nodes {
                let p = grid.nodes[n];
                for d in 0..3 {
                    lo[d] = lo[d].min(p[d]);
                    hi[d] = hi[d].max(p[d]);
                }
            }
        }
        norm([hi[0] - lo[0], hi[1] - lo[1], hi[2] - lo[2]])
    }
}

/// The immutable per-rank view of the distributed mesh.
#[derive(Debug, Clone)]
pub struct GridView {
    pub rank: usize,
    pub num_ranks: usize,
    /// Spatial dimension (1, 2 or 3).
    pub dim: usize,
    /// Node coordinates, shared by local and ghost cells.
    pub nodes: Vec<[f64; 3]>,
    /// Cells owned by this rank, indexed by local id.
    pub local_cells: Vec<Cell>,
    ghost_cells: HashMap<u64, Cell>,
    /// Boundary ids that appear on at least one local face.
    pub boundary_ids: Vec<u64>,
}

impl GridView {
    /// Builds a view and validates its geometry.
    ///
    /// Every face normal must be a unit vector; anything else is
    /// [`SweepError::BadGeometry`].
    pub fn new(
        rank: usize,
        num_ranks: usize,
        dim: usize,
        nodes: Vec<[f64; 3]>,
        local_cells: Vec<Cell>,
        ghost_cells: HashMap<u64, Cell>,
    ) -> Result<Self> {
        let mut boundary_ids = Vec::new();
        for cell in &local_cells {
            for face in &cell.faces {
                let len = norm(face.normal);
                if (len - 1.0).abs() > 1e-10 {
                    return Err(SweepError::BadGeometry(format!(
                        "face normal of cell {} has length {len}",
                        cell.global_id
                    ))
                    .into());
                }
                if let Neighbor::Boundary(bid) = face.neighbor {
                    if !boundary_ids.contains(&bid) {
                        boundary_ids.push(bid);
                    }
                }
            }
        }
        boundary_ids.sort_unstable();
        ensure!(
            local_cells
                .iter()
                .enumerate()
                .all(|(i, c)| c.local_id as usize == i),
            "local ids must be dense and ordered"
        );
        Ok(GridView {
            rank,
            num_ranks,
            dim,
            nodes,
            local_cells,
            ghost_cells,
            boundary_ids,
        })
    }

    pub fn num_local_cells(&self) -> usize {
        self.local_cells.len()
    }

    /// Returns the ghost copy of a remote cell, if this rank borders it.
    pub fn ghost_cell(&self, global_id: u64) -> Option<&Cell> {
        self.ghost_cells.get(&global_id)
    }

    /// Global ids of all ghost cells, sorted.
    pub fn ghost_global_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.ghost_cells.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Builds the face-node-count histogram used to pre-size flux storage.
    pub fn face_histogram(&self) -> FaceHistogram {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for cell in &self.local_cells {
            for face in &cell.faces {
                *counts.entry(face.nodes.len()).or_insert(0) += 1;
            }
        }
        let mut bins: Vec<(usize, usize)> = counts.into_iter().collect();
        bins.sort_unstable();
        FaceHistogram { bins }
    }
}

/// Distribution of face node counts across the local grid.
///
/// The flux data structures use it to reserve slot storage up front instead
/// of growing it during the template walk.
#[derive(Debug, Clone)]
pub struct FaceHistogram {
    /// `(face_node_count, number_of_faces)`, ascending by node count.
    pub bins: Vec<(usize, usize)>,
}

impl FaceHistogram {
    /// Total number of local faces.
    pub fn num_faces(&self) -> usize {
        self.bins.iter().map(|&(_, c)| c).sum()
    }

    /// Upper bound on nodes per face.
    pub fn max_face_nodes(&self) -> usize {
        self.bins.last().map(|&(n, _)| n).unwrap_or(0)
    }

    /// Total face-node payload across all local faces.
    pub fn total_face_nodes(&self) -> usize {
        self.bins.iter().map(|&(n, c)| n * c).sum()
    }
}
