/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Piecewise-linear finite-element cell mappings.
//!
//! For every cell the sweep kernel needs the usual DFEM integrals: the mass
//! matrix, the gradient matrices, and per-face surface mass matrices and
//! shape integrals. On orthogonal cells (slab / quad / brick) the basis is a
//! tensor product of 1-D hat functions, so all integrals factor into
//! per-dimension closed forms.

use crate::errors::SweepError;
use crate::math::DenseMatrix;
use crate::mesh::{Cell, GridView};
use anyhow::Result;

/// Per-cell finite-element integrals consumed by the transport kernel.
#[derive(Debug, Clone)]
pub struct UnitCellMatrices {
    /// ∫ b_i b_j dV.
    pub intv_shape_shape: DenseMatrix,
    /// ∫ b_i ∂b_j/∂x_d dV, one matrix per coordinate.
    pub intv_gradshape_shape: [DenseMatrix; 3],
    /// Per face: ∫_f b_i b_j dA, embedded in full cell-node indexing.
    pub ints_shape_shape: Vec<DenseMatrix>,
    /// Per face: ∫_f b_i dA.
    pub ints_shape: Vec<Vec<f64>>,
}

/// The node bookkeeping of one cell: its node list and, per face, the
/// positions of the face's nodes within that list.
#[derive(Debug, Clone)]
pub struct CellMapping {
    /// Global node ids in cell-local order (ascending by id).
    pub cell_nodes: Vec<usize>,
    /// `face_node_mapping[f][k]` is the cell-local index of face `f`'s
    /// `k`-th node.
    pub face_node_mapping: Vec<Vec<usize>>,
}

impl CellMapping {
    pub fn num_nodes(&self) -> usize {
        self.cell_nodes.len()
    }

    pub fn face_node_count(&self, f: usize) -> usize {
        self.face_node_mapping[f].len()
    }
}

/// The spatial-discretization data of a whole grid view: one mapping and one
/// matrix set per local cell, plus the nodal degree-of-freedom layout.
#[derive(Debug, Clone)]
pub struct PwlDiscretization {
    pub mappings: Vec<CellMapping>,
    pub unit_matrices: Vec<UnitCellMatrices>,
    /// Prefix sums of per-cell node counts: dof base of cell `c` is
    /// `node_base[c]`, total nodal dofs is `node_base[num_cells]`.
    pub node_base: Vec<usize>,
}

impl PwlDiscretization {
    pub fn build(grid: &GridView) -> Result<Self> {
        let mut mappings = Vec::with_capacity(grid.num_local_cells());
        let mut unit_matrices = Vec::with_capacity(grid.num_local_cells());
        let mut node_base = Vec::with_capacity(grid.num_local_cells() + 1);
        let mut total = 0usize;
        for cell in &grid.local_cells {
            let mapping = build_cell_mapping(cell)?;
            let matrices = build_unit_matrices(cell, &mapping, grid)?;
            node_base.push(total);
            total += mapping.num_nodes();
            mappings.push(mapping);
            unit_matrices.push(matrices);
        }
        node_base.push(total);
        Ok(PwlDiscretization {
            mappings,
            unit_matrices,
            node_base,
        })
    }

    pub fn num_nodal_dofs(&self) -> usize {
        *self.node_base.last().unwrap()
    }
}

/// Collects the cell's nodes from its faces and builds the per-face node
/// position maps.
pub fn build_cell_mapping(cell: &Cell) -> Result<CellMapping> {
    let mut cell_nodes: Vec<usize> = cell
        .faces
        .iter()
        .flat_map(|f| f.nodes.iter().copied())
        .collect();
    cell_nodes.sort_unstable();
    cell_nodes.dedup();
    let face_node_mapping = cell
        .faces
        .iter()
        .map(|face| {
            face.nodes
                .iter()
                .map(|n| cell_nodes.binary_search(n).expect("face node not in cell"))
                .collect()
        })
        .collect();
    Ok(CellMapping {
        cell_nodes,
        face_node_mapping,
    })
}

/// Tensor-product hat-function integrals for an orthogonal cell.
///
/// Each cell node is classified to a corner of the cell bounding box; the
/// integrals are products of 1-D factors over the dimensions the cell
/// actually spans.
pub fn build_unit_matrices(
    cell: &Cell,
    mapping: &CellMapping,
    grid: &GridView,
) -> Result<UnitCellMatrices> {
    let dims: &[usize] = match grid.dim {
        1 => &[0],
        2 => &[0, 1],
        _ => &[0, 1, 2],
    };

    // Bounding box and corner bits per node.
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for &n in &mapping.cell_nodes {
        for d in 0..3 {
            lo[d] = lo[d].min(grid.nodes[n][d]);
            hi[d] = hi[d].max(grid.nodes[n][d]);
        }
    }
    let mut h = [1.0; 3];
    for &d in dims {
        h[d] = hi[d] - lo[d];
        if h[d] <= 0.0 {
            return Err(SweepError::BadGeometry(format!(
                "cell {} is degenerate along axis {d}",
                cell.global_id
            ))
            .into());
        }
    }
    let num_nodes = mapping.num_nodes();
    let corner_bit = |node: usize, d: usize| -> Result<usize> {
        let x = grid.nodes[mapping.cell_nodes[node]][d];
        let tol = 1e-10 * h[d].max(1.0);
        if (x - lo[d]).abs() <= tol {
            Ok(0)
        } else if (x - hi[d]).abs() <= tol {
            Ok(1)
        } else {
            Err(SweepError::BadGeometry(format!(
                "node of cell {} is not on a bounding-box corner",
                cell.global_id
            ))
            .into())
        }
    };
    let mut bits = vec![[0usize; 3]; num_nodes];
    for i in 0..num_nodes {
        for &d in dims {
            bits[i][d] = corner_bit(i, d)?;
        }
    }

    // 1-D factors on [0, h]: hat mass and hat-gradient integrals.
    let mass1d = |a: usize, b: usize, h: f64| -> f64 {
        if a == b {
            h / 3.0
        } else {
            h / 6.0
        }
    };
    let grad1d = |b: usize| -> f64 {
        if b == 1 {
            0.5
        } else {
            -0.5
        }
    };

    let mut intv_shape_shape = vec![vec![0.0; num_nodes]; num_nodes];
    let mut intv_gradshape_shape = [
        vec![vec![0.0; num_nodes]; num_nodes],
        vec![vec![0.0; num_nodes]; num_nodes],
        vec![vec![0.0; num_nodes]; num_nodes],
    ];
    for i in 0..num_nodes {
        for j in 0..num_nodes {
            let mut mass = 1.0;
            for &d in dims {
                mass *= mass1d(bits[i][d], bits[j][d], h[d]);
            }
            intv_shape_shape[i][j] = mass;
            for &d in dims {
                // Along d the h factors cancel: ∫ B_a B'_b dξ = ±1/2,
                // with the sign set by b alone.
                let mut grad = grad1d(bits[j][d]);
                for &e in dims {
                    if e != d {
                        grad *= mass1d(bits[i][e], bits[j][e], h[e]);
                    }
                }
                intv_gradshape_shape[d][i][j] = grad;
            }
        }
    }

    // Per-face surface integrals: a face lies on one bounding-box side.
    let mut ints_shape_shape = Vec::with_capacity(cell.faces.len());
    let mut ints_shape = Vec::with_capacity(cell.faces.len());
    for (f, face) in cell.faces.iter().enumerate() {
        let mut m_surf = vec![vec![0.0; num_nodes]; num_nodes];
        let mut s = vec![0.0; num_nodes];
        // Face axis: the dimension along which the normal points.
        let axis = (0..3)
            .max_by(|&a, &b| face.normal[a].abs().partial_cmp(&face.normal[b].abs()).unwrap())
            .unwrap();
        let side = if face.normal[axis] > 0.0 { 1 } else { 0 };
        for &i in &mapping.face_node_mapping[f] {
            debug_assert_eq!(bits[i][axis], side);
            let mut shape = 1.0;
            for &d in dims {
                if d != axis {
                    shape *= h[d] / 2.0;
                }
            }
            s[i] = shape;
            for &j in &mapping.face_node_mapping[f] {
                let mut mass = 1.0;
                for &d in dims {
                    if d != axis {
                        mass *= mass1d(bits[i][d], bits[j][d], h[d]);
                    }
                }
                m_surf[i][j] = mass;
            }
        }
        ints_shape_shape.push(m_surf);
        ints_shape.push(s);
    }

    Ok(UnitCellMatrices {
        intv_shape_shape,
        intv_gradshape_shape,
        ints_shape_shape,
        ints_shape,
    })
}
