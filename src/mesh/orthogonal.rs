/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Orthogonal mesh builders with pluggable partitioners.
//!
//! These produce fully consistent per-rank [`GridView`]s for 1-D slabs, 2-D
//! quadrilateral grids and 3-D brick grids. Real production meshes come from
//! external partitioners; these builders exist so the sweep machinery can be
//! driven and tested without one. The [`Partition::Checkerboard`] partitioner
//! deliberately interleaves ownership so that inter-rank sweep cycles appear
//! even on orthogonal grids.

use super::{Cell, CellType, Face, GridView, Neighbor};
use anyhow::{ensure, Context, Result};
use std::collections::HashMap;

/// Boundary ids assigned by the orthogonal builders.
pub const XMIN: u64 = 0;
pub const XMAX: u64 = 1;
pub const YMIN: u64 = 2;
pub const YMAX: u64 = 3;
pub const ZMIN: u64 = 4;
pub const ZMAX: u64 = 5;

/// How cells are assigned to ranks.
#[derive(Debug, Clone, Copy)]
pub enum Partition {
    /// Contiguous balanced chunks of cell columns along one axis.
    Slices { axis: usize },
    /// A 2-D grid of rank blocks in the x-y plane; requires
    /// `nx * ny == num_ranks`.
    Blocks { nx: usize, ny: usize },
    /// Ownership interleaved by cell index parity. Produces inter-rank
    /// cycles for most directions.
    Checkerboard,
}

/// Builder for orthogonal grids.
#[derive(Debug, Clone)]
pub struct OrthogonalMesher {
    xcuts: Vec<f64>,
    ycuts: Vec<f64>,
    zcuts: Vec<f64>,
    dim: usize,
    partition: Partition,
}

/// Returns `n + 1` uniform cut planes over `[0, length]`.
pub fn uniform_cuts(n: usize, length: f64) -> Vec<f64> {
    (0..=n).map(|i| length * i as f64 / n as f64).collect()
}

impl OrthogonalMesher {
    /// A 1-D slab grid with the given cut planes.
    pub fn slab(xcuts: Vec<f64>) -> Self {
        OrthogonalMesher {
            xcuts,
            ycuts: vec![0.0, 1.0],
            zcuts: vec![0.0, 1.0],
            dim: 1,
            partition: Partition::Slices { axis: 0 },
        }
    }

    /// A 2-D quadrilateral grid.
    pub fn quad(xcuts: Vec<f64>, ycuts: Vec<f64>) -> Self {
        OrthogonalMesher {
            xcuts,
            ycuts,
            zcuts: vec![0.0, 1.0],
            dim: 2,
            partition: Partition::Slices { axis: 1 },
        }
    }

    /// A 3-D brick grid.
    pub fn brick(xcuts: Vec<f64>, ycuts: Vec<f64>, zcuts: Vec<f64>) -> Self {
        OrthogonalMesher {
            xcuts,
            ycuts,
            zcuts,
            dim: 3,
            partition: Partition::Slices { axis: 2 },
        }
    }

    pub fn partition(mut self, partition: Partition) -> Self {
        self.partition = partition;
        self
    }

    fn num_cells(&self) -> [usize; 3] {
        [
            self.xcuts.len() - 1,
            if self.dim >= 2 { self.ycuts.len() - 1 } else { 1 },
            if self.dim >= 3 { self.zcuts.len() - 1 } else { 1 },
        ]
    }

    fn owner(&self, idx: [usize; 3], num_ranks: usize) -> usize {
        let nc = self.num_cells();
        match self.partition {
            Partition::Slices { axis } => idx[axis] * num_ranks / nc[axis],
            Partition::Blocks { nx, ny } => {
                let bx = idx[0] * nx / nc[0];
                let by = idx[1] * ny / nc[1];
                bx + nx * by
            }
            Partition::Checkerboard => (idx[0] + idx[1] + idx[2]) % num_ranks,
        }
    }

    fn global_id(&self, idx: [usize; 3]) -> u64 {
        let nc = self.num_cells();
        (idx[0] + nc[0] * (idx[1] + nc[1] * idx[2])) as u64
    }

    fn node_id(&self, idx: [usize; 3]) -> usize {
        let nc = self.num_cells();
        idx[0] + (nc[0] + 1) * (idx[1] + (nc[1] + 1) * idx[2])
    }

    fn node_table(&self) -> Vec<[f64; 3]> {
        let nc = self.num_cells();
        // Loop nesting matches the node id layout, so pushes land in order.
        let mut nodes = Vec::with_capacity((nc[0] + 1) * (nc[1] + 1) * (nc[2] + 1));
        for iz in 0..=nc[2] {
            for iy in 0..=nc[1] {
                for ix in 0..=nc[0] {
                    debug_assert_eq!(self.node_id([ix, iy, iz]), nodes.len());
                    nodes.push([
                        self.xcuts[ix],
                        if self.dim >= 2 { self.ycuts[iy] } else { 0.0 },
                        if self.dim >= 3 { self.zcuts[iz] } else { 0.0 },
                    ]);
                }
            }
        }
        nodes
    }

    /// Builds the cell at grid index `idx`, with neighbors resolved from the
    /// perspective of `rank`.
    fn build_cell(
        &self,
        idx: [usize; 3],
        rank: usize,
        num_ranks: usize,
        local_of: &HashMap<u64, u32>,
    ) -> Cell {
        let nc = self.num_cells();
        let [ix, iy, iz] = idx;
        let (x0, x1) = (self.xcuts[ix], self.xcuts[ix + 1]);
        let (y0, y1) = if self.dim >= 2 {
            (self.ycuts[iy], self.ycuts[iy + 1])
        } else {
            (0.0, 1.0)
        };
        let (z0, z1) = if self.dim >= 3 {
            (self.zcuts[iz], self.zcuts[iz + 1])
        } else {
            (0.0, 1.0)
        };
        let (dx, dy, dz) = (x1 - x0, y1 - y0, z1 - z0);

        let neighbor_of = |didx: [isize; 3], bid: u64| -> Neighbor {
            let ni = [
                idx[0] as isize + didx[0],
                idx[1] as isize + didx[1],
                idx[2] as isize + didx[2],
            ];
            for d in 0..3 {
                if ni[d] < 0 || ni[d] >= nc[d] as isize {
                    return Neighbor::Boundary(bid);
                }
            }
            let nidx = [ni[0] as usize, ni[1] as usize, ni[2] as usize];
            let gid = self.global_id(nidx);
            let owner = self.owner(nidx, num_ranks);
            if owner == rank {
                Neighbor::Local(local_of[&gid])
            } else {
                Neighbor::Ghost {
                    rank: owner as u32,
                    global_id: gid,
                }
            }
        };

        let mut faces = Vec::new();
        match self.dim {
            1 => {
                let nl = self.node_id([ix, 0, 0]);
                let nr = self.node_id([ix + 1, 0, 0]);
                faces.push(Face {
                    nodes: vec![nl],
                    normal: [-1.0, 0.0, 0.0],
                    area: 1.0,
                    centroid: [x0, 0.0, 0.0],
                    neighbor: neighbor_of([-1, 0, 0], XMIN),
                });
                faces.push(Face {
                    nodes: vec![nr],
                    normal: [1.0, 0.0, 0.0],
                    area: 1.0,
                    centroid: [x1, 0.0, 0.0],
                    neighbor: neighbor_of([1, 0, 0], XMAX),
                });
            }
            2 => {
                let n = [
                    self.node_id([ix, iy, 0]),
                    self.node_id([ix + 1, iy, 0]),
                    self.node_id([ix + 1, iy + 1, 0]),
                    self.node_id([ix, iy + 1, 0]),
                ];
                let xc = 0.5 * (x0 + x1);
                let yc = 0.5 * (y0 + y1);
                faces.push(Face {
                    nodes: vec![n[0], n[1]],
                    normal: [0.0, -1.0, 0.0],
                    area: dx,
                    centroid: [xc, y0, 0.0],
                    neighbor: neighbor_of([0, -1, 0], YMIN),
                });
                faces.push(Face {
                    nodes: vec![n[1], n[2]],
                    normal: [1.0, 0.0, 0.0],
                    area: dy,
                    centroid: [x1, yc, 0.0],
                    neighbor: neighbor_of([1, 0, 0], XMAX),
                });
                faces.push(Face {
                    nodes: vec![n[2], n[3]],
                    normal: [0.0, 1.0, 0.0],
                    area: dx,
                    centroid: [xc, y1, 0.0],
                    neighbor: neighbor_of([0, 1, 0], YMAX),
                });
                faces.push(Face {
                    nodes: vec![n[3], n[0]],
                    normal: [-1.0, 0.0, 0.0],
                    area: dy,
                    centroid: [x0, yc, 0.0],
                    neighbor: neighbor_of([-1, 0, 0], XMIN),
                });
            }
            _ => {
                // VTK hexahedron node order.
                let n = [
                    self.node_id([ix, iy, iz]),
                    self.node_id([ix + 1, iy, iz]),
                    self.node_id([ix + 1, iy + 1, iz]),
                    self.node_id([ix, iy + 1, iz]),
                    self.node_id([ix, iy, iz + 1]),
                    self.node_id([ix + 1, iy, iz + 1]),
                    self.node_id([ix + 1, iy + 1, iz + 1]),
                    self.node_id([ix, iy + 1, iz + 1]),
                ];
                let xc = 0.5 * (x0 + x1);
                let yc = 0.5 * (y0 + y1);
                let zc = 0.5 * (z0 + z1);
                let face_specs: [(Vec<usize>, [f64; 3], f64, [f64; 3], [isize; 3], u64); 6] = [
                    (
                        vec![n[0], n[3], n[7], n[4]],
                        [-1.0, 0.0, 0.0],
                        dy * dz,
                        [x0, yc, zc],
                        [-1, 0, 0],
                        XMIN,
                    ),
                    (
                        vec![n[1], n[2], n[6], n[5]],
                        [1.0, 0.0, 0.0],
                        dy * dz,
                        [x1, yc, zc],
                        [1, 0, 0],
                        XMAX,
                    ),
                    (
                        vec![n[0], n[1], n[5], n[4]],
                        [0.0, -1.0, 0.0],
                        dx * dz,
                        [xc, y0, zc],
                        [0, -1, 0],
                        YMIN,
                    ),
                    (
                        vec![n[3], n[2], n[6], n[7]],
                        [0.0, 1.0, 0.0],
                        dx * dz,
                        [xc, y1, zc],
                        [0, 1, 0],
                        YMAX,
                    ),
                    (
                        vec![n[0], n[1], n[2], n[3]],
                        [0.0, 0.0, -1.0],
                        dx * dy,
                        [xc, yc, z0],
                        [0, 0, -1],
                        ZMIN,
                    ),
                    (
                        vec![n[4], n[5], n[6], n[7]],
                        [0.0, 0.0, 1.0],
                        dx * dy,
                        [xc, yc, z1],
                        [0, 0, 1],
                        ZMAX,
                    ),
                ];
                for (nodes, normal, area, centroid, didx, bid) in face_specs {
                    faces.push(Face {
                        nodes,
                        normal,
                        area,
                        centroid,
                        neighbor: neighbor_of(didx, bid),
                    });
                }
            }
        }

        Cell {
            global_id: self.global_id(idx),
            local_id: local_of.get(&self.global_id(idx)).copied().unwrap_or(u32::MAX),
            material_id: 0,
            cell_type: match self.dim {
                1 => CellType::Slab,
                2 => CellType::Polygon,
                _ => CellType::Polyhedron,
            },
            centroid: [
                0.5 * (x0 + x1),
                if self.dim >= 2 { 0.5 * (y0 + y1) } else { 0.0 },
                if self.dim >= 3 { 0.5 * (z0 + z1) } else { 0.0 },
            ],
            volume: match self.dim {
                1 => dx,
                2 => dx * dy,
                _ => dx * dy * dz,
            },
            faces,
        }
    }

    /// Builds the grid view of `rank` out of `num_ranks`.
    pub fn build(&self, rank: usize, num_ranks: usize) -> Result<GridView> {
        let nc = self.num_cells();
        ensure!(rank < num_ranks, "rank {rank} out of {num_ranks}");
        ensure!(
            self.xcuts.len() >= 2 && self.ycuts.len() >= 2 && self.zcuts.len() >= 2,
            "each axis needs at least one cell"
        );
        if let Partition::Blocks { nx, ny } = self.partition {
            ensure!(
                nx * ny == num_ranks,
                "block partition {nx}x{ny} does not cover {num_ranks} ranks"
            );
        }

        // Owned cells, in ascending global id order, get dense local ids.
        let mut owned: Vec<[usize; 3]> = Vec::new();
        for iz in 0..nc[2] {
            for iy in 0..nc[1] {
                for ix in 0..nc[0] {
                    if self.owner([ix, iy, iz], num_ranks) == rank {
                        owned.push([ix, iy, iz]);
                    }
                }
            }
        }
        owned.sort_by_key(|&idx| self.global_id(idx));
        let local_of: HashMap<u64, u32> = owned
            .iter()
            .enumerate()
            .map(|(lid, &idx)| (self.global_id(idx), lid as u32))
            .collect();

        let local_cells: Vec<Cell> = owned
            .iter()
            .map(|&idx| self.build_cell(idx, rank, num_ranks, &local_of))
            .collect();

        // Materialize a ghost copy of every remote neighbor.
        let mut ghost_cells: HashMap<u64, Cell> = HashMap::new();
        for iz in 0..nc[2] {
            for iy in 0..nc[1] {
                for ix in 0..nc[0] {
                    let idx = [ix, iy, iz];
                    if self.owner(idx, num_ranks) == rank {
                        continue;
                    }
                    let gid = self.global_id(idx);
                    let borders_us = local_cells.iter().any(|c| {
                        c.faces.iter().any(
                            |f| matches!(f.neighbor, Neighbor::Ghost { global_id, .. } if global_id == gid),
                        )
                    });
                    if borders_us {
                        ghost_cells.insert(gid, self.build_cell(idx, rank, num_ranks, &local_of));
                    }
                }
            }
        }

        GridView::new(
            rank,
            num_ranks,
            self.dim,
            self.node_table(),
            local_cells,
            ghost_cells,
        )
        .context("building orthogonal grid view")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::math::dot;

    #[test]
    fn test_slab_single_rank() {
        let grid = OrthogonalMesher::slab(uniform_cuts(10, 5.0))
            .build(0, 1)
            .unwrap();
        assert_eq!(grid.num_local_cells(), 10);
        assert_eq!(grid.boundary_ids, vec![XMIN, XMAX]);
        for cell in &grid.local_cells {
            assert!((cell.volume - 0.5).abs() < 1e-14);
        }
    }

    #[test]
    fn test_quad_partition_consistency() {
        // Every ghost reference must be answered by a ghost copy, and the
        // ghost's geometry must expose a face whose centroid matches ours.
        for rank in 0..4 {
            let grid = OrthogonalMesher::quad(uniform_cuts(4, 1.0), uniform_cuts(4, 1.0))
                .partition(Partition::Blocks { nx: 2, ny: 2 })
                .build(rank, 4)
                .unwrap();
            assert_eq!(grid.num_local_cells(), 4);
            for cell in &grid.local_cells {
                for face in &cell.faces {
                    if let Neighbor::Ghost { global_id, .. } = face.neighbor {
                        let ghost = grid.ghost_cell(global_id).expect("missing ghost");
                        assert!(ghost.faces.iter().any(|gf| {
                            crate::math::points_coincide(gf.centroid, face.centroid, 1e-12)
                        }));
                    }
                }
            }
        }
    }

    #[test]
    fn test_gauss_closure_brick() {
        // Sum of (outward normal) * area over a closed cell must vanish.
        let grid = OrthogonalMesher::brick(
            uniform_cuts(2, 1.0),
            uniform_cuts(3, 2.0),
            uniform_cuts(2, 0.7),
        )
        .build(0, 1)
        .unwrap();
        for cell in &grid.local_cells {
            for omega in [[1.0, 0.0, 0.0], [0.3, -0.4, 0.866]] {
                let closure: f64 = cell
                    .faces
                    .iter()
                    .map(|f| dot(omega, f.normal) * f.area)
                    .sum();
                assert!(closure.abs() < 1e-12, "closure {closure}");
            }
        }
    }

    #[test]
    fn test_checkerboard_interleaves() {
        let grid = OrthogonalMesher::slab(uniform_cuts(6, 1.0))
            .partition(Partition::Checkerboard)
            .build(0, 2)
            .unwrap();
        // Rank 0 owns cells 0, 2, 4; each interior neighbor is a ghost.
        assert_eq!(grid.num_local_cells(), 3);
        assert_eq!(grid.ghost_global_ids(), vec![1, 3, 5]);
    }
}
