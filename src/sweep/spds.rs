/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sweep plan data structure: the per-direction distributed DAG.
//!
//! For one direction (or a group of directions sharing a sweep ordering) the
//! SPDS holds the local cell DAG, its topological order (the SPLS), the
//! per-face orientation cache, the inter-rank dependency lists and the
//! global sweep planes. Construction is collective: the local passes are
//! pure, the inter-rank leveling allgathers the rank digraph so every rank
//! materializes identical planes.

use super::graph::{feedback_arcs, level_by_longest_path, topological_order, Digraph};
use crate::comm::Communicator;
use crate::errors::SweepError;
use crate::math::dot;
use crate::mesh::{GridView, Neighbor};
use anyhow::{Context, Result};
use dsi_progress_logger::ProgressLog;
use log::debug;
use rayon::prelude::*;
use std::sync::Arc;

/// Orientation of a face with respect to one sweep direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceOrientation {
    /// |Ω·n̂| within tolerance of zero: no flux crosses the face.
    Parallel,
    Incoming,
    Outgoing,
}

/// Relative tolerance for the parallel-face classification, applied to
/// Ω·n̂ with both vectors normalized.
pub const PARALLEL_TOLERANCE: f64 = 1e-12;

/// Classifies every face of every local cell against `omega`.
///
/// Interior faces are evaluated on a canonical normal (the one of the cell
/// with the smaller global id) so that the two sides of a face always agree
/// on the classification, down to the last bit, even across ranks.
pub fn classify_faces(omega: [f64; 3], grid: &GridView) -> Vec<Vec<FaceOrientation>> {
    let classify = |mu: f64| -> FaceOrientation {
        if mu.abs() <= PARALLEL_TOLERANCE {
            FaceOrientation::Parallel
        } else if mu > 0.0 {
            FaceOrientation::Outgoing
        } else {
            FaceOrientation::Incoming
        }
    };
    grid.local_cells
        .iter()
        .map(|cell| {
            let orientations: Vec<FaceOrientation> = cell
                .faces
                .iter()
                .map(|face| {
                    let neighbor_gid = match face.neighbor {
                        Neighbor::Local(lid) => Some(grid.local_cells[lid as usize].global_id),
                        Neighbor::Ghost { global_id, .. } => Some(global_id),
                        Neighbor::Boundary(_) => None,
                    };
                    match neighbor_gid {
                        Some(gid) if gid < cell.global_id => {
                            // The neighbor owns the canonical normal, which
                            // is the exact negation of ours.
                            match classify(dot(omega, [-face.normal[0], -face.normal[1], -face.normal[2]])) {
                                FaceOrientation::Parallel => FaceOrientation::Parallel,
                                FaceOrientation::Incoming => FaceOrientation::Outgoing,
                                FaceOrientation::Outgoing => FaceOrientation::Incoming,
                            }
                        }
                        _ => classify(dot(omega, face.normal)),
                    }
                })
                .collect();
            debug_assert!(
                cell.faces
                    .iter()
                    .map(|f| dot(omega, f.normal) * f.area)
                    .sum::<f64>()
                    .abs()
                    < 1e-10 * cell.volume.max(1.0),
                "cell {} violates the Gauss closure",
                cell.global_id
            );
            orientations
        })
        .collect()
}

/// The local, communication-free part of an SPDS.
pub struct LocalSweepData {
    pub omega: [f64; 3],
    pub cell_face_orientations: Vec<Vec<FaceOrientation>>,
    /// Local DAG with delayed arcs removed.
    pub local_dag: Digraph,
    /// Intra-rank cycle arcs, readers of which see last iteration's data.
    pub delayed_local_arcs: Vec<(u32, u32)>,
    /// Topological order of `local_dag`, ties broken by global cell id.
    pub spls: Vec<u32>,
    /// Observed inter-rank dependencies `(src, dst)`, this rank on one side.
    rank_arcs: Vec<(u32, u32)>,
}

/// Builds the local sweep data of one direction.
pub fn build_local(
    omega: [f64; 3],
    grid: &GridView,
    allow_cycles: bool,
    direction_index: usize,
) -> Result<LocalSweepData> {
    let orientations = classify_faces(omega, grid);

    let num_cells = grid.num_local_cells();
    let mut all_arcs = Digraph::new(num_cells);
    let mut rank_arcs: Vec<(u32, u32)> = Vec::new();
    for (cell, cell_orientations) in grid.local_cells.iter().zip(&orientations) {
        for (face, &orientation) in cell.faces.iter().zip(cell_orientations) {
            match (orientation, face.neighbor) {
                (FaceOrientation::Outgoing, Neighbor::Local(nlid)) => {
                    all_arcs.add_arc(cell.local_id, nlid);
                }
                (FaceOrientation::Outgoing, Neighbor::Ghost { rank, .. }) => {
                    rank_arcs.push((grid.rank as u32, rank));
                }
                (FaceOrientation::Incoming, Neighbor::Ghost { rank, .. }) => {
                    rank_arcs.push((rank, grid.rank as u32));
                }
                _ => {}
            }
        }
    }
    rank_arcs.sort_unstable();
    rank_arcs.dedup();

    let gid = |u: u32| grid.local_cells[u as usize].global_id;
    let delayed_local_arcs = feedback_arcs(&all_arcs, |u, v| (gid(u), gid(v)));
    if !delayed_local_arcs.is_empty() {
        if !allow_cycles {
            return Err(SweepError::CycleWithoutPermission {
                direction: direction_index,
            }
            .into());
        }
        debug!(
            "direction {direction_index}: {} local cycle arc(s) delayed",
            delayed_local_arcs.len()
        );
    }
    let local_dag = all_arcs.without_arcs(&delayed_local_arcs);
    let spls = topological_order(&local_dag, gid)
        .expect("local DAG still cyclic after feedback removal");

    Ok(LocalSweepData {
        omega,
        cell_face_orientations: orientations,
        local_dag,
        delayed_local_arcs,
        spls,
        rank_arcs,
    })
}

/// A fully constructed sweep plan data structure.
#[derive(Debug)]
pub struct Spds {
    pub omega: [f64; 3],
    pub cell_face_orientations: Vec<Vec<FaceOrientation>>,
    pub local_dag: Digraph,
    pub delayed_local_arcs: Vec<(u32, u32)>,
    /// Sweep plan local sequence: every local cell exactly once, upstream
    /// cells first.
    pub spls: Vec<u32>,
    /// Ranks this rank sends outgoing flux to (non-delayed).
    pub location_successors: Vec<usize>,
    /// Ranks this rank receives incoming flux from (non-delayed).
    pub location_predecessors: Vec<usize>,
    /// Ranks whose flux toward us crosses a broken inter-rank cycle: their
    /// data is consumed with a one-iteration lag.
    pub delayed_location_predecessors: Vec<usize>,
    /// Ranks we feed across a broken inter-rank cycle.
    pub delayed_location_successors: Vec<usize>,
    /// Ranks per level of the inter-rank DAG; identical on every rank.
    pub global_sweep_planes: Vec<Vec<u32>>,
    /// Levels below and including this rank's: more depth means more
    /// downstream work.
    pub depth_of_graph: usize,
}

impl LocalSweepData {
    /// Completes the SPDS by exchanging the rank digraph and leveling it.
    ///
    /// Collective: every rank must call this for its own local data of the
    /// same direction, in the same order across directions.
    pub fn finalize<C: Communicator>(
        self,
        comm: &C,
        allow_cycles: bool,
        direction_index: usize,
    ) -> Result<Spds> {
        let rank = comm.rank();
        let num_ranks = comm.num_ranks();

        let encoded: Vec<u64> = self
            .rank_arcs
            .iter()
            .map(|&(s, d)| (s as u64) << 32 | d as u64)
            .collect();
        let mut all: Vec<(u32, u32)> = comm
            .allgather_u64(&encoded)
            .into_iter()
            .flatten()
            .map(|e| ((e >> 32) as u32, e as u32))
            .collect();
        all.sort_unstable();
        all.dedup();

        let rank_graph = Digraph::from_arcs(num_ranks, all);
        let delayed_rank_arcs =
            feedback_arcs(&rank_graph, |u, v| (u as u64, v as u64));
        if !delayed_rank_arcs.is_empty() && !allow_cycles {
            return Err(SweepError::CycleWithoutPermission {
                direction: direction_index,
            }
            .into());
        }
        let rank_dag = rank_graph.without_arcs(&delayed_rank_arcs);
        let levels = level_by_longest_path(&rank_dag).ok_or(SweepError::PartitionPathology {
            rank,
        })?;

        let num_levels = 1 + levels.iter().copied().max().unwrap_or(0) as usize;
        let mut global_sweep_planes: Vec<Vec<u32>> = vec![Vec::new(); num_levels];
        for (r, &level) in levels.iter().enumerate() {
            global_sweep_planes[level as usize].push(r as u32);
        }
        if global_sweep_planes.iter().any(|plane| plane.is_empty()) {
            return Err(SweepError::PartitionPathology { rank }.into());
        }
        let depth_of_graph = num_levels - levels[rank] as usize;

        let me = rank as u32;
        let location_successors = rank_dag
            .successors(me)
            .iter()
            .map(|&r| r as usize)
            .collect();
        let location_predecessors = rank_dag
            .arcs()
            .filter(|&(_, d)| d == me)
            .map(|(s, _)| s as usize)
            .collect();
        let delayed_location_successors = delayed_rank_arcs
            .iter()
            .filter(|&&(s, _)| s == me)
            .map(|&(_, d)| d as usize)
            .collect();
        let delayed_location_predecessors = delayed_rank_arcs
            .iter()
            .filter(|&&(_, d)| d == me)
            .map(|&(s, _)| s as usize)
            .collect();

        Ok(Spds {
            omega: self.omega,
            cell_face_orientations: self.cell_face_orientations,
            local_dag: self.local_dag,
            delayed_local_arcs: self.delayed_local_arcs,
            spls: self.spls,
            location_successors,
            location_predecessors,
            delayed_location_predecessors,
            delayed_location_successors,
            global_sweep_planes,
            depth_of_graph,
        })
    }
}

impl Spds {
    /// Whether the intra-rank arc `u -> v` crosses a broken cycle.
    pub fn is_delayed_local_arc(&self, u: u32, v: u32) -> bool {
        self.delayed_local_arcs.contains(&(u, v))
    }
}

/// Builds one SPDS per direction group, local passes in parallel, the
/// collective finalization serially in group order.
pub fn build_spds_set<C: Communicator>(
    grid: &GridView,
    master_omegas: &[[f64; 3]],
    allow_cycles: bool,
    comm: &C,
    pl: &mut impl ProgressLog,
) -> Result<Vec<Arc<Spds>>> {
    pl.item_name("sweep ordering");
    pl.expected_updates(Some(master_omegas.len()));
    pl.start("Building sweep plan data structures");

    let locals: Vec<Result<LocalSweepData>> = master_omegas
        .par_iter()
        .enumerate()
        .map(|(i, &omega)| build_local(omega, grid, allow_cycles, i))
        .collect();

    let mut spds_set = Vec::with_capacity(master_omegas.len());
    for (i, local) in locals.into_iter().enumerate() {
        let local = local.with_context(|| format!("building local sweep data {i}"))?;
        let spds = local
            .finalize(comm, allow_cycles, i)
            .with_context(|| format!("leveling sweep ordering {i}"))?;
        pl.update();
        spds_set.push(Arc::new(spds));
    }
    pl.done();
    Ok(spds_set)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::SelfComm;
    use crate::mesh::orthogonal::{uniform_cuts, OrthogonalMesher};

    #[test]
    fn test_classify_slab() {
        let grid = OrthogonalMesher::slab(uniform_cuts(4, 1.0)).build(0, 1).unwrap();
        let orientations = classify_faces([1.0, 0.0, 0.0], &grid);
        for cell_orientations in &orientations {
            assert_eq!(cell_orientations[0], FaceOrientation::Incoming);
            assert_eq!(cell_orientations[1], FaceOrientation::Outgoing);
        }
    }

    #[test]
    fn test_classify_parallel() {
        let grid = OrthogonalMesher::quad(uniform_cuts(2, 1.0), uniform_cuts(2, 1.0))
            .build(0, 1)
            .unwrap();
        // A direction along +x is parallel to the y-normal faces.
        let orientations = classify_faces([1.0, 0.0, 0.0], &grid);
        for cell_orientations in &orientations {
            assert_eq!(cell_orientations[0], FaceOrientation::Parallel);
            assert_eq!(cell_orientations[2], FaceOrientation::Parallel);
        }
    }

    #[test]
    fn test_classification_antisymmetry() {
        let grid = OrthogonalMesher::quad(uniform_cuts(3, 1.0), uniform_cuts(3, 1.0))
            .build(0, 1)
            .unwrap();
        let omega = [0.8, 0.6, 0.0];
        let orientations = classify_faces(omega, &grid);
        for cell in &grid.local_cells {
            for (f, face) in cell.faces.iter().enumerate() {
                if let Neighbor::Local(nlid) = face.neighbor {
                    let neighbor = &grid.local_cells[nlid as usize];
                    let nf = neighbor
                        .faces
                        .iter()
                        .position(|g| {
                            crate::math::points_coincide(g.centroid, face.centroid, 1e-12)
                        })
                        .unwrap();
                    let mine = orientations[cell.local_id as usize][f];
                    let theirs = orientations[nlid as usize][nf];
                    match mine {
                        FaceOrientation::Incoming => {
                            assert_eq!(theirs, FaceOrientation::Outgoing)
                        }
                        FaceOrientation::Outgoing => {
                            assert_eq!(theirs, FaceOrientation::Incoming)
                        }
                        FaceOrientation::Parallel => assert_eq!(theirs, FaceOrientation::Parallel),
                    }
                }
            }
        }
    }

    #[test]
    fn test_random_directions_classify_consistently() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};
        let grid = OrthogonalMesher::quad(uniform_cuts(3, 1.0), uniform_cuts(2, 2.0))
            .build(0, 1)
            .unwrap();
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let theta: f64 = rng.random_range(0.0..std::f64::consts::TAU);
            let omega = [theta.cos(), theta.sin(), 0.0];
            let orientations = classify_faces(omega, &grid);
            // Every interior face classification must be antisymmetric.
            for cell in &grid.local_cells {
                for (f, face) in cell.faces.iter().enumerate() {
                    if let Neighbor::Local(nlid) = face.neighbor {
                        let neighbor = &grid.local_cells[nlid as usize];
                        let nf = neighbor
                            .faces
                            .iter()
                            .position(|g| {
                                crate::math::points_coincide(g.centroid, face.centroid, 1e-12)
                            })
                            .unwrap();
                        let pair = (
                            orientations[cell.local_id as usize][f],
                            orientations[nlid as usize][nf],
                        );
                        assert!(matches!(
                            pair,
                            (FaceOrientation::Incoming, FaceOrientation::Outgoing)
                                | (FaceOrientation::Outgoing, FaceOrientation::Incoming)
                                | (FaceOrientation::Parallel, FaceOrientation::Parallel)
                        ));
                    }
                }
            }
        }
    }

    #[test]
    fn test_spls_is_topological() {
        let grid = OrthogonalMesher::quad(uniform_cuts(4, 1.0), uniform_cuts(4, 1.0))
            .build(0, 1)
            .unwrap();
        let local = build_local([0.6, 0.8, 0.0], &grid, false, 0).unwrap();
        assert_eq!(local.spls.len(), grid.num_local_cells());
        let mut position = vec![0; local.spls.len()];
        for (pos, &cell) in local.spls.iter().enumerate() {
            position[cell as usize] = pos;
        }
        for (u, v) in local.local_dag.arcs() {
            assert!(position[u as usize] < position[v as usize]);
        }
    }

    #[test]
    fn test_single_rank_planes() {
        let grid = OrthogonalMesher::slab(uniform_cuts(4, 1.0)).build(0, 1).unwrap();
        let comm = SelfComm::new();
        let spds = build_local([1.0, 0.0, 0.0], &grid, false, 0)
            .unwrap()
            .finalize(&comm, false, 0)
            .unwrap();
        assert_eq!(spds.global_sweep_planes, vec![vec![0]]);
        assert_eq!(spds.depth_of_graph, 1);
        assert!(spds.location_successors.is_empty());
        assert!(spds.delayed_location_predecessors.is_empty());
    }
}
