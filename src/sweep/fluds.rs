/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Flux data structures.
//!
//! A [`FludsTemplate`] is built once per SPDS and is group- and
//! angle-independent: it walks the SPLS, gives every outgoing face a *slot*
//! in one of several banks (local, per-successor send, and their delayed
//! counterparts) and resolves every incoming face to the upstream slot plus
//! a node permutation. A [`Fluds`] instance scales a template by the number
//! of groups and angles of one angle-set and owns the actual storage,
//! including the double-buffered delayed banks.
//!
//! Inter-rank slot order never travels over the wire: sender and receiver
//! both sort the faces of a rank pair by `(upstream cell global id, face
//! centroid)`, which yields the same layout on both sides without
//! negotiation.

use super::spds::{FaceOrientation, Spds};
use crate::errors::SweepError;
use crate::math::{lex_cmp, points_coincide};
use crate::mesh::{Cell, FaceHistogram, GridView, Neighbor};
use anyhow::{Context, Result};
use std::sync::Arc;

/// What a cell face means to the flux data structure.
#[derive(Debug, Clone)]
pub enum FaceRole {
    /// Parallel face: no flux crosses it.
    None,
    /// Domain boundary; reads and writes go through the boundary object.
    Boundary { boundary_id: u64 },
    /// Outgoing to a local downstream cell.
    OutLocal { slot: u32 },
    /// Outgoing across a broken intra-rank cycle arc.
    OutDelayedLocal { slot: u32 },
    /// Outgoing to another rank: `succ` indexes the successor-rank list.
    OutGhost { succ: u32, slot: u32 },
    /// Outgoing across a broken inter-rank cycle arc.
    OutDelayedGhost { succ: u32, slot: u32 },
    /// Incoming from a local upstream cell.
    InLocal { slot: u32, node_map: Vec<u8> },
    /// Incoming across a broken intra-rank cycle arc (lagged data).
    InDelayedLocal { slot: u32, node_map: Vec<u8> },
    /// Incoming from another rank: `pred` indexes the predecessor-rank list.
    InGhost { pred: u32, slot: u32, node_map: Vec<u8> },
    /// Incoming across a broken inter-rank cycle arc (lagged data).
    InDelayedGhost { pred: u32, slot: u32, node_map: Vec<u8> },
}

/// Slot layout of one storage bank: per-slot node base and node count.
#[derive(Debug, Clone, Default)]
pub struct Bank {
    bases: Vec<u32>,
    sizes: Vec<u32>,
    total_nodes: u32,
}

impl Bank {
    fn push_slot(&mut self, nodes: usize) -> u32 {
        let slot = self.bases.len() as u32;
        self.bases.push(self.total_nodes);
        self.sizes.push(nodes as u32);
        self.total_nodes += nodes as u32;
        slot
    }

    pub fn num_slots(&self) -> usize {
        self.bases.len()
    }

    /// Doubles needed for `groups × angles` copies of every slot.
    pub fn total_doubles(&self, num_groups: usize, num_angles: usize) -> usize {
        self.total_nodes as usize * num_groups * num_angles
    }

    /// Address of one value: slots are contiguous `groups × angles ×
    /// nodes` tiles.
    #[inline]
    fn addr(
        &self,
        slot: u32,
        angle_idx: usize,
        group_idx: usize,
        node: usize,
        num_groups: usize,
        num_angles: usize,
    ) -> usize {
        let base = self.bases[slot as usize] as usize * num_groups * num_angles;
        let nodes = self.sizes[slot as usize] as usize;
        debug_assert!(node < nodes && angle_idx < num_angles && group_idx < num_groups);
        base + (angle_idx * num_groups + group_idx) * nodes + node
    }
}

/// Group- and angle-independent upstream-flux index mapping for one SPDS.
#[derive(Debug)]
pub struct FludsTemplate {
    pub spds: Arc<Spds>,
    face_role: Vec<Vec<FaceRole>>,
    local_bank: Bank,
    delayed_local_bank: Bank,
    /// `(rank, bank)` per non-delayed successor, ascending by rank.
    send_banks: Vec<(usize, Bank)>,
    delayed_send_banks: Vec<(usize, Bank)>,
    /// `(rank, bank)` per non-delayed predecessor, ascending by rank.
    recv_banks: Vec<(usize, Bank)>,
    delayed_recv_banks: Vec<(usize, Bank)>,
}

/// An outbound ghost face gathered during the template walk.
struct GhostFace {
    cell_lid: u32,
    face: usize,
    upstream_gid: u64,
    centroid: [f64; 3],
    nodes: usize,
}

fn sort_ghost_faces(faces: &mut [GhostFace]) {
    faces.sort_by(|a, b| {
        a.upstream_gid
            .cmp(&b.upstream_gid)
            .then_with(|| lex_cmp(a.centroid, b.centroid, 1e-12))
    });
}

/// Matches every node of `face` to a node of the upstream cell's coincident
/// face; returns the upstream face's node positions.
fn node_permutation(
    grid: &GridView,
    cell: &Cell,
    face_idx: usize,
    upstream: &Cell,
) -> Result<(usize, Vec<u8>)> {
    let face = &cell.faces[face_idx];
    let tol = 1e-12 * cell.diameter(grid).max(1.0);
    let upstream_face_idx = upstream
        .faces
        .iter()
        .position(|g| points_coincide(g.centroid, face.centroid, tol))
        .ok_or_else(|| {
            SweepError::BadGeometry(format!(
                "no face of cell {} matches a face of cell {}",
                upstream.global_id, cell.global_id
            ))
        })?;
    let upstream_face = &upstream.faces[upstream_face_idx];
    let mut node_map = Vec::with_capacity(face.nodes.len());
    for &n in &face.nodes {
        let p = grid.nodes[n];
        let j = upstream_face
            .nodes
            .iter()
            .position(|&m| points_coincide(grid.nodes[m], p, tol))
            .ok_or_else(|| {
                SweepError::BadGeometry(format!(
                    "node of face {face_idx} of cell {} has no match on cell {}",
                    cell.global_id, upstream.global_id
                ))
            })?;
        node_map.push(j as u8);
    }
    Ok((upstream_face_idx, node_map))
}

impl FludsTemplate {
    /// Builds the template of one SPDS.
    pub fn build(spds: Arc<Spds>, grid: &GridView, histogram: &FaceHistogram) -> Result<Self> {
        let mut face_role: Vec<Vec<FaceRole>> = grid
            .local_cells
            .iter()
            .map(|c| vec![FaceRole::None; c.faces.len()])
            .collect();

        let mut local_bank = Bank::default();
        local_bank.bases.reserve(histogram.num_faces() / 2);
        let mut delayed_local_bank = Bank::default();
        let mut ghost_out: Vec<(usize, Vec<GhostFace>)> = spds
            .location_successors
            .iter()
            .map(|&r| (r, Vec::new()))
            .collect();
        let mut delayed_ghost_out: Vec<(usize, Vec<GhostFace>)> = spds
            .delayed_location_successors
            .iter()
            .map(|&r| (r, Vec::new()))
            .collect();

        // First pass: walk the SPLS and give every outgoing face a slot.
        // Local slots are handed out in sweep order, so an upstream cell's
        // slot always exists by the time a downstream cell reads it within
        // the same sweep.
        for &cell_lid in &spds.spls {
            let cell = &grid.local_cells[cell_lid as usize];
            for (f, face) in cell.faces.iter().enumerate() {
                if spds.cell_face_orientations[cell_lid as usize][f] != FaceOrientation::Outgoing
                {
                    if let Neighbor::Boundary(boundary_id) = face.neighbor {
                        face_role[cell_lid as usize][f] = FaceRole::Boundary { boundary_id };
                    }
                    continue;
                }
                match face.neighbor {
                    Neighbor::Local(nlid) => {
                        if spds.is_delayed_local_arc(cell_lid, nlid) {
                            let slot = delayed_local_bank.push_slot(face.nodes.len());
                            face_role[cell_lid as usize][f] = FaceRole::OutDelayedLocal { slot };
                        } else {
                            let slot = local_bank.push_slot(face.nodes.len());
                            face_role[cell_lid as usize][f] = FaceRole::OutLocal { slot };
                        }
                    }
                    Neighbor::Ghost { rank, .. } => {
                        let ghost_face = GhostFace {
                            cell_lid,
                            face: f,
                            upstream_gid: cell.global_id,
                            centroid: face.centroid,
                            nodes: face.nodes.len(),
                        };
                        let list = ghost_out
                            .iter_mut()
                            .find(|(r, _)| *r == rank as usize)
                            .map(|(_, l)| l)
                            .or_else(|| {
                                delayed_ghost_out
                                    .iter_mut()
                                    .find(|(r, _)| *r == rank as usize)
                                    .map(|(_, l)| l)
                            })
                            .ok_or_else(|| {
                                SweepError::PartitionPathology {
                                    rank: rank as usize,
                                }
                            })
                            .context("outgoing ghost face to a rank missing from the SPDS")?;
                        list.push(ghost_face);
                    }
                    Neighbor::Boundary(boundary_id) => {
                        face_role[cell_lid as usize][f] = FaceRole::Boundary { boundary_id };
                    }
                }
            }
        }

        // Deterministic send layout per destination rank.
        let mut send_banks = Vec::with_capacity(ghost_out.len());
        for (rank, mut faces) in ghost_out {
            sort_ghost_faces(&mut faces);
            let mut bank = Bank::default();
            for gf in faces {
                let slot = bank.push_slot(gf.nodes);
                face_role[gf.cell_lid as usize][gf.face] = FaceRole::OutGhost {
                    succ: send_banks.len() as u32,
                    slot,
                };
            }
            send_banks.push((rank, bank));
        }
        let mut delayed_send_banks = Vec::with_capacity(delayed_ghost_out.len());
        for (rank, mut faces) in delayed_ghost_out {
            sort_ghost_faces(&mut faces);
            let mut bank = Bank::default();
            for gf in faces {
                let slot = bank.push_slot(gf.nodes);
                face_role[gf.cell_lid as usize][gf.face] = FaceRole::OutDelayedGhost {
                    succ: delayed_send_banks.len() as u32,
                    slot,
                };
            }
            delayed_send_banks.push((rank, bank));
        }

        // Second pass: resolve incoming faces. Local upstream slots exist
        // by now (delayed ones included), and the receive layouts are
        // rebuilt from the sender's ordering rule.
        let mut ghost_in: Vec<(usize, Vec<GhostFace>)> = spds
            .location_predecessors
            .iter()
            .map(|&r| (r, Vec::new()))
            .collect();
        let mut delayed_ghost_in: Vec<(usize, Vec<GhostFace>)> = spds
            .delayed_location_predecessors
            .iter()
            .map(|&r| (r, Vec::new()))
            .collect();
        for cell in &grid.local_cells {
            let cell_lid = cell.local_id;
            for (f, face) in cell.faces.iter().enumerate() {
                if spds.cell_face_orientations[cell_lid as usize][f] != FaceOrientation::Incoming
                {
                    continue;
                }
                match face.neighbor {
                    Neighbor::Local(nlid) => {
                        let upstream = &grid.local_cells[nlid as usize];
                        let (upstream_face, node_map) =
                            node_permutation(grid, cell, f, upstream)?;
                        let delayed = spds.is_delayed_local_arc(nlid, cell_lid);
                        let slot = match &face_role[nlid as usize][upstream_face] {
                            FaceRole::OutLocal { slot } if !delayed => *slot,
                            FaceRole::OutDelayedLocal { slot } if delayed => *slot,
                            other => {
                                return Err(SweepError::BadGeometry(format!(
                                    "upstream face of cell {} has inconsistent role {other:?}",
                                    upstream.global_id
                                ))
                                .into())
                            }
                        };
                        face_role[cell_lid as usize][f] = if delayed {
                            FaceRole::InDelayedLocal { slot, node_map }
                        } else {
                            FaceRole::InLocal { slot, node_map }
                        };
                    }
                    Neighbor::Ghost { rank, global_id } => {
                        let ghost = grid.ghost_cell(global_id).ok_or_else(|| {
                            SweepError::BadGeometry(format!(
                                "no ghost copy of cell {global_id} on rank {}",
                                grid.rank
                            ))
                        })?;
                        let list = ghost_in
                            .iter_mut()
                            .find(|(r, _)| *r == rank as usize)
                            .map(|(_, l)| l)
                            .or_else(|| {
                                delayed_ghost_in
                                    .iter_mut()
                                    .find(|(r, _)| *r == rank as usize)
                                    .map(|(_, l)| l)
                            })
                            .ok_or_else(|| {
                                SweepError::PartitionPathology {
                                    rank: rank as usize,
                                }
                            })
                            .context("incoming ghost face from a rank missing from the SPDS")?;
                        list.push(GhostFace {
                            cell_lid,
                            face: f,
                            upstream_gid: ghost.global_id,
                            centroid: face.centroid,
                            nodes: face.nodes.len(),
                        });
                    }
                    Neighbor::Boundary(boundary_id) => {
                        face_role[cell_lid as usize][f] = FaceRole::Boundary { boundary_id };
                    }
                }
            }
        }

        let mut recv_banks = Vec::with_capacity(ghost_in.len());
        for (rank, mut faces) in ghost_in {
            sort_ghost_faces(&mut faces);
            let mut bank = Bank::default();
            for gf in faces {
                let cell = &grid.local_cells[gf.cell_lid as usize];
                let ghost = grid.ghost_cell(gf.upstream_gid).unwrap();
                let (_, node_map) = node_permutation(grid, cell, gf.face, ghost)?;
                let slot = bank.push_slot(gf.nodes);
                face_role[gf.cell_lid as usize][gf.face] = FaceRole::InGhost {
                    pred: recv_banks.len() as u32,
                    slot,
                    node_map,
                };
            }
            recv_banks.push((rank, bank));
        }
        let mut delayed_recv_banks = Vec::with_capacity(delayed_ghost_in.len());
        for (rank, mut faces) in delayed_ghost_in {
            sort_ghost_faces(&mut faces);
            let mut bank = Bank::default();
            for gf in faces {
                let cell = &grid.local_cells[gf.cell_lid as usize];
                let ghost = grid.ghost_cell(gf.upstream_gid).unwrap();
                let (_, node_map) = node_permutation(grid, cell, gf.face, ghost)?;
                let slot = bank.push_slot(gf.nodes);
                face_role[gf.cell_lid as usize][gf.face] = FaceRole::InDelayedGhost {
                    pred: delayed_recv_banks.len() as u32,
                    slot,
                    node_map,
                };
            }
            delayed_recv_banks.push((rank, bank));
        }

        Ok(FludsTemplate {
            spds,
            face_role,
            local_bank,
            delayed_local_bank,
            send_banks,
            delayed_send_banks,
            recv_banks,
            delayed_recv_banks,
        })
    }

    pub fn role(&self, cell_lid: u32, face: usize) -> &FaceRole {
        &self.face_role[cell_lid as usize][face]
    }
}

/// Group- and angle-scaled flux storage built from a template.
pub struct Fluds {
    pub template: Arc<FludsTemplate>,
    num_groups: usize,
    num_angles: usize,
    local_psi: Vec<f64>,
    delayed_local_prev: Vec<f64>,
    delayed_local_curr: Vec<f64>,
    send_bufs: Vec<Vec<f64>>,
    delayed_send_bufs: Vec<Vec<f64>>,
    recv_bufs: Vec<Vec<f64>>,
    delayed_recv_old: Vec<Vec<f64>>,
    delayed_recv_new: Vec<Vec<f64>>,
}

impl Fluds {
    pub fn new(template: Arc<FludsTemplate>, num_groups: usize, num_angles: usize) -> Self {
        let scale = |bank: &Bank| vec![0.0; bank.total_doubles(num_groups, num_angles)];
        Fluds {
            num_groups,
            num_angles,
            local_psi: scale(&template.local_bank),
            delayed_local_prev: scale(&template.delayed_local_bank),
            delayed_local_curr: scale(&template.delayed_local_bank),
            send_bufs: template.send_banks.iter().map(|(_, b)| scale(b)).collect(),
            delayed_send_bufs: template
                .delayed_send_banks
                .iter()
                .map(|(_, b)| scale(b))
                .collect(),
            recv_bufs: template.recv_banks.iter().map(|(_, b)| scale(b)).collect(),
            delayed_recv_old: template
                .delayed_recv_banks
                .iter()
                .map(|(_, b)| scale(b))
                .collect(),
            delayed_recv_new: template
                .delayed_recv_banks
                .iter()
                .map(|(_, b)| scale(b))
                .collect(),
            template,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn num_angles(&self) -> usize {
        self.num_angles
    }

    /// Upwind flux behind an incoming face role, `node` being the position
    /// within the reader's face node list.
    pub fn upwind_psi(
        &self,
        role: &FaceRole,
        angle_idx: usize,
        group_idx: usize,
        node: usize,
    ) -> f64 {
        let (g, a) = (self.num_groups, self.num_angles);
        match role {
            FaceRole::InLocal { slot, node_map } => {
                let addr = self.template.local_bank.addr(
                    *slot,
                    angle_idx,
                    group_idx,
                    node_map[node] as usize,
                    g,
                    a,
                );
                self.local_psi[addr]
            }
            FaceRole::InDelayedLocal { slot, node_map } => {
                let addr = self.template.delayed_local_bank.addr(
                    *slot,
                    angle_idx,
                    group_idx,
                    node_map[node] as usize,
                    g,
                    a,
                );
                self.delayed_local_prev[addr]
            }
            FaceRole::InGhost {
                pred,
                slot,
                node_map,
            } => {
                let bank = &self.template.recv_banks[*pred as usize].1;
                let addr = bank.addr(*slot, angle_idx, group_idx, node_map[node] as usize, g, a);
                self.recv_bufs[*pred as usize][addr]
            }
            FaceRole::InDelayedGhost {
                pred,
                slot,
                node_map,
            } => {
                let bank = &self.template.delayed_recv_banks[*pred as usize].1;
                let addr = bank.addr(*slot, angle_idx, group_idx, node_map[node] as usize, g, a);
                self.delayed_recv_old[*pred as usize][addr]
            }
            _ => unreachable!("upwind read through a non-incoming face role"),
        }
    }

    /// Stores outgoing flux behind an outgoing face role, `node` being the
    /// position within the writer's face node list.
    pub fn write_outgoing(
        &mut self,
        role: &FaceRole,
        angle_idx: usize,
        group_idx: usize,
        node: usize,
        value: f64,
    ) {
        let (g, a) = (self.num_groups, self.num_angles);
        match role {
            FaceRole::OutLocal { slot } => {
                let addr = self
                    .template
                    .local_bank
                    .addr(*slot, angle_idx, group_idx, node, g, a);
                self.local_psi[addr] = value;
            }
            FaceRole::OutDelayedLocal { slot } => {
                let addr = self
                    .template
                    .delayed_local_bank
                    .addr(*slot, angle_idx, group_idx, node, g, a);
                self.delayed_local_curr[addr] = value;
            }
            FaceRole::OutGhost { succ, slot } => {
                let bank = &self.template.send_banks[*succ as usize].1;
                let addr = bank.addr(*slot, angle_idx, group_idx, node, g, a);
                self.send_bufs[*succ as usize][addr] = value;
            }
            FaceRole::OutDelayedGhost { succ, slot } => {
                let bank = &self.template.delayed_send_banks[*succ as usize].1;
                let addr = bank.addr(*slot, angle_idx, group_idx, node, g, a);
                self.delayed_send_bufs[*succ as usize][addr] = value;
            }
            _ => unreachable!("outgoing write through a non-outgoing face role"),
        }
    }

    pub fn num_successors(&self) -> usize {
        self.template.send_banks.len()
    }

    pub fn successor_rank(&self, i: usize) -> usize {
        self.template.send_banks[i].0
    }

    pub fn send_payload(&self, i: usize) -> &[f64] {
        &self.send_bufs[i]
    }

    pub fn num_delayed_successors(&self) -> usize {
        self.template.delayed_send_banks.len()
    }

    pub fn delayed_successor_rank(&self, i: usize) -> usize {
        self.template.delayed_send_banks[i].0
    }

    pub fn delayed_send_payload(&self, i: usize) -> &[f64] {
        &self.delayed_send_bufs[i]
    }

    pub fn num_predecessors(&self) -> usize {
        self.template.recv_banks.len()
    }

    pub fn predecessor_rank(&self, i: usize) -> usize {
        self.template.recv_banks[i].0
    }

    pub fn recv_expected(&self, i: usize) -> usize {
        self.template.recv_banks[i]
            .1
            .total_doubles(self.num_groups, self.num_angles)
    }

    /// Copies a received part into the prelocal buffer at `offset`.
    pub fn fill_recv(&mut self, i: usize, offset: usize, part: &[f64]) {
        self.recv_bufs[i][offset..offset + part.len()].copy_from_slice(part);
    }

    pub fn num_delayed_predecessors(&self) -> usize {
        self.template.delayed_recv_banks.len()
    }

    pub fn delayed_predecessor_rank(&self, i: usize) -> usize {
        self.template.delayed_recv_banks[i].0
    }

    pub fn delayed_recv_expected(&self, i: usize) -> usize {
        self.template.delayed_recv_banks[i]
            .1
            .total_doubles(self.num_groups, self.num_angles)
    }

    /// Copies a received delayed part into the *next-iteration* buffer.
    pub fn fill_delayed_recv(&mut self, i: usize, offset: usize, part: &[f64]) {
        self.delayed_recv_new[i][offset..offset + part.len()].copy_from_slice(part);
    }

    /// End-of-iteration roll: current delayed data becomes next iteration's
    /// lagged data.
    pub fn reset(&mut self) {
        std::mem::swap(&mut self.delayed_local_prev, &mut self.delayed_local_curr);
        std::mem::swap(&mut self.delayed_recv_old, &mut self.delayed_recv_new);
    }
}
