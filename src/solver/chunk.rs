/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The piecewise-linear DFEM transport kernel.
//!
//! For every cell of the SPLS, every angle of the set and every group of
//! the subset, the chunk assembles the upwind cell system
//!
//! ```text
//!   A = Ω·G + σ_t M + Σ_{incoming f} |μ_f| M_surf[f]
//!   b = M·q + Σ_{incoming f} |μ_f| M_surf[f]·ψ_upwind
//! ```
//!
//! solves it by dense Gaussian elimination, runs the pre-bound flux-update
//! kernels (scalar-flux accumulation, optional angular-flux capture) and
//! pushes the outgoing face traces into the FLUDS or the boundary.

use super::CrossSections;
use crate::fe::PwlDiscretization;
use crate::math::{dot, gauss_elimination};
use crate::mesh::GridView;
use crate::quadrature::AngularQuadrature;
use crate::sweep::chunk::{SweepChunk, SweepSlice};
use crate::sweep::fluds::FaceRole;
use crate::sweep::spds::FaceOrientation;
use anyhow::{Context, Result};

/// Context handed to every flux-update kernel after a cell-angle solve.
pub struct FluxUpdateContext<'c> {
    pub cell_local_id: u32,
    pub node_base: usize,
    pub num_nodes: usize,
    /// Global direction index.
    pub direction: usize,
    pub weight: f64,
    pub gs_ss_begin: usize,
    /// Solved nodal ψ per subset group.
    pub psi_cell: &'c [Vec<f64>],
}

/// A pre-bound flux-update phase.
pub type FluxUpdateKernel = fn(&mut DfemSweepChunk<'_>, &FluxUpdateContext<'_>);

fn update_scalar_flux(chunk: &mut DfemSweepChunk<'_>, ctx: &FluxUpdateContext<'_>) {
    for (gsg, psi_nodes) in ctx.psi_cell.iter().enumerate() {
        let g = ctx.gs_ss_begin + gsg;
        for (node, &psi) in psi_nodes.iter().enumerate() {
            chunk.phi[(ctx.node_base + node) * chunk.num_groups + g] += ctx.weight * psi;
        }
    }
}

fn save_angular_flux(chunk: &mut DfemSweepChunk<'_>, ctx: &FluxUpdateContext<'_>) {
    let num_angles = chunk.quadrature.num_angles();
    let psi_store = chunk.psi.as_deref_mut().expect("angular flux capture without storage");
    for (gsg, psi_nodes) in ctx.psi_cell.iter().enumerate() {
        let g = ctx.gs_ss_begin + gsg;
        for (node, &psi) in psi_nodes.iter().enumerate() {
            let addr =
                ((ctx.node_base + node) * num_angles + ctx.direction) * chunk.num_groups + g;
            psi_store[addr] = psi;
        }
    }
}

/// The production sweep chunk. Borrows everything for the duration of one
/// sweep; re-entrant per angle-set, no state survives a call.
pub struct DfemSweepChunk<'a> {
    pub grid: &'a GridView,
    pub pwl: &'a PwlDiscretization,
    pub materials: &'a [CrossSections],
    pub quadrature: &'a AngularQuadrature,
    /// Per-dof isotropic angular source, `(node dof) × group` layout.
    pub q_moments: &'a [f64],
    /// Scalar-flux accumulator, `(node dof) × group` layout.
    pub phi: &'a mut [f64],
    /// Optional angular-flux capture, `(node dof) × angle × group` layout.
    pub psi: Option<&'a mut [f64]>,
    /// Global group count (the φ stride).
    pub num_groups: usize,
    /// Whether fixed surface sources (incident boundaries) feed this sweep.
    /// Krylov operator applications must suppress them so the swept
    /// operator stays linear; reflecting boundaries remain active either
    /// way since they couple unknowns.
    pub surface_source_active: bool,
    flux_kernels: Vec<FluxUpdateKernel>,
}

impl<'a> DfemSweepChunk<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grid: &'a GridView,
        pwl: &'a PwlDiscretization,
        materials: &'a [CrossSections],
        quadrature: &'a AngularQuadrature,
        q_moments: &'a [f64],
        phi: &'a mut [f64],
        psi: Option<&'a mut [f64]>,
        num_groups: usize,
        surface_source_active: bool,
    ) -> Self {
        // Pre-bind the flux-update phases so the inner loop dispatches
        // through a flat list instead of branching.
        let mut flux_kernels: Vec<FluxUpdateKernel> = vec![update_scalar_flux];
        if psi.is_some() {
            flux_kernels.push(save_angular_flux);
        }
        DfemSweepChunk {
            grid,
            pwl,
            materials,
            quadrature,
            q_moments,
            phi,
            psi,
            num_groups,
            surface_source_active,
            flux_kernels,
        }
    }
}

impl SweepChunk for DfemSweepChunk<'_> {
    fn sweep(&mut self, slice: SweepSlice<'_>) -> Result<()> {
        let SweepSlice {
            spds,
            fluds,
            angles,
            gs_ss_begin,
            boundaries,
            ..
        } = slice;
        let gs_ss_size = fluds.num_groups();
        let flux_kernels = self.flux_kernels.clone();
        // Detach the shared references from `self` so the flux-update
        // kernels can borrow `self` mutably mid-cell.
        let (grid, pwl, materials, quadrature, q_moments, num_groups, surface_source_active) = (
            self.grid,
            self.pwl,
            self.materials,
            self.quadrature,
            self.q_moments,
            self.num_groups,
            self.surface_source_active,
        );

        for &cell_lid in &spds.spls {
            let cell = &grid.local_cells[cell_lid as usize];
            let mapping = &pwl.mappings[cell_lid as usize];
            let ucm = &pwl.unit_matrices[cell_lid as usize];
            let num_nodes = mapping.num_nodes();
            let node_base = pwl.node_base[cell_lid as usize];
            let xs = materials
                .get(cell.material_id as usize)
                .with_context(|| format!("no cross sections for material {}", cell.material_id))?;
            let orientations = &spds.cell_face_orientations[cell_lid as usize];

            for (as_idx, &direction) in angles.iter().enumerate() {
                let omega = quadrature.omega(direction);
                let weight = quadrature.weight(direction);

                // Directional gradient and incoming-surface operators are
                // group independent.
                let mut a_dir = vec![vec![0.0; num_nodes]; num_nodes];
                for i in 0..num_nodes {
                    for j in 0..num_nodes {
                        a_dir[i][j] = dot(
                            omega,
                            [
                                ucm.intv_gradshape_shape[0][i][j],
                                ucm.intv_gradshape_shape[1][i][j],
                                ucm.intv_gradshape_shape[2][i][j],
                            ],
                        );
                    }
                }

                // Surface integrals over incoming faces: stiffen A and
                // collect the upwind contribution to b per group.
                let mut b_in = vec![vec![0.0; num_nodes]; gs_ss_size];
                for (f, face) in cell.faces.iter().enumerate() {
                    if orientations[f] != FaceOrientation::Incoming {
                        continue;
                    }
                    let mu_mag = dot(omega, face.normal).abs();
                    let face_nodes = &mapping.face_node_mapping[f];
                    let m_surf = &ucm.ints_shape_shape[f];
                    for &i in face_nodes {
                        for &j in face_nodes {
                            a_dir[i][j] += mu_mag * m_surf[i][j];
                        }
                    }
                    let role = fluds.template.role(cell_lid, f).clone();
                    for gsg in 0..gs_ss_size {
                        let g = gs_ss_begin + gsg;
                        for (node_pos, &j) in face_nodes.iter().enumerate() {
                            let psi_upwind = match &role {
                                FaceRole::Boundary { boundary_id } => boundaries
                                    .get(boundary_id)
                                    .filter(|b| {
                                        surface_source_active || !b.is_fixed_surface_source()
                                    })
                                    .map(|b| {
                                        b.psi_incoming(direction, cell_lid, f, node_pos, g)
                                    })
                                    .unwrap_or(0.0),
                                incoming => fluds.upwind_psi(incoming, as_idx, gsg, node_pos),
                            };
                            for &i in face_nodes {
                                b_in[gsg][i] += mu_mag * m_surf[i][j] * psi_upwind;
                            }
                        }
                    }
                }

                // Per-group assembly and dense solve.
                let mut psi_cell: Vec<Vec<f64>> = Vec::with_capacity(gs_ss_size);
                for gsg in 0..gs_ss_size {
                    let g = gs_ss_begin + gsg;
                    let sigma_tg = xs.sigma_t[g];
                    let mut a = a_dir.clone();
                    let mut b = b_in[gsg].clone();
                    for i in 0..num_nodes {
                        for j in 0..num_nodes {
                            a[i][j] += sigma_tg * ucm.intv_shape_shape[i][j];
                            b[i] += ucm.intv_shape_shape[i][j]
                                * q_moments[(node_base + j) * num_groups + g];
                        }
                    }
                    gauss_elimination(&mut a, &mut b)
                        .with_context(|| format!("cell {} group {g}", cell.global_id))?;
                    psi_cell.push(b);
                }

                let ctx = FluxUpdateContext {
                    cell_local_id: cell_lid,
                    node_base,
                    num_nodes,
                    direction,
                    weight,
                    gs_ss_begin,
                    psi_cell: &psi_cell,
                };
                for kernel in &flux_kernels {
                    kernel(self, &ctx);
                }

                // Outgoing surface operations: push face traces downstream.
                for f in 0..cell.faces.len() {
                    if orientations[f] != FaceOrientation::Outgoing {
                        continue;
                    }
                    let face_nodes = &mapping.face_node_mapping[f];
                    let role = fluds.template.role(cell_lid, f).clone();
                    match &role {
                        FaceRole::Boundary { boundary_id } => {
                            if let Some(boundary) = boundaries.get_mut(boundary_id) {
                                if boundary.is_reflecting() {
                                    for gsg in 0..gs_ss_size {
                                        let g = gs_ss_begin + gsg;
                                        for (node_pos, &j) in face_nodes.iter().enumerate() {
                                            boundary.set_outgoing(
                                                direction,
                                                cell_lid,
                                                f,
                                                node_pos,
                                                g,
                                                psi_cell[gsg][j],
                                            );
                                        }
                                    }
                                }
                            }
                        }
                        outgoing => {
                            for gsg in 0..gs_ss_size {
                                for (node_pos, &j) in face_nodes.iter().enumerate() {
                                    fluds.write_outgoing(
                                        outgoing,
                                        as_idx,
                                        gsg,
                                        node_pos,
                                        psi_cell[gsg][j],
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
