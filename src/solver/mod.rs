/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The discrete-ordinates solver layer.
//!
//! A [`DiscreteOrdinatesSolver`] owns the spatial discretization, the flux
//! unknowns and the groupsets, and drives one sweep scheduler per groupset
//! through the configured outer iterative method. The sweep core below it
//! never sees groups outside the groupset being solved.

pub mod chunk;
pub mod iterative;

pub use chunk::DfemSweepChunk;

use crate::comm::Communicator;
use crate::errors::SweepError;
use crate::fe::PwlDiscretization;
use crate::mesh::GridView;
use crate::quadrature::{associate_directions, AngleAggregation, AngularQuadrature};
use crate::sweep::angle_set::AngleSet;
use crate::sweep::boundary::{BoundaryMap, ReflectingBoundary, SweepBoundary};
use crate::sweep::fluds::{Fluds, FludsTemplate};
use crate::sweep::scheduler::{SweepScheduler, SweepStats};
use crate::sweep::spds::build_spds_set;
use anyhow::{Context, Result};
use dsi_progress_logger::ProgressLog;
use log::info;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// Per-material, per-group cross sections: total plus isotropic
/// within-group scattering.
#[derive(Debug, Clone)]
pub struct CrossSections {
    pub sigma_t: Vec<f64>,
    pub sigma_s: Vec<f64>,
}

impl CrossSections {
    pub fn new(sigma_t: Vec<f64>, sigma_s: Vec<f64>) -> Self {
        CrossSections { sigma_t, sigma_s }
    }

    /// A pure absorber.
    pub fn absorber(sigma_t: Vec<f64>) -> Self {
        let sigma_s = vec![0.0; sigma_t.len()];
        CrossSections { sigma_t, sigma_s }
    }
}

/// The outer iterative method of a groupset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterativeMethod {
    ClassicRichardson,
    Gmres { restart: usize },
}

/// An outer-iteration unit: an energy-group range, its quadrature and its
/// sweep configuration.
#[derive(Clone)]
pub struct Groupset {
    pub groups: Range<usize>,
    pub quadrature: Arc<AngularQuadrature>,
    pub aggregation: AngleAggregation,
    /// Upper bound on directions per angle-set after aggregation.
    pub angles_per_set: usize,
    pub allow_cycles: bool,
    pub method: IterativeMethod,
    pub tolerance: f64,
    pub max_iterations: usize,
}

/// User-level boundary prescriptions, turned into sweep boundaries per
/// groupset quadrature.
#[derive(Debug, Clone)]
pub enum BoundaryCondition {
    Vacuum,
    /// Incident isotropic angular flux per group.
    IsotropicIncident(Vec<f64>),
    Reflecting,
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Capture ψ for the [`AngularFluxAccessor`].
    pub save_angular_flux: bool,
    /// Message split threshold, in doubles.
    pub max_message_size: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            save_angular_flux: false,
            max_message_size: 65536,
        }
    }
}

/// Outcome of one groupset solve.
#[derive(Debug, Clone)]
pub struct SolveInfo {
    pub converged: bool,
    pub iterations: usize,
    pub pointwise_change: f64,
    pub stats: SweepStats,
}

/// Read-only view of the captured angular flux, indexed by
/// `(cell_local_id, node, angle, group)`.
pub struct AngularFluxAccessor<'s> {
    psi: &'s [f64],
    node_base: &'s [usize],
    num_angles: usize,
    num_groups: usize,
}

impl AngularFluxAccessor<'_> {
    pub fn psi(&self, cell_local_id: u32, node: usize, angle: usize, group: usize) -> f64 {
        let dof = self.node_base[cell_local_id as usize] + node;
        self.psi[(dof * self.num_angles + angle) * self.num_groups + group]
    }
}

pub struct DiscreteOrdinatesSolver<'a, C: Communicator> {
    grid: &'a GridView,
    comm: &'a C,
    num_groups: usize,
    materials: Vec<CrossSections>,
    boundary_conditions: BTreeMap<u64, BoundaryCondition>,
    options: SolverOptions,
    groupsets: Vec<Groupset>,
    pwl: PwlDiscretization,
    /// Isotropic volumetric source per `(cell, group)`.
    fixed_source: Vec<f64>,
    phi_old: Vec<f64>,
    phi_new: Vec<f64>,
    q_moments: Vec<f64>,
    psi: Option<Vec<f64>>,
    psi_num_angles: usize,
}

impl<'a, C: Communicator> DiscreteOrdinatesSolver<'a, C> {
    pub fn new(
        grid: &'a GridView,
        comm: &'a C,
        num_groups: usize,
        materials: Vec<CrossSections>,
        boundary_conditions: BTreeMap<u64, BoundaryCondition>,
        options: SolverOptions,
    ) -> Result<Self> {
        if num_groups == 0 {
            return Err(
                SweepError::InvalidConfiguration("zero energy groups".to_string()).into(),
            );
        }
        for (m, xs) in materials.iter().enumerate() {
            if xs.sigma_t.len() != num_groups || xs.sigma_s.len() != num_groups {
                return Err(SweepError::InvalidConfiguration(format!(
                    "material {m} has cross sections for {} groups, expected {num_groups}",
                    xs.sigma_t.len()
                ))
                .into());
            }
        }
        for cell in &grid.local_cells {
            if cell.material_id as usize >= materials.len() {
                return Err(SweepError::InvalidConfiguration(format!(
                    "cell {} references undefined material {}",
                    cell.global_id, cell.material_id
                ))
                .into());
            }
        }
        let pwl = PwlDiscretization::build(grid).context("building spatial discretization")?;
        let num_dofs = pwl.num_nodal_dofs();
        Ok(DiscreteOrdinatesSolver {
            grid,
            comm,
            num_groups,
            materials,
            boundary_conditions,
            options,
            groupsets: Vec::new(),
            fixed_source: vec![0.0; grid.num_local_cells() * num_groups],
            phi_old: vec![0.0; num_dofs * num_groups],
            phi_new: vec![0.0; num_dofs * num_groups],
            q_moments: vec![0.0; num_dofs * num_groups],
            psi: None,
            psi_num_angles: 0,
            pwl,
        })
    }

    pub fn add_groupset(&mut self, groupset: Groupset) -> Result<()> {
        if groupset.groups.end > self.num_groups || groupset.groups.is_empty() {
            return Err(SweepError::InvalidConfiguration(format!(
                "groupset range {:?} outside 0..{}",
                groupset.groups, self.num_groups
            ))
            .into());
        }
        if groupset.angles_per_set == 0 {
            return Err(SweepError::InvalidConfiguration(
                "angles_per_set must be positive".to_string(),
            )
            .into());
        }
        if groupset.quadrature.num_angles() == 0 {
            return Err(
                SweepError::InvalidConfiguration("empty quadrature".to_string()).into(),
            );
        }
        if matches!(groupset.method, IterativeMethod::Gmres { .. })
            && self
                .boundary_conditions
                .values()
                .any(|bc| matches!(bc, BoundaryCondition::Reflecting))
        {
            // The reflected angular unknowns are not part of the Krylov
            // vector, so the swept operator would not be linear in it.
            return Err(SweepError::InvalidConfiguration(
                "GMRES cannot be combined with reflecting boundaries".to_string(),
            )
            .into());
        }
        self.groupsets.push(groupset);
        Ok(())
    }

    /// Sets the isotropic volumetric source of one cell and group.
    pub fn set_fixed_source(&mut self, cell_local_id: u32, group: usize, value: f64) {
        self.fixed_source[cell_local_id as usize * self.num_groups + group] = value;
    }

    /// Scalar flux, `(node dof) × group` layout.
    pub fn phi(&self) -> &[f64] {
        &self.phi_old
    }

    pub fn phi_at(&self, cell_local_id: u32, node: usize, group: usize) -> f64 {
        let dof = self.pwl.node_base[cell_local_id as usize] + node;
        self.phi_old[dof * self.num_groups + group]
    }

    pub fn discretization(&self) -> &PwlDiscretization {
        &self.pwl
    }

    /// The captured angular flux, if the solver was configured to save it.
    pub fn angular_flux(&self) -> Option<AngularFluxAccessor<'_>> {
        self.psi.as_ref().map(|psi| AngularFluxAccessor {
            psi,
            node_base: &self.pwl.node_base,
            num_angles: self.psi_num_angles,
            num_groups: self.num_groups,
        })
    }

    /// Builds the sweep infrastructure of one groupset: direction groups,
    /// SPDS set, FLUDS templates, angle-sets and boundaries.
    fn build_scheduler(
        &self,
        groupset: &Groupset,
        pl: &mut impl ProgressLog,
    ) -> Result<SweepScheduler<'a, C>> {
        let direction_groups = associate_directions(&groupset.quadrature, groupset.aggregation);
        let master_omegas: Vec<[f64; 3]> = direction_groups
            .iter()
            .map(|g| groupset.quadrature.omega(g.master_direction))
            .collect();
        let spds_set = build_spds_set(
            self.grid,
            &master_omegas,
            groupset.allow_cycles,
            self.comm,
            pl,
        )?;

        let histogram = self.grid.face_histogram();
        let templates: Vec<Arc<FludsTemplate>> = spds_set
            .par_iter()
            .map(|spds| FludsTemplate::build(spds.clone(), self.grid, &histogram).map(Arc::new))
            .collect::<Result<_>>()?;

        let gs_size = groupset.groups.len();
        let mut angle_sets = Vec::new();
        for (group_idx, direction_group) in direction_groups.iter().enumerate() {
            for aggregated in &direction_group.angle_sets {
                for dirs in aggregated.chunks(groupset.angles_per_set) {
                    let template = templates[group_idx].clone();
                    let fluds = Fluds::new(template, gs_size, dirs.len());
                    angle_sets.push(AngleSet::new(
                        angle_sets.len(),
                        dirs.to_vec(),
                        spds_set[group_idx].clone(),
                        fluds,
                        groupset.groups.start,
                        self.options.max_message_size,
                    ));
                }
            }
        }

        let mut boundaries: BoundaryMap = BTreeMap::new();
        for &bid in &self.grid.boundary_ids {
            let condition = self
                .boundary_conditions
                .get(&bid)
                .cloned()
                .unwrap_or(BoundaryCondition::Vacuum);
            let boundary = match condition {
                BoundaryCondition::Vacuum => SweepBoundary::Vacuum,
                BoundaryCondition::IsotropicIncident(strength) => {
                    if strength.len() != self.num_groups {
                        return Err(SweepError::InvalidConfiguration(format!(
                            "incident boundary {bid} prescribes {} groups, expected {}",
                            strength.len(),
                            self.num_groups
                        ))
                        .into());
                    }
                    SweepBoundary::IsotropicIncident { strength }
                }
                BoundaryCondition::Reflecting => {
                    if bid > 5 {
                        return Err(SweepError::InvalidConfiguration(format!(
                            "reflecting boundary {bid} is not an orthogonal plane"
                        ))
                        .into());
                    }
                    let axis = (bid / 2) as usize;
                    SweepBoundary::Reflecting(ReflectingBoundary::new(
                        self.grid,
                        bid,
                        &groupset.quadrature,
                        axis,
                        self.num_groups,
                    )?)
                }
            };
            boundaries.insert(bid, boundary);
        }

        Ok(SweepScheduler::new(self.comm, angle_sets, boundaries))
    }

    /// Builds the source moments of a groupset: fixed source plus
    /// within-group scattering from the latest flux, folded to an isotropic
    /// angular density.
    fn set_source(&mut self, groupset: &Groupset, scatter: bool, fixed: bool) {
        let inv_weight = 1.0 / groupset.quadrature.total_weight();
        for cell in &self.grid.local_cells {
            let xs = &self.materials[cell.material_id as usize];
            let base = self.pwl.node_base[cell.local_id as usize];
            let num_nodes = self.pwl.mappings[cell.local_id as usize].num_nodes();
            for node in 0..num_nodes {
                let dof = base + node;
                for g in groupset.groups.clone() {
                    let mut q = 0.0;
                    if fixed {
                        q += self.fixed_source[cell.local_id as usize * self.num_groups + g];
                    }
                    if scatter {
                        q += xs.sigma_s[g] * self.phi_old[dof * self.num_groups + g];
                    }
                    self.q_moments[dof * self.num_groups + g] = q * inv_weight;
                }
            }
        }
    }

    fn zero_phi_new(&mut self, groupset: &Groupset) {
        for dof in 0..self.pwl.num_nodal_dofs() {
            for g in groupset.groups.clone() {
                self.phi_new[dof * self.num_groups + g] = 0.0;
            }
        }
    }

    /// Runs one sweep of a groupset with the current source moments.
    fn sweep_once(
        &mut self,
        groupset: &Groupset,
        scheduler: &mut SweepScheduler<'a, C>,
        surface_source_active: bool,
    ) -> Result<()> {
        let mut chunk = DfemSweepChunk::new(
            self.grid,
            &self.pwl,
            &self.materials,
            &groupset.quadrature,
            &self.q_moments,
            &mut self.phi_new,
            self.psi.as_deref_mut(),
            self.num_groups,
            surface_source_active,
        );
        scheduler.sweep(&mut chunk)
    }

    /// Packs the groupset slice of a `(dof × group)` vector.
    fn pack(&self, groupset: &Groupset, data: &[f64]) -> Vec<f64> {
        let mut packed = Vec::with_capacity(self.pwl.num_nodal_dofs() * groupset.groups.len());
        for dof in 0..self.pwl.num_nodal_dofs() {
            for g in groupset.groups.clone() {
                packed.push(data[dof * self.num_groups + g]);
            }
        }
        packed
    }

    /// Scatters a packed groupset vector back into the flux iterate.
    fn unpack_into_phi_old(&mut self, groupset: &Groupset, packed: &[f64]) {
        let mut it = packed.iter();
        for dof in 0..self.pwl.num_nodal_dofs() {
            for g in groupset.groups.clone() {
                self.phi_old[dof * self.num_groups + g] = *it.next().unwrap();
            }
        }
    }

    fn solve_richardson(
        &mut self,
        groupset_index: usize,
        scheduler: &mut SweepScheduler<'a, C>,
    ) -> Result<SolveInfo> {
        let groupset = self.groupsets[groupset_index].clone();
        let mut converged = false;
        let mut iterations = 0;
        let mut change = f64::INFINITY;
        for iteration in 0..groupset.max_iterations {
            self.set_source(&groupset, true, true);
            self.zero_phi_new(&groupset);
            self.sweep_once(&groupset, scheduler, true)?;

            let mut local_change: f64 = 0.0;
            for dof in 0..self.pwl.num_nodal_dofs() {
                for g in groupset.groups.clone() {
                    let idx = dof * self.num_groups + g;
                    local_change = local_change.max((self.phi_new[idx] - self.phi_old[idx]).abs());
                    self.phi_old[idx] = self.phi_new[idx];
                }
            }
            change = self.comm.allreduce_max(local_change);
            iterations = iteration + 1;
            info!(
                "WGS groups [{}-{}] iteration {:3} point-wise change {:.3e}",
                groupset.groups.start,
                groupset.groups.end - 1,
                iterations,
                change
            );
            if change < groupset.tolerance {
                converged = true;
                break;
            }
        }
        Ok(SolveInfo {
            converged,
            iterations,
            pointwise_change: change,
            stats: scheduler.stats().clone(),
        })
    }

    fn solve_gmres(
        &mut self,
        groupset_index: usize,
        scheduler: &mut SweepScheduler<'a, C>,
        restart: usize,
    ) -> Result<SolveInfo> {
        let groupset = self.groupsets[groupset_index].clone();
        let comm = self.comm;

        // Right-hand side: one sweep of the fixed sources (volumetric and
        // surface) alone.
        self.set_source(&groupset, false, true);
        self.zero_phi_new(&groupset);
        self.sweep_once(&groupset, scheduler, true)?;
        let b = self.pack(&groupset, &self.phi_new);

        // Operator: x -> x - D L⁻¹ S x, applied through one sweep of the
        // scattering source built from x (staged in the flux iterate).
        // Surface sources are suppressed so the operator stays linear.
        let x0 = vec![0.0; b.len()];
        let outcome = iterative::gmres(
            comm,
            |x| {
                self.unpack_into_phi_old(&groupset, x);
                self.set_source(&groupset, true, false);
                self.zero_phi_new(&groupset);
                self.sweep_once(&groupset, scheduler, false)?;
                let swept = self.pack(&groupset, &self.phi_new);
                Ok(x.iter().zip(swept).map(|(xi, si)| xi - si).collect())
            },
            &b,
            x0,
            restart,
            groupset.tolerance,
            groupset.max_iterations,
        )?;

        self.unpack_into_phi_old(&groupset, &outcome.solution);
        // One closing sweep so φ, ψ and boundaries reflect the solution.
        self.set_source(&groupset, true, true);
        self.zero_phi_new(&groupset);
        self.sweep_once(&groupset, scheduler, true)?;
        for dof in 0..self.pwl.num_nodal_dofs() {
            for g in groupset.groups.clone() {
                let idx = dof * self.num_groups + g;
                self.phi_old[idx] = self.phi_new[idx];
            }
        }

        info!(
            "WGS groups [{}-{}] GMRES {} iteration(s), residual {:.3e}",
            groupset.groups.start,
            groupset.groups.end - 1,
            outcome.iterations,
            outcome.residual_norm
        );
        Ok(SolveInfo {
            converged: outcome.converged,
            iterations: outcome.iterations,
            pointwise_change: outcome.residual_norm,
            stats: scheduler.stats().clone(),
        })
    }

    /// Solves every groupset in order. Collective across all ranks.
    pub fn execute(&mut self, pl: &mut impl ProgressLog) -> Result<Vec<SolveInfo>> {
        if self.groupsets.is_empty() {
            return Err(
                SweepError::InvalidConfiguration("no groupsets defined".to_string()).into(),
            );
        }
        if self.options.save_angular_flux {
            let num_angles = self.groupsets[0].quadrature.num_angles();
            if self
                .groupsets
                .iter()
                .any(|gs| gs.quadrature.num_angles() != num_angles)
            {
                return Err(SweepError::InvalidConfiguration(
                    "angular flux capture requires one angle count across groupsets".to_string(),
                )
                .into());
            }
            self.psi_num_angles = num_angles;
            self.psi = Some(vec![
                0.0;
                self.pwl.num_nodal_dofs() * num_angles * self.num_groups
            ]);
        }

        let mut infos = Vec::with_capacity(self.groupsets.len());
        for groupset_index in 0..self.groupsets.len() {
            info!("Initializing groupset {groupset_index}");
            let groupset = self.groupsets[groupset_index].clone();
            let mut scheduler = self.build_scheduler(&groupset, pl)?;
            let info = match groupset.method {
                IterativeMethod::ClassicRichardson => {
                    self.solve_richardson(groupset_index, &mut scheduler)?
                }
                IterativeMethod::Gmres { restart } => {
                    self.solve_gmres(groupset_index, &mut scheduler, restart)?
                }
            };
            info!(
                "Groupset {groupset_index} solve complete: {} iteration(s), change {:.3e}",
                info.iterations, info.pointwise_change
            );
            infos.push(info);
            self.comm.barrier();
        }
        Ok(infos)
    }
}
