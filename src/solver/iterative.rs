/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Distributed Krylov machinery for the outer transport solves.
//!
//! The GMRES here is matrix free: the operator is applied through sweeps,
//! and every inner product is a rank-local dot followed by a deterministic
//! sum reduction, so all ranks run the identical Arnoldi process.

use crate::comm::Communicator;
use anyhow::Result;

/// Distributed dot product; identical on every rank.
pub fn par_dot<C: Communicator>(comm: &C, a: &[f64], b: &[f64]) -> f64 {
    let local: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    comm.allreduce_sum(local)
}

/// Distributed Euclidean norm.
pub fn par_norm<C: Communicator>(comm: &C, a: &[f64]) -> f64 {
    par_dot(comm, a, a).sqrt()
}

/// Outcome of a restarted GMRES solve.
pub struct GmresOutcome {
    pub solution: Vec<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub converged: bool,
}

/// Restarted GMRES with modified Gram–Schmidt and Givens rotations.
///
/// `apply` evaluates the operator on the rank-local slice of a distributed
/// vector; it must be called collectively on every rank in the same
/// sequence, which the caller guarantees by running this routine in
/// lockstep SPMD fashion.
pub fn gmres<C, F>(
    comm: &C,
    mut apply: F,
    b: &[f64],
    x0: Vec<f64>,
    restart: usize,
    tolerance: f64,
    max_iterations: usize,
) -> Result<GmresOutcome>
where
    C: Communicator,
    F: FnMut(&[f64]) -> Result<Vec<f64>>,
{
    let n = b.len();
    let restart = restart.max(1);
    let mut x = x0;
    let b_norm = par_norm(comm, b).max(f64::MIN_POSITIVE);
    let mut total_iterations = 0;
    let mut residual_norm = f64::INFINITY;

    while total_iterations < max_iterations {
        // Residual of the current iterate.
        let ax = apply(&x)?;
        let mut r: Vec<f64> = b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect();
        residual_norm = par_norm(comm, &r);
        if residual_norm / b_norm < tolerance {
            return Ok(GmresOutcome {
                solution: x,
                iterations: total_iterations,
                residual_norm,
                converged: true,
            });
        }

        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(restart + 1);
        r.iter_mut().for_each(|v| *v /= residual_norm);
        basis.push(r);
        // Hessenberg column store plus the Givens-rotated right-hand side.
        let mut h = vec![vec![0.0; restart + 1]; restart];
        let mut cs = vec![0.0; restart];
        let mut sn = vec![0.0; restart];
        let mut g = vec![0.0; restart + 1];
        g[0] = residual_norm;
        let mut inner = 0;

        for k in 0..restart {
            if total_iterations >= max_iterations {
                break;
            }
            total_iterations += 1;
            let mut w = apply(&basis[k])?;
            for j in 0..=k {
                let hjk = par_dot(comm, &w, &basis[j]);
                h[k][j] = hjk;
                w.iter_mut().zip(&basis[j]).for_each(|(wi, vj)| *wi -= hjk * vj);
            }
            let wnorm = par_norm(comm, &w);
            h[k][k + 1] = wnorm;

            // Apply the accumulated rotations to the new column.
            for j in 0..k {
                let temp = cs[j] * h[k][j] + sn[j] * h[k][j + 1];
                h[k][j + 1] = -sn[j] * h[k][j] + cs[j] * h[k][j + 1];
                h[k][j] = temp;
            }
            let denom = (h[k][k] * h[k][k] + wnorm * wnorm).sqrt();
            cs[k] = h[k][k] / denom;
            sn[k] = wnorm / denom;
            h[k][k] = denom;
            h[k][k + 1] = 0.0;
            g[k + 1] = -sn[k] * g[k];
            g[k] *= cs[k];
            inner = k + 1;
            residual_norm = g[k + 1].abs();

            if wnorm > f64::MIN_POSITIVE {
                w.iter_mut().for_each(|v| *v /= wnorm);
                basis.push(w);
            }
            if residual_norm / b_norm < tolerance || wnorm <= f64::MIN_POSITIVE {
                break;
            }
        }

        // Back substitution on the triangularized Hessenberg system.
        let mut y = vec![0.0; inner];
        for i in (0..inner).rev() {
            let mut sum = g[i];
            for j in i + 1..inner {
                sum -= h[j][i] * y[j];
            }
            y[i] = sum / h[i][i];
        }
        for (j, yj) in y.iter().enumerate() {
            for i in 0..n {
                x[i] += yj * basis[j][i];
            }
        }

        if residual_norm / b_norm < tolerance {
            return Ok(GmresOutcome {
                solution: x,
                iterations: total_iterations,
                residual_norm,
                converged: true,
            });
        }
    }

    Ok(GmresOutcome {
        solution: x,
        iterations: total_iterations,
        residual_norm,
        converged: false,
    })
}
