/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The sweep-chunk interface: the per-cell transport kernel the scheduler
//! drives.

use super::boundary::BoundaryMap;
use super::fluds::Fluds;
use super::spds::Spds;
use anyhow::Result;

/// Everything a chunk may touch while sweeping one angle-set: the sweep
/// plan, the flux storage, the direction indices and the shared boundaries.
pub struct SweepSlice<'a> {
    pub angle_set_id: usize,
    pub spds: &'a Spds,
    pub fluds: &'a mut Fluds,
    /// Quadrature direction indices of this angle-set.
    pub angles: &'a [usize],
    /// First global group of the group subset.
    pub gs_ss_begin: usize,
    pub boundaries: &'a mut BoundaryMap,
}

/// A per-cell transport kernel.
///
/// Implementations must be re-entrant per angle-set: a chunk is invoked once
/// per angle-set per sweep and must not retain state between invocations.
pub trait SweepChunk {
    /// Processes every cell of the slice's SPLS for every angle and group
    /// of the angle-set.
    fn sweep(&mut self, slice: SweepSlice<'_>) -> Result<()>;
}
