/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The fatal-error taxonomy of the sweep core.
//!
//! All variants except [`InvalidConfiguration`](SweepError::InvalidConfiguration)
//! are unrecoverable: the caller is expected to log the diagnostic on every
//! rank and abort the whole computation with the variant's
//! [exit code](SweepError::exit_code). `InvalidConfiguration` is raised by
//! pre-sweep validation and can be handled by the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    /// A face with a degenerate normal or unmatchable nodes.
    #[error("bad geometry: {0}")]
    BadGeometry(String),

    /// The sweep graph of some direction contains a cycle but the groupset
    /// was configured with `allow_cycles = false`.
    #[error("sweep graph for direction {direction} contains a cycle and cycles are not allowed")]
    CycleWithoutPermission { direction: usize },

    /// A rank could not be placed in the inter-rank leveling.
    #[error("partition pathology: rank {rank} is unreachable in the global sweep leveling")]
    PartitionPathology { rank: usize },

    /// The message fabric failed or the sweep stopped making progress.
    #[error("communication failure: {0}")]
    CommFailure(String),

    /// Mismatched groupset, quadrature, material or partition inputs.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl SweepError {
    /// Returns the process exit code associated with this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            SweepError::BadGeometry(_) => 3,
            SweepError::CycleWithoutPermission { .. } => 4,
            SweepError::PartitionPathology { .. } => 5,
            SweepError::CommFailure(_) => 6,
            SweepError::InvalidConfiguration(_) => 2,
        }
    }
}
