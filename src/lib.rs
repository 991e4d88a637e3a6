/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_doc_comments)]
#![allow(clippy::type_complexity)]

pub mod comm;
pub mod errors;
pub mod fe;
pub mod math;
pub mod mesh;
pub mod quadrature;
pub mod solver;
pub mod sweep;

pub mod prelude {
    pub use crate::comm::{Communicator, ThreadWorld};
    pub use crate::errors::SweepError;
    pub use crate::mesh::prelude::*;
    pub use crate::quadrature::*;
    pub use crate::solver::*;
    pub use crate::sweep::prelude::*;
}
