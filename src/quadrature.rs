/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Angular quadratures and direction grouping.
//!
//! The sweep core consumes a quadrature as a flat list of weighted unit
//! directions. Construction here is limited to the Gauss–Legendre families
//! the tests and reference problems need; production quadratures obeying the
//! same contract can be supplied directly.

use crate::errors::SweepError;
use anyhow::{ensure, Result};
use itertools::Itertools;

/// A single quadrature direction.
#[derive(Debug, Clone, Copy)]
pub struct Direction {
    /// Unit direction vector.
    pub omega: [f64; 3],
    pub weight: f64,
}

impl Direction {
    /// Sign bits of the direction components, with zeros counted as
    /// positive. Used as scheduling tie-breakers and octant keys.
    pub fn sign_bits(&self) -> [bool; 3] {
        [
            self.omega[0] >= 0.0,
            self.omega[1] >= 0.0,
            self.omega[2] >= 0.0,
        ]
    }

    /// Octant index in `0..8` derived from [`sign_bits`](Self::sign_bits).
    pub fn octant(&self) -> usize {
        let s = self.sign_bits();
        (s[0] as usize) | (s[1] as usize) << 1 | (s[2] as usize) << 2
    }
}

/// An angular quadrature: an indexed set of weighted unit directions.
#[derive(Debug, Clone)]
pub struct AngularQuadrature {
    pub directions: Vec<Direction>,
}

/// Computes the Gauss–Legendre nodes and weights on `[-1, 1]` by Newton
/// iteration on the Legendre recurrence.
fn gauss_legendre_points(n: usize) -> Vec<(f64, f64)> {
    let mut points = Vec::with_capacity(n);
    for i in 0..n {
        // Chebyshev initial guess.
        let mut x = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut dp = 0.0;
        for _ in 0..100 {
            let mut p0 = 1.0;
            let mut p1 = x;
            for k in 2..=n {
                let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
                p0 = p1;
                p1 = p2;
            }
            dp = n as f64 * (x * p1 - p0) / (x * x - 1.0);
            let dx = p1 / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        points.push((-x, w));
    }
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    points
}

impl AngularQuadrature {
    /// 1-D slab Gauss–Legendre quadrature with `n` directions ±μ.
    ///
    /// Weights sum to 2.
    pub fn gauss_legendre_1d(n: usize) -> Result<Self> {
        ensure!(n >= 2 && n % 2 == 0, "slab quadrature needs an even n >= 2");
        let directions = gauss_legendre_points(n)
            .into_iter()
            .map(|(mu, w)| Direction {
                omega: [mu, 0.0, 0.0],
                weight: w,
            })
            .collect();
        Ok(AngularQuadrature { directions })
    }

    /// Product quadrature: Gauss–Legendre in the polar cosine, uniform in
    /// azimuth, over the full sphere. `n_polar` polar levels per hemisphere,
    /// `n_azimuthal` azimuthal angles per octant. Weights sum to 4π.
    pub fn product(n_polar: usize, n_azimuthal: usize) -> Result<Self> {
        ensure!(n_polar >= 1 && n_azimuthal >= 1, "empty product quadrature");
        let polar = gauss_legendre_points(2 * n_polar);
        let n_azi = 4 * n_azimuthal;
        let mut directions = Vec::with_capacity(polar.len() * n_azi);
        for &(xi, w_polar) in &polar {
            let sin_theta = (1.0 - xi * xi).sqrt();
            for q in 0..n_azi {
                let phi = 2.0 * std::f64::consts::PI * (q as f64 + 0.5) / n_azi as f64;
                directions.push(Direction {
                    omega: [sin_theta * phi.cos(), sin_theta * phi.sin(), xi],
                    weight: w_polar * 2.0 * std::f64::consts::PI / n_azi as f64,
                });
            }
        }
        Ok(AngularQuadrature { directions })
    }

    pub fn num_angles(&self) -> usize {
        self.directions.len()
    }

    pub fn omega(&self, i: usize) -> [f64; 3] {
        self.directions[i].omega
    }

    pub fn weight(&self, i: usize) -> f64 {
        self.directions[i].weight
    }

    /// Sum of all weights, i.e. the measure of the angular domain.
    pub fn total_weight(&self) -> f64 {
        self.directions.iter().map(|d| d.weight).sum()
    }

    /// For a reflecting boundary whose outward normal is the coordinate axis
    /// `axis`, maps every direction to the direction with the `axis`
    /// component negated.
    ///
    /// Fails with [`SweepError::InvalidConfiguration`] if the quadrature is
    /// not symmetric about that plane.
    pub fn reflection_map(&self, axis: usize) -> Result<Vec<usize>> {
        let mut map = vec![usize::MAX; self.num_angles()];
        for (i, dir) in self.directions.iter().enumerate() {
            let mut mirrored = dir.omega;
            mirrored[axis] = -mirrored[axis];
            let found = self.directions.iter().position(|other| {
                crate::math::points_coincide(other.omega, mirrored, 1e-12)
            });
            match found {
                Some(j) => map[i] = j,
                None => {
                    return Err(SweepError::InvalidConfiguration(format!(
                        "quadrature is not symmetric about axis {axis}: direction {i} has no mirror"
                    ))
                    .into())
                }
            }
        }
        Ok(map)
    }
}

/// How directions sharing a sweep ordering are grouped into angle-sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleAggregation {
    /// One angle-set per direction.
    Single,
    /// One angle-set per octant.
    Octant,
    /// Within an octant, one angle-set per polar level.
    Polar,
    /// Within an octant, one angle-set per azimuthal angle.
    Azimuthal,
}

/// A group of directions guaranteed to share one sweep ordering, split into
/// the per-angle-set direction lists the aggregation policy asks for.
#[derive(Debug, Clone)]
pub struct DirectionGroup {
    /// Representative direction used to build the shared SPDS.
    pub master_direction: usize,
    /// One entry per angle-set: the direction indices it advances together.
    pub angle_sets: Vec<Vec<usize>>,
}

/// Groups the quadrature by octant (directions in one octant see identical
/// face orientations on orthogonal grids) and applies the aggregation policy
/// within each octant.
pub fn associate_directions(
    quadrature: &AngularQuadrature,
    aggregation: AngleAggregation,
) -> Vec<DirectionGroup> {
    let mut octants: Vec<Vec<usize>> = vec![Vec::new(); 8];
    for (i, dir) in quadrature.directions.iter().enumerate() {
        octants[dir.octant()].push(i);
    }
    let mut groups = Vec::new();
    for members in octants.into_iter().filter(|m| !m.is_empty()) {
        let angle_sets: Vec<Vec<usize>> = match aggregation {
            AngleAggregation::Single => members.iter().map(|&i| vec![i]).collect(),
            AngleAggregation::Octant => vec![members.clone()],
            AngleAggregation::Polar => split_by_key(quadrature, &members, |o| o[2]),
            AngleAggregation::Azimuthal => {
                split_by_key(quadrature, &members, |o| o[1].atan2(o[0]))
            }
        };
        groups.push(DirectionGroup {
            master_direction: members[0],
            angle_sets,
        });
    }
    groups
}

/// Splits `members` into runs sharing the same key value (within a small
/// tolerance), preserving index order.
fn split_by_key(
    quadrature: &AngularQuadrature,
    members: &[usize],
    key: impl Fn([f64; 3]) -> f64,
) -> Vec<Vec<usize>> {
    let sorted: Vec<usize> = members
        .iter()
        .copied()
        .sorted_by(|&a, &b| {
            key(quadrature.omega(a))
                .partial_cmp(&key(quadrature.omega(b)))
                .unwrap()
                .then(a.cmp(&b))
        })
        .collect();
    let mut sets: Vec<Vec<usize>> = Vec::new();
    for &i in &sorted {
        match sets.last_mut() {
            Some(last) if (key(quadrature.omega(last[0])) - key(quadrature.omega(i))).abs() < 1e-12 => {
                last.push(i)
            }
            _ => sets.push(vec![i]),
        }
    }
    sets
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gl_1d_weights() {
        let quad = AngularQuadrature::gauss_legendre_1d(4).unwrap();
        assert_eq!(quad.num_angles(), 4);
        assert!((quad.total_weight() - 2.0).abs() < 1e-13);
        // Known S4 Gauss-Legendre abscissae.
        assert!((quad.omega(0)[0] + 0.8611363115940526).abs() < 1e-12);
        assert!((quad.omega(1)[0] + 0.3399810435848563).abs() < 1e-12);
    }

    #[test]
    fn test_product_weights() {
        let quad = AngularQuadrature::product(2, 2).unwrap();
        assert!((quad.total_weight() - 4.0 * std::f64::consts::PI).abs() < 1e-11);
        for dir in &quad.directions {
            assert!((crate::math::norm(dir.omega) - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reflection_map_involution() {
        let quad = AngularQuadrature::gauss_legendre_1d(4).unwrap();
        let map = quad.reflection_map(0).unwrap();
        for (i, &j) in map.iter().enumerate() {
            assert_eq!(map[j], i);
            assert!((quad.omega(i)[0] + quad.omega(j)[0]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_octant_grouping() {
        let quad = AngularQuadrature::product(1, 1).unwrap();
        let groups = associate_directions(&quad, AngleAggregation::Octant);
        assert_eq!(groups.len(), 8);
        for group in &groups {
            assert_eq!(group.angle_sets.len(), 1);
            assert_eq!(group.angle_sets[0].len(), 1);
        }
    }

    #[test]
    fn test_single_aggregation() {
        let quad = AngularQuadrature::gauss_legendre_1d(2).unwrap();
        let groups = associate_directions(&quad, AngleAggregation::Single);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.angle_sets.len() == 1));
    }
}
