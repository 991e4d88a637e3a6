/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The depth-of-graph comparator: deepest first, then direction sign bits
//! with positive (or zero) components winning, exactly as documented.

use std::collections::BTreeMap;
use std::sync::Arc;
use sweepgraph::comm::SelfComm;
use sweepgraph::mesh::orthogonal::{uniform_cuts, OrthogonalMesher};
use sweepgraph::sweep::angle_set::AngleSet;
use sweepgraph::sweep::fluds::{Fluds, FludsTemplate};
use sweepgraph::sweep::scheduler::SweepScheduler;
use sweepgraph::sweep::spds::build_local;

/// Builds an angle-set whose SPDS carries a crafted depth and direction.
fn crafted_angle_set(
    grid: &sweepgraph::mesh::GridView,
    comm: &SelfComm,
    id: usize,
    depth: usize,
    omega: [f64; 3],
) -> AngleSet {
    let mut spds = build_local([1.0, 0.0, 0.0], grid, false, id)
        .unwrap()
        .finalize(comm, false, id)
        .unwrap();
    spds.depth_of_graph = depth;
    spds.omega = omega;
    let spds = Arc::new(spds);
    let template =
        Arc::new(FludsTemplate::build(spds.clone(), grid, &grid.face_histogram()).unwrap());
    let fluds = Fluds::new(template, 1, 1);
    AngleSet::new(id, vec![0], spds, fluds, 0, 65536)
}

#[test]
fn test_depth_of_graph_comparator() {
    let grid = OrthogonalMesher::slab(uniform_cuts(2, 1.0)).build(0, 1).unwrap();
    let comm = SelfComm::new();

    // Six sets over depth tiers {3, 3, 2, 2, 1, 1}; within a tier the
    // direction signs distinguish the two sets.
    let specs: [(usize, [f64; 3]); 6] = [
        (1, [0.5, 0.5, 0.7]),    // id 0: depth 1, signs (+,+,+)
        (3, [-0.5, 0.5, -0.7]),  // id 1: depth 3, signs (-,+,-)
        (2, [0.5, -0.5, 0.7]),   // id 2: depth 2, signs (+,-,+)
        (1, [-0.5, -0.5, -0.7]), // id 3: depth 1, signs (-,-,-)
        (3, [0.5, 0.5, -0.7]),   // id 4: depth 3, signs (+,+,-)
        (2, [0.5, -0.5, -0.7]),  // id 5: depth 2, signs (+,-,-)
    ];
    let angle_sets: Vec<AngleSet> = specs
        .iter()
        .enumerate()
        .map(|(id, &(depth, omega))| crafted_angle_set(&grid, &comm, id, depth, omega))
        .collect();

    let scheduler = SweepScheduler::new(&comm, angle_sets, BTreeMap::new());
    // Depth 3 tier: id 4 (+,+,-) beats id 1 (-,+,-) on the x sign.
    // Depth 2 tier: id 2 (+,-,+) beats id 5 (+,-,-) on the z sign.
    // Depth 1 tier: id 0 (+,+,+) beats id 3 (-,-,-) on the x sign.
    assert_eq!(scheduler.schedule_order(), vec![4, 1, 2, 5, 0, 3]);
}

#[test]
fn test_zero_components_count_as_positive() {
    let grid = OrthogonalMesher::slab(uniform_cuts(2, 1.0)).build(0, 1).unwrap();
    let comm = SelfComm::new();
    let angle_sets = vec![
        crafted_angle_set(&grid, &comm, 0, 1, [-1.0, 0.0, 0.0]),
        crafted_angle_set(&grid, &comm, 1, 1, [1.0, 0.0, 0.0]),
    ];
    let scheduler = SweepScheduler::new(&comm, angle_sets, BTreeMap::new());
    // +x outranks -x; the zero y and z components tie as positive.
    assert_eq!(scheduler.schedule_order(), vec![1, 0]);
}

#[test]
fn test_equal_rules_keep_construction_order() {
    let grid = OrthogonalMesher::slab(uniform_cuts(2, 1.0)).build(0, 1).unwrap();
    let comm = SelfComm::new();
    let angle_sets = vec![
        crafted_angle_set(&grid, &comm, 0, 2, [1.0, 0.0, 0.0]),
        crafted_angle_set(&grid, &comm, 1, 2, [1.0, 0.0, 0.0]),
    ];
    let scheduler = SweepScheduler::new(&comm, angle_sets, BTreeMap::new());
    assert_eq!(scheduler.schedule_order(), vec![0, 1]);
}
