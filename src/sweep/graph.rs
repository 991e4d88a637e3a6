/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Directed-graph machinery for sweep-plan construction.
//!
//! Everything here is deterministic by construction: strongly connected
//! components come from an iterative Tarjan visit, feedback arcs are chosen
//! greedily in a caller-supplied key order, and topological orders break
//! ties through the same keys. Two ranks running these routines on the same
//! graph produce bit-identical results.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A small dense digraph over nodes `0..n`.
#[derive(Debug, Clone)]
pub struct Digraph {
    succ: Vec<Vec<u32>>,
    num_arcs: usize,
}

impl Digraph {
    pub fn new(num_nodes: usize) -> Self {
        Digraph {
            succ: vec![Vec::new(); num_nodes],
            num_arcs: 0,
        }
    }

    pub fn from_arcs(num_nodes: usize, arcs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let mut g = Digraph::new(num_nodes);
        for (u, v) in arcs {
            g.add_arc(u, v);
        }
        g
    }

    /// Adds the arc `u -> v` unless already present.
    pub fn add_arc(&mut self, u: u32, v: u32) {
        let succ = &mut self.succ[u as usize];
        if !succ.contains(&v) {
            succ.push(v);
            self.num_arcs += 1;
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.succ.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.num_arcs
    }

    pub fn successors(&self, u: u32) -> &[u32] {
        &self.succ[u as usize]
    }

    /// All arcs in `(source, destination)` order.
    pub fn arcs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.succ
            .iter()
            .enumerate()
            .flat_map(|(u, vs)| vs.iter().map(move |&v| (u as u32, v)))
    }

    /// Returns a copy of this graph without the given arcs.
    pub fn without_arcs(&self, removed: &[(u32, u32)]) -> Digraph {
        Digraph::from_arcs(
            self.num_nodes(),
            self.arcs().filter(|arc| !removed.contains(arc)),
        )
    }

    /// In-degree of every node.
    pub fn in_degrees(&self) -> Vec<usize> {
        let mut deg = vec![0; self.num_nodes()];
        for (_, v) in self.arcs() {
            deg[v as usize] += 1;
        }
        deg
    }
}

/// Strongly connected components, numbered from 0.
#[derive(Debug, Clone)]
pub struct Sccs {
    pub num_components: usize,
    /// Component index of every node.
    pub components: Vec<u32>,
}

impl Sccs {
    /// Whether every component is a single node, i.e. the graph is a DAG
    /// apart from self-loops (which sweep graphs never have).
    pub fn all_trivial(&self) -> bool {
        self.num_components == self.components.len()
    }

    pub fn component_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_components];
        for &c in &self.components {
            sizes[c as usize] += 1;
        }
        sizes
    }
}

/// Tarjan's strongly-connected-components algorithm, iterative.
pub fn tarjan_sccs(graph: &Digraph) -> Sccs {
    let n = graph.num_nodes();
    const UNVISITED: u32 = u32::MAX;
    let mut index = vec![UNVISITED; n];
    let mut low_link = vec![0u32; n];
    let mut on_stack = vec![false; n];
    let mut component = vec![0u32; n];
    let mut stack: Vec<u32> = Vec::new();
    let mut next_index = 0u32;
    let mut num_components = 0u32;
    // (node, next successor position) visit frames.
    let mut frames: Vec<(u32, usize)> = Vec::new();

    for root in 0..n as u32 {
        if index[root as usize] != UNVISITED {
            continue;
        }
        frames.push((root, 0));
        index[root as usize] = next_index;
        low_link[root as usize] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root as usize] = true;

        while let Some(&mut (node, ref mut pos)) = frames.last_mut() {
            let succ = graph.successors(node);
            if *pos < succ.len() {
                let next = succ[*pos];
                *pos += 1;
                if index[next as usize] == UNVISITED {
                    index[next as usize] = next_index;
                    low_link[next as usize] = next_index;
                    next_index += 1;
                    stack.push(next);
                    on_stack[next as usize] = true;
                    frames.push((next, 0));
                } else if on_stack[next as usize] {
                    low_link[node as usize] = low_link[node as usize].min(index[next as usize]);
                }
            } else {
                frames.pop();
                if let Some(&mut (parent, _)) = frames.last_mut() {
                    low_link[parent as usize] =
                        low_link[parent as usize].min(low_link[node as usize]);
                }
                if low_link[node as usize] == index[node as usize] {
                    while let Some(top) = stack.pop() {
                        on_stack[top as usize] = false;
                        component[top as usize] = num_components;
                        if top == node {
                            break;
                        }
                    }
                    num_components += 1;
                }
            }
        }
    }
    Sccs {
        num_components: num_components as usize,
        components: component,
    }
}

/// Computes a deterministic feedback arc set.
///
/// While the graph has a non-trivial strongly connected component, the arc
/// inside such a component with the smallest `key` is removed; the removed
/// arcs are returned in removal order. Every caller passing the same graph
/// and keys gets the same set.
pub fn feedback_arcs(graph: &Digraph, key: impl Fn(u32, u32) -> (u64, u64)) -> Vec<(u32, u32)> {
    let mut removed: Vec<(u32, u32)> = Vec::new();
    loop {
        let working = graph.without_arcs(&removed);
        let sccs = tarjan_sccs(&working);
        if sccs.all_trivial() {
            return removed;
        }
        let sizes = sccs.component_sizes();
        let candidate = working
            .arcs()
            .filter(|&(u, v)| {
                let cu = sccs.components[u as usize];
                cu == sccs.components[v as usize] && sizes[cu as usize] > 1
            })
            .min_by_key(|&(u, v)| key(u, v))
            .expect("non-trivial component with no internal arc");
        removed.push(candidate);
    }
}

/// Kahn topological order with deterministic tie-breaking: among ready
/// nodes, the one with the smallest `key` comes first. Returns `None` on a
/// cyclic graph.
pub fn topological_order(graph: &Digraph, key: impl Fn(u32) -> u64) -> Option<Vec<u32>> {
    let n = graph.num_nodes();
    let mut in_deg = graph.in_degrees();
    let mut ready: BinaryHeap<Reverse<(u64, u32)>> = (0..n as u32)
        .filter(|&u| in_deg[u as usize] == 0)
        .map(|u| Reverse((key(u), u)))
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, u))) = ready.pop() {
        order.push(u);
        for &v in graph.successors(u) {
            in_deg[v as usize] -= 1;
            if in_deg[v as usize] == 0 {
                ready.push(Reverse((key(v), v)));
            }
        }
    }
    (order.len() == n).then_some(order)
}

/// Levels every node by longest path from a source. Returns `None` on a
/// cyclic graph.
pub fn level_by_longest_path(graph: &Digraph) -> Option<Vec<u32>> {
    let order = topological_order(graph, |u| u as u64)?;
    let mut level = vec![0u32; graph.num_nodes()];
    for &u in &order {
        for &v in graph.successors(u) {
            level[v as usize] = level[v as usize].max(level[u as usize] + 1);
        }
    }
    Some(level)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tarjan_dag() {
        let g = Digraph::from_arcs(4, [(0, 1), (0, 2), (2, 3), (1, 3)]);
        let sccs = tarjan_sccs(&g);
        assert!(sccs.all_trivial());
        assert_eq!(sccs.num_components, 4);
    }

    #[test]
    fn test_tarjan_cycle() {
        let g = Digraph::from_arcs(4, [(0, 1), (1, 2), (2, 0), (1, 3)]);
        let sccs = tarjan_sccs(&g);
        assert_eq!(sccs.num_components, 2);
        assert_eq!(sccs.components[0], sccs.components[1]);
        assert_eq!(sccs.components[0], sccs.components[2]);
        assert_ne!(sccs.components[0], sccs.components[3]);
    }

    #[test]
    fn test_feedback_single_cycle() {
        let g = Digraph::from_arcs(3, [(0, 1), (1, 2), (2, 0)]);
        let fb = feedback_arcs(&g, |u, v| (u as u64, v as u64));
        assert_eq!(fb, vec![(0, 1)]);
        assert!(tarjan_sccs(&g.without_arcs(&fb)).all_trivial());
    }

    #[test]
    fn test_feedback_two_cycles() {
        // Two disjoint 2-cycles need exactly one arc removed each.
        let g = Digraph::from_arcs(4, [(0, 1), (1, 0), (2, 3), (3, 2)]);
        let fb = feedback_arcs(&g, |u, v| (u as u64, v as u64));
        assert_eq!(fb, vec![(0, 1), (2, 3)]);
    }

    #[test]
    fn test_feedback_is_deterministic_under_arc_insertion_order() {
        let arcs = [(2u32, 0u32), (0, 1), (1, 2)];
        let a = Digraph::from_arcs(3, arcs);
        let mut rev = arcs;
        rev.reverse();
        let b = Digraph::from_arcs(3, rev);
        let key = |u: u32, v: u32| (u as u64, v as u64);
        assert_eq!(feedback_arcs(&a, key), feedback_arcs(&b, key));
    }

    #[test]
    fn test_topological_order_ties() {
        let g = Digraph::from_arcs(4, [(0, 1), (0, 2), (2, 3), (1, 3)]);
        let order = topological_order(&g, |u| u as u64).unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);
        // Reversing the key order flips the tie between 1 and 2.
        let order = topological_order(&g, |u| 10 - u as u64).unwrap();
        assert_eq!(order, vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_topological_order_cycle() {
        let g = Digraph::from_arcs(2, [(0, 1), (1, 0)]);
        assert!(topological_order(&g, |u| u as u64).is_none());
    }

    #[test]
    fn test_leveling() {
        let g = Digraph::from_arcs(5, [(0, 1), (1, 2), (0, 3), (3, 4), (4, 2)]);
        let levels = level_by_longest_path(&g).unwrap();
        assert_eq!(levels, vec![0, 1, 3, 1, 2]);
    }
}
