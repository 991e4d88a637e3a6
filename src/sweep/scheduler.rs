/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The depth-of-graph sweep scheduler.
//!
//! Angle-sets are polled in a fixed priority order: deepest location in the
//! global sweep planes first, direction sign bits as tie-breakers, so every
//! rank agrees on the order without communicating. Each pass first gives
//! every set a chance to make message progress (`NoExecIfReady`), then lets
//! ready sets execute; the pass repeats until all sets report finished.
//! After a barrier, delayed (cycle-edge) data is drained until quiescent and
//! everything is reset for the next outer iteration.

use super::angle_set::{AngleSet, AngleSetStatus, ExecutionPermission};
use super::boundary::BoundaryMap;
use super::chunk::SweepChunk;
use crate::comm::Communicator;
use crate::errors::SweepError;
use anyhow::Result;
use log::{debug, error};
use std::time::{Duration, Instant};

/// Counters and phase timings of the sweeps driven by one scheduler.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    pub num_sweeps: usize,
    /// Cell-angle pairs processed by chunks.
    pub cells_swept: usize,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub doubles_sent: usize,
    /// Total wall time inside [`SweepScheduler::sweep`].
    pub sweep_time: Duration,
    /// Wall time of the post-barrier delayed-data drain.
    pub delayed_drain_time: Duration,
}

/// Priority record of one angle-set under the depth-of-graph rule.
#[derive(Debug, Clone)]
struct RuleValue {
    set_index: usize,
    depth_of_graph: usize,
    sign_of_omega: [u8; 3],
}

pub struct SweepScheduler<'a, C: Communicator> {
    comm: &'a C,
    angle_sets: Vec<AngleSet>,
    boundaries: BoundaryMap,
    rule_values: Vec<RuleValue>,
    stats: SweepStats,
    /// A sweep with no state transition for this long is declared hung.
    pub stall_timeout: Duration,
}

impl<'a, C: Communicator> SweepScheduler<'a, C> {
    /// Builds the scheduler and fixes the depth-of-graph polling order.
    pub fn new(comm: &'a C, angle_sets: Vec<AngleSet>, boundaries: BoundaryMap) -> Self {
        let mut rule_values: Vec<RuleValue> = angle_sets
            .iter()
            .enumerate()
            .map(|(set_index, angle_set)| RuleValue {
                set_index,
                depth_of_graph: angle_set.spds.depth_of_graph,
                sign_of_omega: angle_set
                    .spds
                    .omega
                    .map(|component| if component >= 0.0 { 2 } else { 1 }),
            })
            .collect();

        // Depth descending, then sign bits descending; the sort is stable,
        // so sets tied on every key keep their construction order, which is
        // identical on all ranks.
        rule_values.sort_by(|a, b| {
            b.depth_of_graph
                .cmp(&a.depth_of_graph)
                .then_with(|| b.sign_of_omega.cmp(&a.sign_of_omega))
        });

        SweepScheduler {
            comm,
            angle_sets,
            boundaries,
            rule_values,
            stats: SweepStats::default(),
            stall_timeout: Duration::from_secs(60),
        }
    }

    /// The angle-set indices in polling order. Exposed for order tests.
    pub fn schedule_order(&self) -> Vec<usize> {
        self.rule_values.iter().map(|rv| rv.set_index).collect()
    }

    pub fn stats(&self) -> &SweepStats {
        &self.stats
    }

    pub fn boundaries(&self) -> &BoundaryMap {
        &self.boundaries
    }

    pub fn boundaries_mut(&mut self) -> &mut BoundaryMap {
        &mut self.boundaries
    }

    /// Runs one full sweep: every angle-set traverses its SPLS once.
    pub fn sweep(&mut self, chunk: &mut dyn SweepChunk) -> Result<()> {
        let sweep_start = Instant::now();
        let Self {
            comm,
            angle_sets,
            boundaries,
            rule_values,
            stats,
            stall_timeout,
        } = self;

        let mut last_transition = Instant::now();
        loop {
            let mut finished = true;
            let mut progressed = false;
            for rule_value in rule_values.iter() {
                let angle_set = &mut angle_sets[rule_value.set_index];
                let before = angle_set.status();
                let mut status = angle_set.advance(
                    chunk,
                    boundaries,
                    *comm,
                    ExecutionPermission::NoExecIfReady,
                    stats,
                )?;
                if status == AngleSetStatus::ReadyToExecute {
                    debug!(
                        "angle-set {} executing on rank {}",
                        rule_value.set_index,
                        comm.rank()
                    );
                    status = angle_set.advance(
                        chunk,
                        boundaries,
                        *comm,
                        ExecutionPermission::Execute,
                        stats,
                    )?;
                }
                progressed |= status != before;
                if status != AngleSetStatus::Finished {
                    finished = false;
                }
            }
            if finished {
                break;
            }
            if progressed {
                last_transition = Instant::now();
            } else if last_transition.elapsed() > *stall_timeout {
                for rule_value in rule_values.iter() {
                    let angle_set = &angle_sets[rule_value.set_index];
                    if angle_set.status() != AngleSetStatus::Finished {
                        error!(
                            "rank {}: angle-set {} stuck in {:?}, pending {:?}",
                            comm.rank(),
                            angle_set.id,
                            angle_set.status(),
                            angle_set.pending_sources()
                        );
                    }
                }
                return Err(SweepError::CommFailure(format!(
                    "sweep made no progress on rank {} for {:?}",
                    comm.rank(),
                    stall_timeout
                ))
                .into());
            }
        }

        // All local work done; drain delayed data until quiescent.
        comm.barrier();
        let drain_start = Instant::now();
        loop {
            let mut received_all = true;
            for angle_set in angle_sets.iter_mut() {
                if !angle_set.flush_send_buffers() {
                    received_all = false;
                }
                if !angle_set.receive_delayed_data(*comm, stats) {
                    received_all = false;
                }
            }
            if received_all {
                break;
            }
            if drain_start.elapsed() > *stall_timeout {
                return Err(SweepError::CommFailure(format!(
                    "delayed-data drain stalled on rank {}",
                    comm.rank()
                ))
                .into());
            }
        }
        stats.delayed_drain_time += drain_start.elapsed();

        // Reset for the next outer iteration.
        for angle_set in angle_sets.iter_mut() {
            angle_set.reset();
        }
        for boundary in boundaries.values_mut() {
            boundary.reset();
        }

        stats.num_sweeps += 1;
        stats.sweep_time += sweep_start.elapsed();
        Ok(())
    }
}
