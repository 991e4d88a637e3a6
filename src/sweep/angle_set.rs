/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Angle-sets: the schedulable unit of a sweep.
//!
//! An angle-set is a group of directions sharing one SPDS, advanced together
//! over one group subset. It owns its FLUDS instance and all the in-flight
//! message bookkeeping, and exposes the small state machine the scheduler
//! polls: receive upstream flux, execute the sweep chunk once everything
//! arrived, post downstream sends, done.

use super::boundary::BoundaryMap;
use super::chunk::{SweepChunk, SweepSlice};
use super::fluds::Fluds;
use super::scheduler::SweepStats;
use super::spds::Spds;
use crate::comm::{Communicator, MessageKind, MessageTag};
use anyhow::Result;
use std::sync::Arc;

/// The lifecycle of an angle-set within one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleSetStatus {
    NotFinished,
    Receiving,
    ReadyToExecute,
    Executed,
    MessagesSent,
    Finished,
}

/// Whether a ready angle-set may run its chunk during this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPermission {
    NoExecIfReady,
    Execute,
}

pub struct AngleSet {
    /// Globally consistent id; part of every message tag.
    pub id: usize,
    /// Direction indices advanced together.
    pub angles: Vec<usize>,
    pub spds: Arc<Spds>,
    pub fluds: Fluds,
    /// First global group of the subset this set advances.
    pub gs_ss_begin: usize,
    /// Messages longer than this many doubles are split into parts.
    max_message_size: usize,
    status: AngleSetStatus,
    /// Doubles received so far, per predecessor.
    recv_filled: Vec<usize>,
    /// Doubles of delayed data received so far, per delayed predecessor.
    delayed_recv_filled: Vec<usize>,
}

impl AngleSet {
    pub fn new(
        id: usize,
        angles: Vec<usize>,
        spds: Arc<Spds>,
        fluds: Fluds,
        gs_ss_begin: usize,
        max_message_size: usize,
    ) -> Self {
        let num_preds = fluds.num_predecessors();
        let num_delayed = fluds.num_delayed_predecessors();
        AngleSet {
            id,
            angles,
            spds,
            fluds,
            gs_ss_begin,
            max_message_size: max_message_size.max(1),
            status: AngleSetStatus::NotFinished,
            recv_filled: vec![0; num_preds],
            delayed_recv_filled: vec![0; num_delayed],
        }
    }

    pub fn status(&self) -> AngleSetStatus {
        self.status
    }

    fn tag(&self, kind: MessageKind) -> MessageTag {
        MessageTag {
            angle_set: self.id as u32,
            kind,
        }
    }

    /// Ranks still owing sweep data, with the doubles outstanding. Used for
    /// stall diagnostics.
    pub fn pending_sources(&self) -> Vec<(usize, usize)> {
        (0..self.fluds.num_predecessors())
            .filter(|&i| self.recv_filled[i] < self.fluds.recv_expected(i))
            .map(|i| {
                (
                    self.fluds.predecessor_rank(i),
                    self.fluds.recv_expected(i) - self.recv_filled[i],
                )
            })
            .collect()
    }

    /// Polls regular receives; returns whether all prelocal data arrived.
    fn probe_receives<C: Communicator>(&mut self, comm: &C, stats: &mut SweepStats) -> bool {
        let mut all_done = true;
        for i in 0..self.fluds.num_predecessors() {
            let expected = self.fluds.recv_expected(i);
            while self.recv_filled[i] < expected {
                let from = self.fluds.predecessor_rank(i);
                match comm.try_recv(from, self.tag(MessageKind::Sweep)) {
                    Some(part) => {
                        self.fluds.fill_recv(i, self.recv_filled[i], &part);
                        self.recv_filled[i] += part.len();
                        stats.messages_received += 1;
                    }
                    None => break,
                }
            }
            all_done &= self.recv_filled[i] == expected;
        }
        all_done
    }

    /// Posts the non-blocking sends of all outgoing buffers, splitting at
    /// the configured message size.
    fn post_sends<C: Communicator>(&mut self, comm: &C, stats: &mut SweepStats) {
        for i in 0..self.fluds.num_successors() {
            let to = self.fluds.successor_rank(i);
            let payload = self.fluds.send_payload(i);
            for part in payload.chunks(self.max_message_size) {
                comm.send(to, self.tag(MessageKind::Sweep), part.to_vec());
                stats.messages_sent += 1;
                stats.doubles_sent += part.len();
            }
        }
        for i in 0..self.fluds.num_delayed_successors() {
            let to = self.fluds.delayed_successor_rank(i);
            let payload = self.fluds.delayed_send_payload(i);
            for part in payload.chunks(self.max_message_size) {
                comm.send(to, self.tag(MessageKind::Delayed), part.to_vec());
                stats.messages_sent += 1;
                stats.doubles_sent += part.len();
            }
        }
    }

    /// Advances the state machine; never blocks.
    pub fn advance<C: Communicator>(
        &mut self,
        chunk: &mut dyn SweepChunk,
        boundaries: &mut BoundaryMap,
        comm: &C,
        permission: ExecutionPermission,
        stats: &mut SweepStats,
    ) -> Result<AngleSetStatus> {
        match self.status {
            AngleSetStatus::NotFinished | AngleSetStatus::Receiving => {
                self.status = AngleSetStatus::Receiving;
                if !self.probe_receives(comm, stats) {
                    return Ok(AngleSetStatus::Receiving);
                }
                self.status = AngleSetStatus::ReadyToExecute;
                if permission == ExecutionPermission::NoExecIfReady {
                    return Ok(AngleSetStatus::ReadyToExecute);
                }
                self.execute(chunk, boundaries, comm, stats)
            }
            AngleSetStatus::ReadyToExecute => {
                if permission == ExecutionPermission::NoExecIfReady {
                    return Ok(AngleSetStatus::ReadyToExecute);
                }
                self.execute(chunk, boundaries, comm, stats)
            }
            AngleSetStatus::Executed | AngleSetStatus::MessagesSent => {
                // The fabric buffers sends, so posted messages are complete.
                self.status = AngleSetStatus::Finished;
                Ok(AngleSetStatus::Finished)
            }
            AngleSetStatus::Finished => Ok(AngleSetStatus::Finished),
        }
    }

    fn execute<C: Communicator>(
        &mut self,
        chunk: &mut dyn SweepChunk,
        boundaries: &mut BoundaryMap,
        comm: &C,
        stats: &mut SweepStats,
    ) -> Result<AngleSetStatus> {
        let slice = SweepSlice {
            angle_set_id: self.id,
            spds: &self.spds,
            fluds: &mut self.fluds,
            angles: &self.angles,
            gs_ss_begin: self.gs_ss_begin,
            boundaries,
        };
        chunk.sweep(slice)?;
        stats.cells_swept += self.spds.spls.len() * self.angles.len();
        self.post_sends(comm, stats);
        self.status = AngleSetStatus::Executed;
        Ok(AngleSetStatus::Executed)
    }

    /// Flushes pending send buffers; with a buffering fabric this is
    /// immediate. Returns whether everything went out.
    pub fn flush_send_buffers(&mut self) -> bool {
        true
    }

    /// Polls delayed receives into the next-iteration buffers; returns
    /// whether all delayed data arrived.
    pub fn receive_delayed_data<C: Communicator>(
        &mut self,
        comm: &C,
        stats: &mut SweepStats,
    ) -> bool {
        let mut all_done = true;
        for i in 0..self.fluds.num_delayed_predecessors() {
            let expected = self.fluds.delayed_recv_expected(i);
            while self.delayed_recv_filled[i] < expected {
                let from = self.fluds.delayed_predecessor_rank(i);
                match comm.try_recv(from, self.tag(MessageKind::Delayed)) {
                    Some(part) => {
                        self.fluds
                            .fill_delayed_recv(i, self.delayed_recv_filled[i], &part);
                        self.delayed_recv_filled[i] += part.len();
                        stats.messages_received += 1;
                    }
                    None => break,
                }
            }
            all_done &= self.delayed_recv_filled[i] == expected;
        }
        all_done
    }

    /// End-of-iteration reset: state machine back to start, delayed buffers
    /// rolled.
    pub fn reset(&mut self) {
        self.status = AngleSetStatus::NotFinished;
        self.recv_filled.iter_mut().for_each(|f| *f = 0);
        self.delayed_recv_filled.iter_mut().for_each(|f| *f = 0);
        self.fluds.reset();
    }
}
