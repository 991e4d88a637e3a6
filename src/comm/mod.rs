/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The rank-to-rank message fabric.
//!
//! The sweep core is SPMD: every rank runs the same program against its own
//! [`GridView`](crate::mesh::GridView) slice and exchanges face fluxes
//! through a [`Communicator`]. The trait mirrors the non-blocking message
//! passing the scheduler needs: buffered sends, `try_recv` probes that never
//! block, barriers and the two reductions the outer solvers use.
//!
//! [`ThreadWorld`] is the in-process backend: one OS thread per rank, one
//! channel per ordered rank pair, collectives through shared slots guarded
//! by barriers. An MPI backend would implement the same trait; nothing else
//! in the crate knows which fabric it is running on.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Mutex};

/// Distinguishes regular sweep payloads from delayed (cycle-edge) payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Sweep,
    Delayed,
}

/// The tag of a flux message. The source rank is implicit in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageTag {
    pub angle_set: u32,
    pub kind: MessageKind,
}

/// A non-blocking, tag-matched message fabric for one rank.
pub trait Communicator {
    fn rank(&self) -> usize;
    fn num_ranks(&self) -> usize;

    /// Posts a message. The call buffers and returns immediately.
    fn send(&self, to: usize, tag: MessageTag, payload: Vec<f64>);

    /// Probes for a message with the given source and tag. Never blocks;
    /// messages from the same source with the same tag arrive in send order.
    fn try_recv(&self, from: usize, tag: MessageTag) -> Option<Vec<f64>>;

    /// Collective: blocks until every rank has entered.
    fn barrier(&self);

    /// Collective: every rank receives every rank's contribution, indexed by
    /// rank.
    fn allgather_u64(&self, data: &[u64]) -> Vec<Vec<u64>>;

    /// Collective max reduction.
    fn allreduce_max(&self, value: f64) -> f64;

    /// Collective sum reduction. Summation order is by rank, so the result
    /// is bitwise identical on every rank.
    fn allreduce_sum(&self, value: f64) -> f64;
}

struct Packet {
    tag: MessageTag,
    payload: Vec<f64>,
}

struct WorldShared {
    barrier: Barrier,
    gather: Mutex<Vec<Vec<u64>>>,
    reduce: Mutex<Vec<f64>>,
}

/// Factory for the per-rank [`ThreadComm`] handles of an in-process world.
pub struct ThreadWorld;

impl ThreadWorld {
    /// Builds the communicator handle of every rank of a `num_ranks`-wide
    /// world. The handles are meant to be moved into one thread each.
    pub fn new(num_ranks: usize) -> Vec<ThreadComm> {
        assert!(num_ranks > 0);
        let shared = Arc::new(WorldShared {
            barrier: Barrier::new(num_ranks),
            gather: Mutex::new(vec![Vec::new(); num_ranks]),
            reduce: Mutex::new(vec![0.0; num_ranks]),
        });
        let mut senders: Vec<Vec<crossbeam_channel::Sender<Packet>>> = Vec::new();
        let mut receivers: Vec<Vec<crossbeam_channel::Receiver<Packet>>> =
            (0..num_ranks).map(|_| Vec::new()).collect();
        for _src in 0..num_ranks {
            let mut row = Vec::new();
            for dst in 0..num_ranks {
                let (tx, rx) = crossbeam_channel::unbounded();
                row.push(tx);
                receivers[dst].push(rx);
            }
            senders.push(row);
        }
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inboxes)| ThreadComm {
                rank,
                num_ranks,
                shared: shared.clone(),
                outboxes: senders[rank].clone(),
                inboxes,
                stash: RefCell::new(HashMap::new()),
            })
            .collect()
    }

    /// Runs `body` on every rank of a fresh world, one scoped thread per
    /// rank, and returns the per-rank results in rank order.
    pub fn run<T, F>(num_ranks: usize, body: F) -> Vec<T>
    where
        T: Send,
        F: Fn(ThreadComm) -> T + Sync,
    {
        let comms = ThreadWorld::new(num_ranks);
        let body = &body;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || body(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }
}

/// One rank's handle into a [`ThreadWorld`].
pub struct ThreadComm {
    rank: usize,
    num_ranks: usize,
    shared: Arc<WorldShared>,
    /// `outboxes[dst]` sends to rank `dst`.
    outboxes: Vec<crossbeam_channel::Sender<Packet>>,
    /// `inboxes[src]` receives from rank `src`.
    inboxes: Vec<crossbeam_channel::Receiver<Packet>>,
    /// Messages drained from an inbox while looking for another tag.
    stash: RefCell<HashMap<(usize, MessageTag), VecDeque<Vec<f64>>>>,
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn send(&self, to: usize, tag: MessageTag, payload: Vec<f64>) {
        // The receiver may legitimately be done with this tag already (a
        // hung-up world only happens at teardown), so send errors are not
        // fatal here.
        let _ = self.outboxes[to].send(Packet { tag, payload });
    }

    fn try_recv(&self, from: usize, tag: MessageTag) -> Option<Vec<f64>> {
        let mut stash = self.stash.borrow_mut();
        if let Some(queue) = stash.get_mut(&(from, tag)) {
            if let Some(payload) = queue.pop_front() {
                return Some(payload);
            }
        }
        while let Ok(packet) = self.inboxes[from].try_recv() {
            if packet.tag == tag {
                return Some(packet.payload);
            }
            stash
                .entry((from, packet.tag))
                .or_default()
                .push_back(packet.payload);
        }
        None
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn allgather_u64(&self, data: &[u64]) -> Vec<Vec<u64>> {
        self.shared.gather.lock().unwrap()[self.rank] = data.to_vec();
        self.shared.barrier.wait();
        let result = self.shared.gather.lock().unwrap().clone();
        self.shared.barrier.wait();
        result
    }

    fn allreduce_max(&self, value: f64) -> f64 {
        self.shared.reduce.lock().unwrap()[self.rank] = value;
        self.shared.barrier.wait();
        let result = self
            .shared
            .reduce
            .lock()
            .unwrap()
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        self.shared.barrier.wait();
        result
    }

    fn allreduce_sum(&self, value: f64) -> f64 {
        self.shared.reduce.lock().unwrap()[self.rank] = value;
        self.shared.barrier.wait();
        let result = self.shared.reduce.lock().unwrap().iter().sum();
        self.shared.barrier.wait();
        result
    }
}

/// A single-rank communicator for serial runs and tests.
pub struct SelfComm {
    loopback: RefCell<HashMap<MessageTag, VecDeque<Vec<f64>>>>,
}

impl SelfComm {
    pub fn new() -> Self {
        SelfComm {
            loopback: RefCell::new(HashMap::new()),
        }
    }
}

impl Default for SelfComm {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn send(&self, to: usize, tag: MessageTag, payload: Vec<f64>) {
        debug_assert_eq!(to, 0);
        self.loopback
            .borrow_mut()
            .entry(tag)
            .or_default()
            .push_back(payload);
    }

    fn try_recv(&self, from: usize, tag: MessageTag) -> Option<Vec<f64>> {
        debug_assert_eq!(from, 0);
        self.loopback.borrow_mut().get_mut(&tag)?.pop_front()
    }

    fn barrier(&self) {}

    fn allgather_u64(&self, data: &[u64]) -> Vec<Vec<u64>> {
        vec![data.to_vec()]
    }

    fn allreduce_max(&self, value: f64) -> f64 {
        value
    }

    fn allreduce_sum(&self, value: f64) -> f64 {
        value
    }
}
