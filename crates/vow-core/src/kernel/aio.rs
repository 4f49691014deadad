// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async I/O multiplexer: fans submissions out to subsystem worker pools
//! and fans completions back in on a single return channel.
//!
//! Each registered subsystem gets a pool of OS worker threads. Per tick the
//! scheduler hands over one submission batch; the batch is partitioned by
//! kind and sharded round-robin by request index across the kind's workers.
//! Workers push completions onto the shared return channel, which the
//! scheduler drains at the top of the next tick. A saturated worker simply
//! queues its shard; the parked coroutines provide natural backpressure.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::debug;

use super::{Cqe, Kind, Sqe};

/// A subsystem executes submissions of one kind.
///
/// `process` is invoked concurrently across the pool's workers and must be
/// safe under that concurrency; it need not be internally concurrent.
/// Workers never panic on I/O failure: errors travel back inside the
/// completion batch.
pub trait Subsystem: Send + Sync {
    /// The kind of submission this subsystem handles.
    fn kind(&self) -> Kind;

    /// Worker pool size.
    fn workers(&self) -> usize;

    /// Execute a batch, returning one completion per submission.
    fn process(&self, batch: Vec<Sqe>) -> Vec<Cqe>;
}

struct Pool {
    shards: Vec<Sender<Vec<Sqe>>>,
    next: usize,
}

/// The AIO layer. Owns the worker threads of every registered subsystem.
pub struct Aio {
    pools: HashMap<Kind, Pool>,
    completion_tx: Sender<Cqe>,
    completion_rx: Receiver<Cqe>,
    workers: Vec<JoinHandle<()>>,
}

impl Aio {
    /// Create an empty AIO layer.
    pub fn new() -> Self {
        let (completion_tx, completion_rx) = unbounded();
        Aio {
            pools: HashMap::new(),
            completion_tx,
            completion_rx,
            workers: Vec::new(),
        }
    }

    /// Register a subsystem and start its worker pool.
    pub fn register(&mut self, subsystem: Arc<dyn Subsystem>) {
        let kind = subsystem.kind();
        assert!(
            !self.pools.contains_key(&kind),
            "subsystem for {:?} already registered",
            kind
        );

        let workers = subsystem.workers().max(1);
        let mut shards = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = unbounded::<Vec<Sqe>>();
            let completion_tx = self.completion_tx.clone();
            let subsystem = subsystem.clone();

            let handle = std::thread::Builder::new()
                .name(format!("aio-{}-{}", kind_label(kind), index))
                .spawn(move || {
                    while let Ok(batch) = rx.recv() {
                        for cqe in subsystem.process(batch) {
                            if completion_tx.send(cqe).is_err() {
                                return;
                            }
                        }
                    }
                })
                .expect("failed to spawn aio worker thread");

            shards.push(tx);
            self.workers.push(handle);
        }

        debug!(kind = kind_label(kind), workers, "subsystem registered");
        self.pools.insert(kind, Pool { shards, next: 0 });
    }

    /// Dispatch one tick's submission batch: partition by kind, shard
    /// round-robin by request index within each kind.
    pub fn dispatch(&mut self, batch: Vec<Sqe>) {
        let mut per_kind: HashMap<Kind, Vec<Sqe>> = HashMap::new();
        for sqe in batch {
            per_kind.entry(sqe.submission.kind()).or_default().push(sqe);
        }

        // Fixed kind order keeps dispatch deterministic.
        for kind in [Kind::Store, Kind::Network] {
            let Some(sqes) = per_kind.remove(&kind) else {
                continue;
            };
            let pool = self
                .pools
                .get_mut(&kind)
                .unwrap_or_else(|| panic!("no subsystem registered for {:?}", kind));

            let workers = pool.shards.len();
            let mut shards: Vec<Vec<Sqe>> = (0..workers).map(|_| Vec::new()).collect();
            for (index, sqe) in sqes.into_iter().enumerate() {
                shards[(pool.next + index) % workers].push(sqe);
            }
            pool.next = (pool.next + 1) % workers;

            for (worker, shard) in shards.into_iter().enumerate() {
                if !shard.is_empty() {
                    // A send fails only after shutdown began.
                    let _ = pool.shards[worker].send(shard);
                }
            }
        }
    }

    /// Drain every completion produced since the last call.
    pub fn drain_completions(&self) -> Vec<Cqe> {
        self.completion_rx.try_iter().collect()
    }

    /// Stop the worker pools and join their threads.
    pub fn shutdown(self) {
        drop(self.pools);
        drop(self.completion_tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

impl Default for Aio {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_label(kind: Kind) -> &'static str {
    match kind {
        Kind::Store => "store",
        Kind::Network => "network",
    }
}
