// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-threaded cooperative scheduler.
//!
//! The scheduler owns every live coroutine and a logical clock that is
//! advanced once per tick; within a tick all coroutines observe the same
//! time. A tick drains completions, admits new coroutines from the ingress
//! channel, runs every runnable coroutine until it yields or finishes, and
//! hands the collected submission batch to the AIO layer.
//!
//! Coroutine code runs exclusively on the scheduler thread, so no locks
//! guard in-kernel state. The only suspension point is a yield; the
//! continuation runs on a later tick, on this thread, before any other
//! code of the same coroutine.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_channel::{Receiver, TryRecvError};

use super::aio::Aio;
use super::{Completion, Cqe, HttpPost, HttpResult, Sqe, Submission};
use crate::error::Error;
use crate::store::{CommandResult, Transaction};

/// Source of logical time, in milliseconds since epoch.
///
/// The scheduler reads the clock exactly once per tick; nothing else in the
/// kernel reads wall-clock time. Tests inject a [`ManualClock`] to drive
/// deterministic trajectories.
pub trait Clock: Send {
    /// Current time in milliseconds since epoch.
    fn now(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock whose time is set explicitly, shared with the test driving it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock starting at `time`.
    pub fn starting_at(time: i64) -> Self {
        ManualClock {
            time: Arc::new(AtomicI64::new(time)),
        }
    }

    /// Set the clock.
    pub fn set(&self, time: i64) {
        self.time.store(time, Ordering::SeqCst);
    }

    /// Advance the clock by `delta` milliseconds.
    pub fn advance(&self, delta: i64) {
        self.time.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }
}

/// What a coroutine sees while it runs: the tick's logical time and the
/// ability to spawn sibling coroutines.
pub struct Context<'a> {
    time: i64,
    spawned: &'a mut Vec<Coroutine>,
}

impl Context<'_> {
    /// Logical time of the current tick.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Spawn a sibling coroutine; it runs within the same tick, after the
    /// coroutines already runnable.
    pub fn spawn(&mut self, coroutine: Coroutine) {
        self.spawned.push(coroutine);
    }
}

/// A parked coroutine's resume function.
pub type Continuation =
    Box<dyn FnOnce(&mut Context<'_>, Result<Completion, Error>) -> Step + Send>;

/// The outcome of running a coroutine slice.
pub enum Step {
    /// Suspend on a submission; the continuation is invoked with its
    /// completion on a later tick.
    Yield(Submission, Continuation),
    /// The coroutine has terminated.
    Done,
}

impl Step {
    /// Yield a store transaction. The continuation receives the
    /// per-command results; a completion of any other kind is a kernel bug
    /// and aborts.
    pub fn store<F>(transaction: Transaction, continuation: F) -> Step
    where
        F: FnOnce(&mut Context<'_>, Result<Vec<CommandResult>, Error>) -> Step + Send + 'static,
    {
        Step::Yield(
            Submission::Store(transaction),
            Box::new(move |ctx, outcome| match outcome {
                Ok(Completion::Store(results)) => continuation(ctx, Ok(results)),
                Ok(other) => panic!("store yield resumed with {:?} completion", other.kind()),
                Err(err) => continuation(ctx, Err(err)),
            }),
        )
    }

    /// Yield an HTTP POST to the network subsystem.
    pub fn network<F>(post: HttpPost, continuation: F) -> Step
    where
        F: FnOnce(&mut Context<'_>, Result<HttpResult, Error>) -> Step + Send + 'static,
    {
        Step::Yield(
            Submission::Network(post),
            Box::new(move |ctx, outcome| match outcome {
                Ok(Completion::Network(result)) => continuation(ctx, Ok(result)),
                Ok(other) => panic!("network yield resumed with {:?} completion", other.kind()),
                Err(err) => continuation(ctx, Err(err)),
            }),
        )
    }
}

/// A named unit of kernel control flow.
pub struct Coroutine {
    name: &'static str,
    entry: Box<dyn FnOnce(&mut Context<'_>) -> Step + Send>,
}

impl Coroutine {
    /// Create a coroutine from its entry function.
    pub fn new<F>(name: &'static str, entry: F) -> Self
    where
        F: FnOnce(&mut Context<'_>) -> Step + Send + 'static,
    {
        Coroutine {
            name,
            entry: Box::new(entry),
        }
    }

    /// The coroutine's name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine").field("name", &self.name).finish()
    }
}

enum Runnable {
    New(Coroutine),
    Resumed {
        name: &'static str,
        continuation: Continuation,
        completion: Result<Completion, Error>,
    },
}

struct Parked {
    name: &'static str,
    continuation: Continuation,
}

/// The cooperative scheduler.
pub struct Scheduler {
    clock: Box<dyn Clock>,
    time: i64,
    next_token: u64,
    runnable: VecDeque<Runnable>,
    parked: HashMap<u64, Parked>,
    ingress: Receiver<Coroutine>,
    ingress_open: bool,
    tick_batch: usize,
    aio: Aio,
}

impl Scheduler {
    /// Create a scheduler over an ingress channel and a started AIO layer.
    pub fn new(
        clock: Box<dyn Clock>,
        ingress: Receiver<Coroutine>,
        tick_batch: usize,
        aio: Aio,
    ) -> Self {
        let time = clock.now();
        Scheduler {
            clock,
            time,
            next_token: 0,
            runnable: VecDeque::new(),
            parked: HashMap::new(),
            ingress,
            ingress_open: true,
            tick_batch,
            aio,
        }
    }

    /// Logical time observed during the most recent tick.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Add a coroutine directly, bypassing the ingress channel. Used for
    /// kernel-internal coroutines such as the timeout sweeper.
    pub fn add(&mut self, coroutine: Coroutine) {
        self.runnable.push_back(Runnable::New(coroutine));
    }

    /// Stop admitting coroutines from the ingress channel.
    pub fn close_ingress(&mut self) {
        self.ingress_open = false;
    }

    /// Whether the ingress is closed and no coroutine is live.
    pub fn is_idle(&self) -> bool {
        !self.ingress_open && self.runnable.is_empty() && self.parked.is_empty()
    }

    /// Run one tick: bind completions, admit ingress, run every runnable
    /// coroutine until it yields or finishes, dispatch the submission
    /// batch.
    pub fn tick(&mut self) {
        self.time = self.clock.now();

        for cqe in self.aio.drain_completions() {
            let Cqe { token, completion } = cqe;
            match self.parked.remove(&token) {
                Some(parked) => self.runnable.push_back(Runnable::Resumed {
                    name: parked.name,
                    continuation: parked.continuation,
                    completion,
                }),
                None => panic!("completion for unknown token {}", token),
            }
        }

        if self.ingress_open {
            for _ in 0..self.tick_batch {
                match self.ingress.try_recv() {
                    Ok(coroutine) => self.runnable.push_back(Runnable::New(coroutine)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.ingress_open = false;
                        break;
                    }
                }
            }
        }

        let mut submissions = Vec::new();
        while let Some(runnable) = self.runnable.pop_front() {
            let mut spawned = Vec::new();
            let mut ctx = Context {
                time: self.time,
                spawned: &mut spawned,
            };

            let (name, step) = match runnable {
                Runnable::New(coroutine) => {
                    let name = coroutine.name;
                    (name, (coroutine.entry)(&mut ctx))
                }
                Runnable::Resumed {
                    name,
                    continuation,
                    completion,
                } => (name, continuation(&mut ctx, completion)),
            };

            match step {
                Step::Yield(submission, continuation) => {
                    let token = self.next_token;
                    self.next_token += 1;
                    self.parked.insert(token, Parked { name, continuation });
                    submissions.push(Sqe { token, submission });
                }
                Step::Done => {}
            }

            for coroutine in spawned {
                self.runnable.push_back(Runnable::New(coroutine));
            }
        }

        if !submissions.is_empty() {
            self.aio.dispatch(submissions);
        }
    }

    /// Tear down the AIO layer, joining its worker threads.
    pub fn shutdown(self) {
        self.aio.shutdown();
    }
}
