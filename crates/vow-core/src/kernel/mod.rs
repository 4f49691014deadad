// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The cooperative kernel: scheduler, AIO multiplexer, and the submission
//! bus connecting them.
//!
//! ```text
//! ┌───────────┐  ingress   ┌────────────┐  submissions  ┌───────────┐
//! │  API      │──────────► │ Scheduler  │─────────────► │   AIO     │
//! │ (typed    │            │ (one tick  │               │ (worker   │
//! │  requests)│            │  at a time)│ ◄─────────────│  pools)   │
//! └───────────┘            └────────────┘  completions  └───────────┘
//!                                                        │        │
//!                                                     ┌──▼──┐  ┌──▼──────┐
//!                                                     │Store│  │ Network │
//!                                                     └─────┘  └─────────┘
//! ```
//!
//! A submission issued in tick *k* completes no earlier than tick *k+1*;
//! the scheduler binds each completion back to the coroutine that yielded
//! it before running any other code of that coroutine.

pub mod aio;
pub mod scheduler;

use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::store::{CommandResult, Transaction};

/// Subsystem kinds submissions are routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The transactional store.
    Store,
    /// The outbound HTTP notification sender.
    Network,
}

/// An outbound HTTP POST carrying a completion event.
#[derive(Debug, Clone)]
pub struct HttpPost {
    /// Target URL.
    pub url: String,
    /// JSON body.
    pub body: JsonValue,
}

/// Outcome of an HTTP POST. Delivery failure is data, not an error: the
/// sender decides whether to retry.
#[derive(Debug, Clone, Copy)]
pub struct HttpResult {
    /// Whether the response status was 2xx.
    pub success: bool,
    /// The response status, when a response was received at all.
    pub status: Option<u16>,
}

/// A work item leaving the kernel.
#[derive(Debug)]
pub enum Submission {
    /// Commands to execute atomically in the store.
    Store(Transaction),
    /// An HTTP POST to deliver.
    Network(HttpPost),
}

impl Submission {
    /// The subsystem this submission is routed to.
    pub fn kind(&self) -> Kind {
        match self {
            Submission::Store(_) => Kind::Store,
            Submission::Network(_) => Kind::Network,
        }
    }
}

/// The response returning to the kernel.
#[derive(Debug)]
pub enum Completion {
    /// Per-command results of a store transaction.
    Store(Vec<CommandResult>),
    /// Outcome of an HTTP POST.
    Network(HttpResult),
}

impl Completion {
    /// The subsystem this completion came from.
    pub fn kind(&self) -> Kind {
        match self {
            Completion::Store(_) => Kind::Store,
            Completion::Network(_) => Kind::Network,
        }
    }
}

/// A submission queue entry: a submission tagged with the token of the
/// coroutine parked on it.
#[derive(Debug)]
pub struct Sqe {
    /// Correlation token assigned at yield time.
    pub token: u64,
    /// The work item.
    pub submission: Submission,
}

/// A completion queue entry returned by a subsystem worker.
#[derive(Debug)]
pub struct Cqe {
    /// The token of the originating submission.
    pub token: u64,
    /// The result; workers never panic, they report errors here.
    pub completion: Result<Completion, Error>,
}
