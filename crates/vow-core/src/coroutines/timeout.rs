// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The timeout transition, in both of its forms: the per-promise cascade
//! spawned lazily by a read that finds an expired pending promise, and the
//! periodic sweeper that processes the timeouts table in bulk. Both
//! converge because every transition is guarded on `state = Pending`.

use tracing::{error, info};

use crate::error::Error;
use crate::kernel::scheduler::{Context, Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::{Promise, State, Value};

/// How the per-promise timeout transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// This coroutine transitioned the promise to Timedout.
    Committed,
    /// Another coroutine completed the promise first; re-read to observe
    /// the winner.
    Lost,
}

/// Continuation invoked when the timeout transaction finishes.
pub type TimeoutResume =
    Box<dyn FnOnce(&mut Context<'_>, Result<TimeoutOutcome, Error>) + Send>;

/// Transition one expired pending promise to Timedout, creating its
/// notifications and deleting its subscriptions and timeout row in the
/// same transaction.
pub fn timeout_promise(promise: Promise, resume: TimeoutResume) -> Coroutine {
    Coroutine::new("timeout_promise", move |_ctx| {
        let transaction = Transaction::new(vec![
            Command::UpdatePromise {
                id: promise.id.clone(),
                state: State::Timedout,
                value: Value::default(),
                idempotency_key: None,
                completed_on: promise.timeout,
            },
            Command::CreateNotifications {
                promise_id: promise.id.clone(),
                time: promise.timeout,
            },
            Command::DeleteSubscriptions {
                promise_id: promise.id.clone(),
            },
            Command::DeleteTimeout {
                id: promise.id.clone(),
            },
        ]);

        Step::store(transaction, move |ctx, outcome| {
            match outcome {
                Err(err) => resume(ctx, Err(err)),
                Ok(results) => {
                    if results[0].rows_affected() == 1 {
                        resume(ctx, Ok(TimeoutOutcome::Committed));
                    } else {
                        resume(ctx, Ok(TimeoutOutcome::Lost));
                    }
                }
            }
            Step::Done
        })
    })
}

/// The periodic sweeper: read due rows from the timeouts table, then
/// transition every expired pending promise in one transaction.
///
/// Notifications are derived before subscriptions are deleted and both
/// before the promises leave Pending, so the three bulk commands see a
/// consistent view.
pub fn sweep_timeouts(batch: i64) -> Coroutine {
    Coroutine::new("sweep_timeouts", move |_ctx| {
        Step::store(
            Transaction::one(Command::ReadTimeouts { n: batch }),
            move |ctx, outcome| {
                let mut results = match outcome {
                    Ok(results) => results,
                    Err(err) => {
                        error!(error = %err, "failed to read timeouts");
                        return Step::Done;
                    }
                };

                let now = ctx.time();
                let due: Vec<String> = results
                    .remove(0)
                    .into_read_timeouts()
                    .into_iter()
                    .filter(|record| record.time <= now)
                    .map(|record| record.id)
                    .collect();

                if due.is_empty() {
                    return Step::Done;
                }

                let mut commands = vec![
                    Command::TimeoutCreateNotifications { time: now },
                    Command::TimeoutDeleteSubscriptions { time: now },
                    Command::TimeoutPromises { time: now },
                ];
                commands.extend(due.into_iter().map(|id| Command::DeleteTimeout { id }));

                Step::store(Transaction::new(commands), move |_ctx, outcome| {
                    match outcome {
                        Ok(results) => {
                            let swept = results[2].rows_affected();
                            if swept > 0 {
                                info!(swept, "timed out expired promises");
                            }
                        }
                        Err(err) => error!(error = %err, "timeout sweep failed"),
                    }
                    Step::Done
                })
            },
        )
    })
}
