// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion verbs: resolve, reject, and cancel share one coroutine
//! parameterized by the target state.
//!
//! The update is CAS-guarded on `state = Pending`; zero rows affected
//! means another coroutine completed the promise between our read and
//! write, and the verb retries from the read to observe the winner.

use tracing::error;

use crate::api::{CompletePromiseRequest, Response, ResponseSink};
use crate::kernel::scheduler::{Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::{Promise, State, Status, completion_status};

use super::timeout::{TimeoutOutcome, timeout_promise};

/// Complete a pending promise with `target` (Resolved, Rejected, or
/// Canceled).
pub fn complete_promise(
    target: State,
    req: CompletePromiseRequest,
    sink: ResponseSink,
) -> Coroutine {
    let name = match target {
        State::Resolved => "resolve_promise",
        State::Rejected => "reject_promise",
        State::Canceled => "cancel_promise",
        other => panic!("{:?} is not a completion target", other),
    };

    Coroutine::new(name, move |_ctx| {
        Step::store(
            Transaction::one(Command::ReadPromise { id: req.id.clone() }),
            move |ctx, outcome| {
                let mut results = match outcome {
                    Ok(results) => results,
                    Err(err) => {
                        error!(id = %req.id, error = %err, "failed to read promise");
                        return sink.fail(err);
                    }
                };

                let Some(record) = results.remove(0).into_read_promise() else {
                    return sink.respond(Response::Promise {
                        status: Status::NotFound,
                        promise: None,
                    });
                };

                let promise = match record.into_promise() {
                    Ok(promise) => promise,
                    Err(err) => {
                        error!(id = %req.id, error = %err, "failed to decode promise record");
                        return sink.fail(err);
                    }
                };

                if promise.state != State::Pending {
                    let status = completion_status(
                        promise.state,
                        target,
                        req.strict,
                        promise.idempotency_key_for_complete.as_deref(),
                        req.idempotency_key.as_deref(),
                    );
                    return sink.respond(Response::Promise {
                        status,
                        promise: Some(promise),
                    });
                }

                if ctx.time() >= promise.timeout {
                    let snapshot = promise.timed_out_view();
                    ctx.spawn(timeout_promise(
                        promise,
                        Box::new(move |ctx, outcome| match outcome {
                            Err(err) => {
                                error!(id = %req.id, error = %err, "failed to timeout promise");
                                sink.send(Err(err));
                            }
                            Ok(TimeoutOutcome::Committed) => {
                                sink.send(Ok(Response::Promise {
                                    status: Status::Forbidden,
                                    promise: Some(snapshot),
                                }));
                            }
                            Ok(TimeoutOutcome::Lost) => {
                                ctx.spawn(complete_promise(target, req, sink));
                            }
                        }),
                    ));
                    return Step::Done;
                }

                let completed_on = ctx.time();
                let transaction = Transaction::new(vec![
                    Command::UpdatePromise {
                        id: req.id.clone(),
                        state: target,
                        value: req.value.clone(),
                        idempotency_key: req.idempotency_key.clone(),
                        completed_on,
                    },
                    Command::CreateNotifications {
                        promise_id: req.id.clone(),
                        time: completed_on,
                    },
                    Command::DeleteSubscriptions {
                        promise_id: req.id.clone(),
                    },
                    Command::DeleteTimeout { id: req.id.clone() },
                ]);

                Step::store(transaction, move |ctx, outcome| {
                    let results = match outcome {
                        Ok(results) => results,
                        Err(err) => {
                            error!(id = %req.id, error = %err, "failed to update promise");
                            return sink.fail(err);
                        }
                    };

                    if results[0].rows_affected() == 1 {
                        let completed = Promise {
                            id: promise.id,
                            state: target,
                            param: promise.param,
                            value: req.value,
                            timeout: promise.timeout,
                            idempotency_key_for_create: promise.idempotency_key_for_create,
                            idempotency_key_for_complete: req.idempotency_key,
                            tags: promise.tags,
                            created_on: promise.created_on,
                            completed_on: Some(completed_on),
                        };
                        sink.respond(Response::Promise {
                            status: Status::Created,
                            promise: Some(completed),
                        })
                    } else {
                        // Lost the update race; retry from the read.
                        ctx.spawn(complete_promise(target, req, sink));
                        Step::Done
                    }
                })
            },
        )
    })
}
