// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read one promise, lazily timing it out when its deadline has passed.

use tracing::error;

use crate::api::{ReadPromiseRequest, Response, ResponseSink};
use crate::kernel::scheduler::{Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::{State, Status};

use super::timeout::{TimeoutOutcome, timeout_promise};

/// Read a promise by id.
///
/// A pending promise found past its deadline is transitioned to Timedout
/// before responding; the caller sees the timed-out snapshot with 200.
pub fn read_promise(req: ReadPromiseRequest, sink: ResponseSink) -> Coroutine {
    Coroutine::new("read_promise", move |_ctx| {
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

                if promise.state == State::Pending && ctx.time() >= promise.timeout {
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
                                    status: Status::Ok,
                                    promise: Some(snapshot),
                                }));
                            }
                            // A completion raced us; re-read to observe it.
                            Ok(TimeoutOutcome::Lost) => ctx.spawn(read_promise(req, sink)),
                        }),
                    ));
                    Step::Done
                } else {
                    sink.respond(Response::Promise {
                        status: Status::Ok,
                        promise: Some(promise),
                    })
                }
            },
        )
    })
}
