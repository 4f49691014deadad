// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Promise creation: optimistic insert, then idempotency resolution when
//! the id already exists.

use tracing::error;

use crate::api::{CreatePromiseRequest, Response, ResponseSink};
use crate::kernel::scheduler::{Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::{Promise, State, Status, Value, keys_match};

use super::timeout::{TimeoutOutcome, timeout_promise};

/// Create a promise. The insert carries `ON CONFLICT DO NOTHING`; when no
/// row lands, the existing record is re-read and judged by the
/// idempotency and strict rules.
pub fn create_promise(req: CreatePromiseRequest, sink: ResponseSink) -> Coroutine {
    Coroutine::new("create_promise", move |ctx| {
        let created_on = ctx.time();
        let transaction = Transaction::new(vec![
            Command::CreatePromise {
                id: req.id.clone(),
                param: req.param.clone(),
                timeout: req.timeout,
                idempotency_key: req.idempotency_key.clone(),
                tags: req.tags.clone(),
                created_on,
            },
            Command::CreateTimeout {
                id: req.id.clone(),
                time: req.timeout,
            },
        ]);

        Step::store(transaction, move |_ctx, outcome| {
            let results = match outcome {
                Ok(results) => results,
                Err(err) => {
                    error!(id = %req.id, error = %err, "failed to create promise");
                    return sink.fail(err);
                }
            };

            if results[0].rows_affected() == 1 {
                let promise = Promise {
                    id: req.id,
                    state: State::Pending,
                    param: req.param,
                    value: Value::default(),
                    timeout: req.timeout,
                    idempotency_key_for_create: req.idempotency_key,
                    idempotency_key_for_complete: None,
                    tags: req.tags,
                    created_on: Some(created_on),
                    completed_on: None,
                };
                sink.respond(Response::Promise {
                    status: Status::Created,
                    promise: Some(promise),
                })
            } else {
                reread_existing(req, sink)
            }
        })
    })
}

fn reread_existing(req: CreatePromiseRequest, sink: ResponseSink) -> Step {
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
                // The conflicting row vanished between insert and re-read;
                // start over.
                ctx.spawn(create_promise(req, sink));
                return Step::Done;
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
                            let status = create_status(&snapshot, &req);
                            sink.send(Ok(Response::Promise {
                                status,
                                promise: Some(snapshot),
                            }));
                        }
                        Ok(TimeoutOutcome::Lost) => ctx.spawn(create_promise(req, sink)),
                    }),
                ));
                Step::Done
            } else {
                let status = create_status(&promise, &req);
                sink.respond(Response::Promise {
                    status,
                    promise: Some(promise),
                })
            }
        },
    )
}

/// Status for a create that collided with an existing promise.
///
/// A matching idempotency key outside strict mode is an OK replay. Under
/// strict mode the replay must also find the stored record unchanged
/// (still pending, same timeout and param) to count as the same create;
/// anything else is a collision.
fn create_status(stored: &Promise, req: &CreatePromiseRequest) -> Status {
    let key_match = keys_match(
        stored.idempotency_key_for_create.as_deref(),
        req.idempotency_key.as_deref(),
    );

    if key_match {
        if req.strict {
            let body_match = stored.timeout == req.timeout && stored.param == req.param;
            if stored.state == State::Pending && body_match {
                Status::Created
            } else {
                Status::Conflict
            }
        } else {
            Status::Ok
        }
    } else if req.strict {
        Status::Conflict
    } else {
        Status::Forbidden
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn stored(state: State, timeout: i64, key: Option<&str>) -> Promise {
        Promise {
            id: "p1".to_string(),
            state,
            param: Value::default(),
            value: Value::default(),
            timeout,
            idempotency_key_for_create: key.map(String::from),
            idempotency_key_for_complete: None,
            tags: HashMap::new(),
            created_on: Some(0),
            completed_on: None,
        }
    }

    fn request(strict: bool, timeout: i64, key: Option<&str>) -> CreatePromiseRequest {
        CreatePromiseRequest {
            id: "p1".to_string(),
            idempotency_key: key.map(String::from),
            strict,
            param: Value::default(),
            timeout,
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_replay_with_matching_key_is_ok() {
        let status = create_status(
            &stored(State::Pending, 100, Some("k")),
            &request(false, 100, Some("k")),
        );
        assert_eq!(status, Status::Ok);
    }

    #[test]
    fn test_strict_replay_with_identical_body_is_created() {
        let status = create_status(
            &stored(State::Pending, 100, Some("k")),
            &request(true, 100, Some("k")),
        );
        assert_eq!(status, Status::Created);
    }

    #[test]
    fn test_strict_replay_with_conflicting_body_is_conflict() {
        let status = create_status(
            &stored(State::Pending, 100, Some("k")),
            &request(true, 999, Some("k")),
        );
        assert_eq!(status, Status::Conflict);
    }

    #[test]
    fn test_strict_collision_without_key_is_conflict() {
        let status = create_status(&stored(State::Pending, 100, None), &request(true, 100, None));
        assert_eq!(status, Status::Conflict);
    }

    #[test]
    fn test_collision_without_key_is_forbidden() {
        let status =
            create_status(&stored(State::Pending, 100, None), &request(false, 100, None));
        assert_eq!(status, Status::Forbidden);
    }

    #[test]
    fn test_strict_replay_on_completed_promise_is_conflict() {
        let status = create_status(
            &stored(State::Resolved, 100, Some("k")),
            &request(true, 100, Some("k")),
        );
        assert_eq!(status, Status::Conflict);
    }
}
