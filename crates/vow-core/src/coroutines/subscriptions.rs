// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subscription verbs. A subscription can only be attached to a live
//! pending promise; completion (or timeout) of the promise deletes its
//! subscriptions as part of the same transaction, so the verbs here never
//! race that invariant.

use tracing::error;

use crate::api::{
    CreateSubscriptionRequest, DeleteSubscriptionRequest, ReadSubscriptionsRequest, Response,
    ResponseSink, decode_cursor, encode_cursor,
};
use crate::kernel::scheduler::{Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::{State, Status, Subscription};

/// Register a callback URL on a pending promise.
///
/// 404 when the promise is unknown; 403 when it is terminal or past its
/// deadline (the sweeper converges the stored state). A duplicate
/// `(id, promiseId)` returns the existing subscription with 200.
pub fn create_subscription(req: CreateSubscriptionRequest, sink: ResponseSink) -> Coroutine {
    Coroutine::new("create_subscription", move |_ctx| {
        Step::store(
            Transaction::one(Command::ReadPromise {
                id: req.promise_id.clone(),
            }),
            move |ctx, outcome| {
                let mut results = match outcome {
                    Ok(results) => results,
                    Err(err) => {
                        error!(promise_id = %req.promise_id, error = %err, "failed to read promise");
                        return sink.fail(err);
                    }
                };

                let Some(record) = results.remove(0).into_read_promise() else {
                    return sink.respond(Response::Subscription {
                        status: Status::NotFound,
                        subscription: None,
                    });
                };

                let promise = match record.into_promise() {
                    Ok(promise) => promise,
                    Err(err) => {
                        error!(promise_id = %req.promise_id, error = %err, "failed to decode promise record");
                        return sink.fail(err);
                    }
                };

                if promise.state != State::Pending || ctx.time() >= promise.timeout {
                    return sink.respond(Response::Subscription {
                        status: Status::Forbidden,
                        subscription: None,
                    });
                }

                let created_on = ctx.time();
                let retry_policy = req.retry_policy.unwrap_or_default();
                let insert = Command::CreateSubscription {
                    id: req.id.clone(),
                    promise_id: req.promise_id.clone(),
                    url: req.url.clone(),
                    retry_policy,
                    created_on,
                };

                Step::store(Transaction::one(insert), move |_ctx, outcome| {
                    let results = match outcome {
                        Ok(results) => results,
                        Err(err) => {
                            error!(id = %req.id, error = %err, "failed to create subscription");
                            return sink.fail(err);
                        }
                    };

                    if results[0].rows_affected() == 1 {
                        sink.respond(Response::Subscription {
                            status: Status::Created,
                            subscription: Some(Subscription {
                                id: req.id,
                                promise_id: req.promise_id,
                                url: req.url,
                                retry_policy,
                                created_on: Some(created_on),
                                sort_id: None,
                            }),
                        })
                    } else {
                        read_existing(req, sink)
                    }
                })
            },
        )
    })
}

fn read_existing(req: CreateSubscriptionRequest, sink: ResponseSink) -> Step {
    Step::store(
        Transaction::one(Command::ReadSubscription {
            id: req.id.clone(),
            promise_id: req.promise_id.clone(),
        }),
        move |_ctx, outcome| {
            let mut results = match outcome {
                Ok(results) => results,
                Err(err) => {
                    error!(id = %req.id, error = %err, "failed to read subscription");
                    return sink.fail(err);
                }
            };

            match results.remove(0).into_read_subscription() {
                Some(record) => match record.into_subscription() {
                    Ok(subscription) => sink.respond(Response::Subscription {
                        status: Status::Ok,
                        subscription: Some(subscription),
                    }),
                    Err(err) => {
                        error!(id = %req.id, error = %err, "failed to decode subscription record");
                        sink.fail(err)
                    }
                },
                // Deleted between our insert attempt and this read.
                None => sink.respond(Response::Subscription {
                    status: Status::NotFound,
                    subscription: None,
                }),
            }
        },
    )
}

/// List a promise's subscriptions, keyset-paginated like promise search.
pub fn read_subscriptions(req: ReadSubscriptionsRequest, sink: ResponseSink) -> Coroutine {
    Coroutine::new("read_subscriptions", move |_ctx| {
        let sort_id = match req.cursor.as_deref().map(decode_cursor).transpose() {
            Ok(sort_id) => sort_id,
            Err(err) => return sink.fail(err),
        };

        let limit = req.limit;
        let command = Command::ReadSubscriptions {
            promise_id: req.promise_id.clone(),
            limit,
            sort_id,
        };

        Step::store(Transaction::one(command), move |_ctx, outcome| {
            let mut results = match outcome {
                Ok(results) => results,
                Err(err) => {
                    error!(promise_id = %req.promise_id, error = %err, "failed to read subscriptions");
                    return sink.fail(err);
                }
            };

            let (records, last_sort_id) = results.remove(0).into_read_subscriptions();
            let full_page = records.len() as i64 == limit;

            let mut subscriptions = Vec::with_capacity(records.len());
            for record in records {
                match record.into_subscription() {
                    Ok(subscription) => subscriptions.push(subscription),
                    Err(err) => {
                        error!(promise_id = %req.promise_id, error = %err, "failed to decode subscription record");
                        return sink.fail(err);
                    }
                }
            }

            let cursor = full_page.then(|| encode_cursor(last_sort_id));
            sink.respond(Response::Subscriptions {
                status: Status::Ok,
                cursor,
                subscriptions,
            })
        })
    })
}

/// Remove a subscription; 404 when no row matched.
pub fn delete_subscription(req: DeleteSubscriptionRequest, sink: ResponseSink) -> Coroutine {
    Coroutine::new("delete_subscription", move |_ctx| {
        let command = Command::DeleteSubscription {
            id: req.id.clone(),
            promise_id: req.promise_id.clone(),
        };

        Step::store(Transaction::one(command), move |_ctx, outcome| {
            let results = match outcome {
                Ok(results) => results,
                Err(err) => {
                    error!(id = %req.id, error = %err, "failed to delete subscription");
                    return sink.fail(err);
                }
            };

            let status = if results[0].rows_affected() == 1 {
                Status::Ok
            } else {
                Status::NotFound
            };
            sink.respond(Response::Deleted { status })
        })
    })
}
