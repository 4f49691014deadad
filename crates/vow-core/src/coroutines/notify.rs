// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification delivery.
//!
//! A heartbeat coroutine reads the due slice of the notifications table
//! and spawns one delivery coroutine per row. Each delivery re-reads the
//! promise, POSTs its snapshot to the subscription URL, and then either
//! deletes the row (delivered, or policy exhausted) or pushes its deadline
//! out by the retry backoff. Delivery is at-least-once; receivers
//! deduplicate.

use tracing::{debug, error, warn};

use crate::kernel::HttpPost;
use crate::kernel::scheduler::{Coroutine, Step};
use crate::store::{Command, Transaction};
use crate::types::Notification;

/// Read up to `batch` notifications and spawn a delivery for each one
/// whose deadline has arrived.
pub fn send_notifications(batch: i64) -> Coroutine {
    Coroutine::new("send_notifications", move |_ctx| {
        Step::store(
            Transaction::one(Command::ReadNotifications { n: batch }),
            move |ctx, outcome| {
                let mut results = match outcome {
                    Ok(results) => results,
                    Err(err) => {
                        error!(error = %err, "failed to read notifications");
                        return Step::Done;
                    }
                };

                let now = ctx.time();
                for record in results.remove(0).into_read_notifications() {
                    match record.into_notification() {
                        Ok(notification) if notification.time <= now => {
                            ctx.spawn(deliver(notification));
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "skipping corrupt notification"),
                    }
                }
                Step::Done
            },
        )
    })
}

fn deliver(notification: Notification) -> Coroutine {
    Coroutine::new("deliver_notification", move |_ctx| {
        Step::store(
            Transaction::one(Command::ReadPromise {
                id: notification.promise_id.clone(),
            }),
            move |_ctx, outcome| {
                let mut results = match outcome {
                    Ok(results) => results,
                    Err(err) => {
                        error!(promise_id = %notification.promise_id, error = %err, "failed to read promise for notification");
                        return Step::Done;
                    }
                };

                let Some(record) = results.remove(0).into_read_promise() else {
                    warn!(promise_id = %notification.promise_id, "notification references a missing promise, dropping");
                    return delete(notification);
                };

                let promise = match record.into_promise() {
                    Ok(promise) => promise,
                    Err(err) => {
                        error!(promise_id = %notification.promise_id, error = %err, "failed to decode promise record");
                        return Step::Done;
                    }
                };

                let body = match serde_json::to_value(&promise) {
                    Ok(body) => body,
                    Err(err) => {
                        error!(promise_id = %promise.id, error = %err, "failed to encode notification body");
                        return Step::Done;
                    }
                };

                let post = HttpPost {
                    url: notification.url.clone(),
                    body,
                };

                Step::network(post, move |ctx, outcome| {
                    let delivered = matches!(outcome, Ok(result) if result.success);
                    if delivered {
                        debug!(
                            id = %notification.id,
                            promise_id = %notification.promise_id,
                            "notification delivered"
                        );
                        return delete(notification);
                    }

                    let attempt = notification.attempt + 1;
                    if attempt < notification.retry_policy.attempts {
                        let time = ctx.time() + notification.retry_policy.backoff_ms(notification.attempt);
                        let reschedule = Command::UpdateNotification {
                            id: notification.id.clone(),
                            promise_id: notification.promise_id.clone(),
                            time,
                            attempt,
                        };
                        Step::store(Transaction::one(reschedule), |_ctx, outcome| {
                            if let Err(err) = outcome {
                                error!(error = %err, "failed to reschedule notification");
                            }
                            Step::Done
                        })
                    } else {
                        warn!(
                            id = %notification.id,
                            promise_id = %notification.promise_id,
                            attempts = notification.retry_policy.attempts,
                            "dropping notification, retry policy exhausted"
                        );
                        delete(notification)
                    }
                })
            },
        )
    })
}

fn delete(notification: Notification) -> Step {
    Step::store(
        Transaction::one(Command::DeleteNotification {
            id: notification.id,
            promise_id: notification.promise_id,
        }),
        |_ctx, outcome| {
            if let Err(err) = outcome {
                error!(error = %err, "failed to delete notification");
            }
            Step::Done
        },
    )
}
