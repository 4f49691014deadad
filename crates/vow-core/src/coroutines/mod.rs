// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-verb kernel coroutines.
//!
//! Each API verb runs as one coroutine following the same shape: read,
//! decide, write transactionally, respond. Writes that race (a promise
//! completed between the read and the guarded update) re-spawn the verb
//! from its read step; a promise found past its deadline spawns the
//! timeout transition first and continues once it commits.

mod complete_promise;
mod create_promise;
mod notify;
mod read_promise;
mod search_promises;
mod subscriptions;
mod timeout;

pub use self::complete_promise::complete_promise;
pub use self::create_promise::create_promise;
pub use self::notify::send_notifications;
pub use self::read_promise::read_promise;
pub use self::search_promises::search_promises;
pub use self::subscriptions::{create_subscription, delete_subscription, read_subscriptions};
pub use self::timeout::{TimeoutOutcome, sweep_timeouts, timeout_promise};

use crate::api::{Request, ResponseSink};
use crate::kernel::scheduler::Coroutine;
use crate::types::State;

/// Build the coroutine serving a validated request.
pub fn coroutine_for(request: Request, sink: ResponseSink) -> Coroutine {
    match request {
        Request::ReadPromise(req) => read_promise(req, sink),
        Request::SearchPromises(req) => search_promises(req, sink),
        Request::CreatePromise(req) => create_promise(req, sink),
        Request::ResolvePromise(req) => complete_promise(State::Resolved, req, sink),
        Request::RejectPromise(req) => complete_promise(State::Rejected, req, sink),
        Request::CancelPromise(req) => complete_promise(State::Canceled, req, sink),
        Request::CreateSubscription(req) => create_subscription(req, sink),
        Request::ReadSubscriptions(req) => read_subscriptions(req, sink),
        Request::DeleteSubscription(req) => delete_subscription(req, sink),
    }
}
