// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API ingress: typed requests enter the kernel through a bounded channel
//! and complete through a callback invoked exactly once.
//!
//! Transports (HTTP, gRPC, embedding applications) sit outside this crate.
//! They validate nothing themselves: [`Api::submit`] rejects malformed
//! requests before they reach the kernel, and the transport maps the
//! callback result to its wire encoding.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kernel::scheduler::{Coroutine, Step};
use crate::types::{Promise, RetryPolicy, State, Status, Subscription, Value};

/// Read one promise.
#[derive(Debug, Clone)]
pub struct ReadPromiseRequest {
    /// Promise id.
    pub id: String,
}

/// Which states a search matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    /// Every state.
    All,
    /// Pending only.
    Pending,
    /// Resolved only.
    Resolved,
    /// Rejected, canceled, or timed out.
    Rejected,
}

impl SearchState {
    /// The concrete states this selector matches.
    pub fn states(&self) -> Vec<State> {
        match self {
            SearchState::All => vec![
                State::Pending,
                State::Resolved,
                State::Rejected,
                State::Timedout,
                State::Canceled,
            ],
            SearchState::Pending => vec![State::Pending],
            SearchState::Resolved => vec![State::Resolved],
            SearchState::Rejected => vec![State::Rejected, State::Canceled, State::Timedout],
        }
    }
}

/// Search promises by id glob.
#[derive(Debug, Clone)]
pub struct SearchPromisesRequest {
    /// Id pattern; `*` is the wildcard.
    pub q: String,
    /// State selector.
    pub state: SearchState,
    /// Page size, 1..=100.
    pub limit: i64,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

/// Create a promise.
#[derive(Debug, Clone)]
pub struct CreatePromiseRequest {
    /// Client-chosen unique id.
    pub id: String,
    /// Idempotency key for create.
    pub idempotency_key: Option<String>,
    /// Strict mode: a replay must match the stored record exactly.
    pub strict: bool,
    /// Creation payload.
    pub param: Value,
    /// Absolute deadline, ms since epoch.
    pub timeout: i64,
    /// Tag metadata.
    pub tags: HashMap<String, String>,
}

/// Complete a promise (resolve, reject, or cancel).
#[derive(Debug, Clone)]
pub struct CompletePromiseRequest {
    /// Promise id.
    pub id: String,
    /// Idempotency key for complete.
    pub idempotency_key: Option<String>,
    /// Strict mode: the stored state must match the verb's target.
    pub strict: bool,
    /// Completion payload.
    pub value: Value,
}

/// Register a completion callback URL.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    /// Subscription id, unique per promise.
    pub id: String,
    /// The promise to watch.
    pub promise_id: String,
    /// Delivery target.
    pub url: String,
    /// Delivery retry schedule; defaults when absent.
    pub retry_policy: Option<RetryPolicy>,
}

/// List a promise's subscriptions.
#[derive(Debug, Clone)]
pub struct ReadSubscriptionsRequest {
    /// The promise.
    pub promise_id: String,
    /// Page size, 1..=100.
    pub limit: i64,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
}

/// Remove a subscription.
#[derive(Debug, Clone)]
pub struct DeleteSubscriptionRequest {
    /// Subscription id.
    pub id: String,
    /// Promise id.
    pub promise_id: String,
}

/// A typed API request.
#[derive(Debug, Clone)]
pub enum Request {
    /// Read one promise.
    ReadPromise(ReadPromiseRequest),
    /// Search promises.
    SearchPromises(SearchPromisesRequest),
    /// Create a promise.
    CreatePromise(CreatePromiseRequest),
    /// Resolve a pending promise.
    ResolvePromise(CompletePromiseRequest),
    /// Reject a pending promise.
    RejectPromise(CompletePromiseRequest),
    /// Cancel a pending promise.
    CancelPromise(CompletePromiseRequest),
    /// Register a subscription.
    CreateSubscription(CreateSubscriptionRequest),
    /// List subscriptions.
    ReadSubscriptions(ReadSubscriptionsRequest),
    /// Remove a subscription.
    DeleteSubscription(DeleteSubscriptionRequest),
}

/// A typed API response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Promise verbs: read, create, resolve, reject, cancel.
    Promise {
        /// Response status.
        status: Status,
        /// The promise, when one exists.
        promise: Option<Promise>,
    },
    /// Promise search results.
    Search {
        /// Response status.
        status: Status,
        /// Cursor for the next page, when the page was full.
        cursor: Option<String>,
        /// Matching promises, newest first.
        promises: Vec<Promise>,
    },
    /// Subscription create.
    Subscription {
        /// Response status.
        status: Status,
        /// The subscription, when one exists.
        subscription: Option<Subscription>,
    },
    /// Subscription list results.
    Subscriptions {
        /// Response status.
        status: Status,
        /// Cursor for the next page, when the page was full.
        cursor: Option<String>,
        /// Matching subscriptions, newest first.
        subscriptions: Vec<Subscription>,
    },
    /// Subscription delete.
    Deleted {
        /// Response status.
        status: Status,
    },
}

impl Response {
    /// The response status.
    pub fn status(&self) -> Status {
        match self {
            Response::Promise { status, .. }
            | Response::Search { status, .. }
            | Response::Subscription { status, .. }
            | Response::Subscriptions { status, .. }
            | Response::Deleted { status } => *status,
        }
    }
}

/// The exactly-once completion callback handed to a coroutine.
pub struct ResponseSink {
    callback: Box<dyn FnOnce(Result<Response>) + Send>,
}

impl ResponseSink {
    /// Wrap a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        ResponseSink {
            callback: Box::new(callback),
        }
    }

    /// Deliver the result.
    pub fn send(self, result: Result<Response>) {
        (self.callback)(result);
    }

    /// Deliver a response and terminate the coroutine.
    pub fn respond(self, response: Response) -> Step {
        self.send(Ok(response));
        Step::Done
    }

    /// Deliver an error and terminate the coroutine.
    pub fn fail(self, err: Error) -> Step {
        self.send(Err(err));
        Step::Done
    }
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseSink")
    }
}

#[derive(Serialize, Deserialize)]
struct Cursor {
    sort_id: i64,
}

/// Encode a keyset position as an opaque cursor.
pub fn encode_cursor(sort_id: i64) -> String {
    BASE64.encode(serde_json::to_vec(&Cursor { sort_id }).expect("cursor serializes"))
}

/// Decode an opaque cursor back to its keyset position.
pub fn decode_cursor(cursor: &str) -> Result<i64> {
    let bytes = BASE64.decode(cursor).map_err(|err| Error::Validation {
        field: "cursor",
        message: err.to_string(),
    })?;
    let cursor: Cursor = serde_json::from_slice(&bytes).map_err(|err| Error::Validation {
        field: "cursor",
        message: err.to_string(),
    })?;
    Ok(cursor.sort_id)
}

fn require(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation {
            field,
            message: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn check_page(limit: i64, cursor: Option<&str>) -> Result<()> {
    if !(1..=100).contains(&limit) {
        return Err(Error::Validation {
            field: "limit",
            message: format!("must be between 1 and 100, got {}", limit),
        });
    }
    if let Some(cursor) = cursor {
        decode_cursor(cursor)?;
    }
    Ok(())
}

/// Validate a request before it enters the kernel. Coroutines assume these
/// preconditions hold.
pub fn validate(request: &Request) -> Result<()> {
    match request {
        Request::ReadPromise(req) => require("id", &req.id),
        Request::SearchPromises(req) => {
            require("q", &req.q)?;
            check_page(req.limit, req.cursor.as_deref())
        }
        Request::CreatePromise(req) => {
            require("id", &req.id)?;
            if req.timeout < 0 {
                return Err(Error::Validation {
                    field: "timeout",
                    message: format!("must be non-negative, got {}", req.timeout),
                });
            }
            Ok(())
        }
        Request::ResolvePromise(req)
        | Request::RejectPromise(req)
        | Request::CancelPromise(req) => require("id", &req.id),
        Request::CreateSubscription(req) => {
            require("id", &req.id)?;
            require("promiseId", &req.promise_id)?;
            require("url", &req.url)
        }
        Request::ReadSubscriptions(req) => {
            require("promiseId", &req.promise_id)?;
            check_page(req.limit, req.cursor.as_deref())
        }
        Request::DeleteSubscription(req) => {
            require("id", &req.id)?;
            require("promiseId", &req.promise_id)
        }
    }
}

/// Handle for enqueuing requests onto the kernel.
#[derive(Clone)]
pub struct Api {
    ingress: Sender<Coroutine>,
}

impl Api {
    /// Create an API handle over the kernel's ingress channel.
    pub fn new(ingress: Sender<Coroutine>) -> Self {
        Api { ingress }
    }

    /// Validate and enqueue a request. The callback is invoked exactly once
    /// from the kernel thread, on a later tick.
    ///
    /// Fails fast with [`Error::Validation`] on a malformed request,
    /// [`Error::Busy`] when the ingress queue is full, and
    /// [`Error::Closed`] after shutdown; in those cases the callback is
    /// never invoked.
    pub fn submit<F>(&self, request: Request, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        validate(&request)?;
        let coroutine = crate::coroutines::coroutine_for(request, ResponseSink::new(callback));
        self.ingress.try_send(coroutine).map_err(|err| match err {
            TrySendError::Full(_) => Error::Busy,
            TrySendError::Disconnected(_) => Error::Closed,
        })
    }

    /// Submit a request and await its response.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(request, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_roundtrip() {
        let cursor = encode_cursor(42);
        assert_eq!(decode_cursor(&cursor).unwrap(), 42);
    }

    #[test]
    fn test_cursor_rejects_garbage() {
        assert!(matches!(
            decode_cursor("not base64!"),
            Err(Error::Validation { field: "cursor", .. })
        ));
        let b64 = BASE64.encode(b"not json");
        assert!(matches!(
            decode_cursor(&b64),
            Err(Error::Validation { field: "cursor", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_search_query() {
        let request = Request::SearchPromises(SearchPromisesRequest {
            q: String::new(),
            state: SearchState::All,
            limit: 10,
            cursor: None,
        });
        assert!(matches!(
            validate(&request),
            Err(Error::Validation { field: "q", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_negative_timeout() {
        let request = Request::CreatePromise(CreatePromiseRequest {
            id: "p1".to_string(),
            idempotency_key: None,
            strict: false,
            param: Value::default(),
            timeout: -1,
            tags: HashMap::new(),
        });
        assert!(matches!(
            validate(&request),
            Err(Error::Validation { field: "timeout", .. })
        ));
    }

    #[test]
    fn test_validate_bounds_limit() {
        for limit in [0, 101] {
            let request = Request::SearchPromises(SearchPromisesRequest {
                q: "*".to_string(),
                state: SearchState::All,
                limit,
                cursor: None,
            });
            assert!(matches!(
                validate(&request),
                Err(Error::Validation { field: "limit", .. })
            ));
        }
    }

    #[test]
    fn test_search_state_selectors() {
        assert_eq!(State::mask(&SearchState::All.states()), 31);
        assert_eq!(State::mask(&SearchState::Pending.states()), 1);
        assert_eq!(State::mask(&SearchState::Resolved.states()), 2);
        // Rejected groups every failure outcome.
        assert_eq!(State::mask(&SearchState::Rejected.states()), 4 | 8 | 16);
    }
}
