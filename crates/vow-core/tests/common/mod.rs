// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test harness: an in-memory kernel with an injectable clock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vow_core::api::{
    Api, CompletePromiseRequest, CreatePromiseRequest, CreateSubscriptionRequest,
    DeleteSubscriptionRequest, ReadPromiseRequest, ReadSubscriptionsRequest, Request, Response,
    SearchPromisesRequest, SearchState,
};
use vow_core::kernel::scheduler::ManualClock;
use vow_core::runtime::Runtime;
use vow_core::store::SqliteStore;
use vow_core::types::{Promise, RetryPolicy, Status, Value};

/// A running kernel over an in-memory store, with the clock held by the
/// test.
pub struct TestContext {
    pub runtime: Runtime,
    pub api: Api,
    pub clock: ManualClock,
}

impl TestContext {
    pub async fn new() -> TestContext {
        let backend = Arc::new(
            SqliteStore::connect(":memory:")
                .await
                .expect("failed to open in-memory store"),
        );
        let clock = ManualClock::starting_at(0);
        let runtime = Runtime::builder()
            .backend(backend)
            .clock(Box::new(clock.clone()))
            .tick_interval(Duration::from_millis(1))
            .heartbeat_intervals(20, 20)
            .start(tokio::runtime::Handle::current())
            .expect("failed to start runtime");
        let api = runtime.api();

        TestContext {
            runtime,
            api,
            clock,
        }
    }

    pub async fn create(&self, id: &str, timeout: i64) -> Response {
        self.api
            .call(Request::CreatePromise(create_request(id, timeout)))
            .await
            .expect("create failed")
    }

    pub async fn read(&self, id: &str) -> Response {
        self.api
            .call(Request::ReadPromise(ReadPromiseRequest { id: id.to_string() }))
            .await
            .expect("read failed")
    }

    pub async fn resolve(&self, id: &str) -> Response {
        self.api
            .call(Request::ResolvePromise(complete_request(id)))
            .await
            .expect("resolve failed")
    }

    pub async fn reject(&self, id: &str) -> Response {
        self.api
            .call(Request::RejectPromise(complete_request(id)))
            .await
            .expect("reject failed")
    }

    pub async fn cancel(&self, id: &str) -> Response {
        self.api
            .call(Request::CancelPromise(complete_request(id)))
            .await
            .expect("cancel failed")
    }

    pub async fn subscribe(&self, id: &str, promise_id: &str, url: &str) -> Response {
        self.subscribe_with_policy(id, promise_id, url, None).await
    }

    pub async fn subscribe_with_policy(
        &self,
        id: &str,
        promise_id: &str,
        url: &str,
        retry_policy: Option<RetryPolicy>,
    ) -> Response {
        self.api
            .call(Request::CreateSubscription(CreateSubscriptionRequest {
                id: id.to_string(),
                promise_id: promise_id.to_string(),
                url: url.to_string(),
                retry_policy,
            }))
            .await
            .expect("subscribe failed")
    }

    pub async fn subscriptions(&self, promise_id: &str) -> Response {
        self.api
            .call(Request::ReadSubscriptions(ReadSubscriptionsRequest {
                promise_id: promise_id.to_string(),
                limit: 100,
                cursor: None,
            }))
            .await
            .expect("read subscriptions failed")
    }

    pub async fn unsubscribe(&self, id: &str, promise_id: &str) -> Response {
        self.api
            .call(Request::DeleteSubscription(DeleteSubscriptionRequest {
                id: id.to_string(),
                promise_id: promise_id.to_string(),
            }))
            .await
            .expect("delete subscription failed")
    }

    pub async fn search(&self, q: &str, state: SearchState, limit: i64) -> Response {
        self.search_page(q, state, limit, None).await
    }

    pub async fn search_page(
        &self,
        q: &str,
        state: SearchState,
        limit: i64,
        cursor: Option<String>,
    ) -> Response {
        self.api
            .call(Request::SearchPromises(SearchPromisesRequest {
                q: q.to_string(),
                state,
                limit,
                cursor,
            }))
            .await
            .expect("search failed")
    }
}

pub fn create_request(id: &str, timeout: i64) -> CreatePromiseRequest {
    CreatePromiseRequest {
        id: id.to_string(),
        idempotency_key: None,
        strict: false,
        param: Value::default(),
        timeout,
        tags: HashMap::new(),
    }
}

pub fn complete_request(id: &str) -> CompletePromiseRequest {
    CompletePromiseRequest {
        id: id.to_string(),
        idempotency_key: None,
        strict: false,
        value: Value::default(),
    }
}

/// Unwrap a promise-shaped response.
pub fn promise_response(response: Response) -> (Status, Option<Promise>) {
    match response {
        Response::Promise { status, promise } => (status, promise),
        other => panic!("expected promise response, got {:?}", other),
    }
}

/// Poll until `check` passes or the deadline elapses.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
