// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the promise state machine.

mod common;

use common::*;
use vow_core::api::{Request, Response};
use vow_core::types::{State, Status, Value};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_create_then_read_pending() {
    let ctx = TestContext::new().await;

    let (status, promise) = promise_response(ctx.create("p1", 1000).await);
    assert_eq!(status, Status::Created);
    let promise = promise.unwrap();
    assert_eq!(promise.state, State::Pending);
    assert_eq!(promise.timeout, 1000);
    assert_eq!(promise.created_on, Some(0));
    assert_eq!(promise.completed_on, None);

    let (status, promise) = promise_response(ctx.read("p1").await);
    assert_eq!(status, Status::Ok);
    assert_eq!(promise.unwrap().state, State::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_missing_promise_is_not_found() {
    let ctx = TestContext::new().await;

    let (status, promise) = promise_response(ctx.read("nope").await);
    assert_eq!(status, Status::NotFound);
    assert!(promise.is_none());

    let (status, _) = promise_response(ctx.resolve("nope").await);
    assert_eq!(status, Status::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_times_out_expired_promise() {
    let ctx = TestContext::new().await;
    ctx.create("p1", 100).await;

    // Before the deadline the promise is pending.
    ctx.clock.set(50);
    let (status, promise) = promise_response(ctx.read("p1").await);
    assert_eq!(status, Status::Ok);
    assert_eq!(promise.unwrap().state, State::Pending);

    // Past the deadline the read itself transitions the promise; the
    // caller sees the timed-out snapshot with completed_on = timeout.
    ctx.clock.set(150);
    let (status, promise) = promise_response(ctx.read("p1").await);
    assert_eq!(status, Status::Ok);
    let promise = promise.unwrap();
    assert_eq!(promise.state, State::Timedout);
    assert_eq!(promise.completed_on, Some(100));

    // No further pending observation is possible.
    let (status, promise) = promise_response(ctx.read("p1").await);
    assert_eq!(status, Status::Ok);
    assert_eq!(promise.unwrap().state, State::Timedout);

    // Completing a timed-out promise is forbidden.
    let (status, promise) = promise_response(ctx.resolve("p1").await);
    assert_eq!(status, Status::Forbidden);
    assert_eq!(promise.unwrap().state, State::Timedout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completion_verbs_reach_their_states() {
    let ctx = TestContext::new().await;

    for (id, verb, state) in [
        ("p1", "resolve", State::Resolved),
        ("p2", "reject", State::Rejected),
        ("p3", "cancel", State::Canceled),
    ] {
        ctx.create(id, 100_000).await;
        let response = match verb {
            "resolve" => ctx.resolve(id).await,
            "reject" => ctx.reject(id).await,
            _ => ctx.cancel(id).await,
        };
        let (status, promise) = promise_response(response);
        assert_eq!(status, Status::Created);
        let promise = promise.unwrap();
        assert_eq!(promise.state, state);
        assert!(promise.completed_on.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_carries_the_value() {
    let ctx = TestContext::new().await;
    ctx.create("p1", 100_000).await;

    let mut request = complete_request("p1");
    request.value = Value {
        headers: [("content-type".to_string(), "text/plain".to_string())].into(),
        data: b"forty-two".to_vec(),
    };
    let response = ctx
        .api
        .call(Request::ResolvePromise(request.clone()))
        .await
        .unwrap();
    let (status, promise) = promise_response(response);
    assert_eq!(status, Status::Created);
    assert_eq!(promise.unwrap().value, request.value);

    // The stored value round-trips through a read.
    let (_, promise) = promise_response(ctx.read("p1").await);
    assert_eq!(promise.unwrap().value, request.value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_twice_with_idempotency_key() {
    let ctx = TestContext::new().await;
    ctx.create("p3", 100_000).await;

    let mut request = complete_request("p3");
    request.idempotency_key = Some("k".to_string());
    request.value = Value {
        headers: Default::default(),
        data: b"v".to_vec(),
    };

    let (status, first) = promise_response(
        ctx.api
            .call(Request::ResolvePromise(request.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Created);
    let first = first.unwrap();

    let (status, second) = promise_response(
        ctx.api
            .call(Request::ResolvePromise(request))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Ok);
    let second = second.unwrap();
    assert_eq!(second.state, State::Resolved);
    assert_eq!(second.value, first.value);
    assert_eq!(second.id, first.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_strict_resolve_of_rejected_promise_is_forbidden() {
    let ctx = TestContext::new().await;
    ctx.create("p4", 100_000).await;

    let mut reject = complete_request("p4");
    reject.idempotency_key = Some("k".to_string());
    ctx.api.call(Request::RejectPromise(reject)).await.unwrap();

    let mut resolve = complete_request("p4");
    resolve.idempotency_key = Some("k".to_string());
    resolve.strict = true;
    let (status, promise) = promise_response(
        ctx.api
            .call(Request::ResolvePromise(resolve))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Forbidden);
    assert_eq!(promise.unwrap().state, State::Rejected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_strict_create_replay() {
    let ctx = TestContext::new().await;

    let mut request = create_request("p5", 1000);
    request.idempotency_key = Some("k1".to_string());
    request.strict = true;

    let (status, _) = promise_response(
        ctx.api
            .call(Request::CreatePromise(request.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Created);

    // Identical replay is an idempotent success.
    let (status, _) = promise_response(
        ctx.api
            .call(Request::CreatePromise(request.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Created);

    // A conflicting body under strict is a collision.
    let mut conflicting = request;
    conflicting.timeout = 9999;
    let (status, _) = promise_response(
        ctx.api
            .call(Request::CreatePromise(conflicting))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Conflict);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_create_replay_without_strict() {
    let ctx = TestContext::new().await;

    let mut request = create_request("p6", 1000);
    request.idempotency_key = Some("k".to_string());

    let (status, _) = promise_response(
        ctx.api
            .call(Request::CreatePromise(request.clone()))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Created);

    let (status, promise) = promise_response(
        ctx.api
            .call(Request::CreatePromise(request))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(promise.unwrap().state, State::Pending);

    // A create with a different key neither replays nor overwrites.
    let (status, _) = promise_response(ctx.create("p6", 1000).await);
    assert_eq!(status, Status::Forbidden);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_creates_produce_one_winner() {
    let ctx = TestContext::new().await;

    let (a, b) = tokio::join!(
        ctx.api.call(Request::CreatePromise(create_request("p7", 1000))),
        ctx.api.call(Request::CreatePromise(create_request("p7", 1000))),
    );
    let (status_a, _) = promise_response(a.unwrap());
    let (status_b, _) = promise_response(b.unwrap());

    let created = [status_a, status_b]
        .iter()
        .filter(|s| **s == Status::Created)
        .count();
    assert_eq!(created, 1, "exactly one create must win: {:?}/{:?}", status_a, status_b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_resolves_same_key_one_winner_one_replay() {
    // Two retries of the same logical resolve race: one transition (201),
    // one idempotent observation of the winner's value (200).
    let ctx = TestContext::new().await;
    ctx.create("p8", 100_000).await;

    let mut request = complete_request("p8");
    request.idempotency_key = Some("k".to_string());
    request.value = Value {
        headers: Default::default(),
        data: b"winner".to_vec(),
    };

    let (a, b) = tokio::join!(
        ctx.api.call(Request::ResolvePromise(request.clone())),
        ctx.api.call(Request::ResolvePromise(request)),
    );
    let (status_a, promise_a) = promise_response(a.unwrap());
    let (status_b, promise_b) = promise_response(b.unwrap());

    let mut outcomes = [(status_a, promise_a), (status_b, promise_b)];
    outcomes.sort_by_key(|(status, _)| *status != Status::Created);

    assert_eq!(outcomes[0].0, Status::Created);
    assert_eq!(outcomes[1].0, Status::Ok);
    assert_eq!(
        outcomes[1].1.as_ref().unwrap().value.data,
        b"winner".to_vec()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_resolves_different_keys() {
    let ctx = TestContext::new().await;
    ctx.create("p8b", 100_000).await;

    let mut first = complete_request("p8b");
    first.idempotency_key = Some("k1".to_string());
    first.value = Value {
        headers: Default::default(),
        data: b"first".to_vec(),
    };
    let mut second = first.clone();
    second.idempotency_key = Some("k2".to_string());
    second.value.data = b"second".to_vec();

    let (a, b) = tokio::join!(
        ctx.api.call(Request::ResolvePromise(first)),
        ctx.api.call(Request::ResolvePromise(second)),
    );
    let (status_a, promise_a) = promise_response(a.unwrap());
    let (status_b, promise_b) = promise_response(b.unwrap());

    let mut outcomes = [(status_a, promise_a), (status_b, promise_b)];
    outcomes.sort_by_key(|(status, _)| *status != Status::Created);
    let (winner_status, winner) = &outcomes[0];
    let (loser_status, loser) = &outcomes[1];

    assert_eq!(*winner_status, Status::Created);
    // The loser re-read and observed the winner's value; with a different
    // idempotency key its status is Forbidden.
    assert_eq!(*loser_status, Status::Forbidden);
    assert_eq!(
        loser.as_ref().unwrap().value,
        winner.as_ref().unwrap().value
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_states_never_change() {
    let ctx = TestContext::new().await;
    ctx.create("p9", 100_000).await;
    ctx.resolve("p9").await;

    let (status, _) = promise_response(ctx.cancel("p9").await);
    assert_eq!(status, Status::Forbidden);
    let (status, _) = promise_response(ctx.reject("p9").await);
    assert_eq!(status, Status::Forbidden);

    let (_, promise) = promise_response(ctx.read("p9").await);
    assert_eq!(promise.unwrap().state, State::Resolved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown_drains_in_flight_requests() {
    let ctx = TestContext::new().await;

    let (status, _) = promise_response(ctx.create("p10", 1000).await);
    assert_eq!(status, Status::Created);

    let TestContext { runtime, api, .. } = ctx;
    runtime.shutdown();

    // After shutdown the ingress is closed.
    let result = api.call(Request::ReadPromise(
        vow_core::api::ReadPromiseRequest {
            id: "p10".to_string(),
        },
    ))
    .await;
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_validation_errors_never_reach_the_kernel() {
    let ctx = TestContext::new().await;

    let result = ctx
        .api
        .call(Request::CreatePromise(create_request("", 1000)))
        .await;
    assert!(matches!(
        result,
        Err(vow_core::error::Error::Validation { field: "id", .. })
    ));

    let mut negative = create_request("p11", 0);
    negative.timeout = -5;
    let result = ctx.api.call(Request::CreatePromise(negative)).await;
    assert!(matches!(
        result,
        Err(vow_core::error::Error::Validation { field: "timeout", .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_promise_survives_reconnect() {
    // Promises persist in the store: a second kernel over the same pool
    // observes the first kernel's writes.
    use std::sync::Arc;
    use vow_core::runtime::Runtime;
    use vow_core::store::SqliteStore;

    let backend = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
    let clock = vow_core::kernel::scheduler::ManualClock::starting_at(0);

    let first = Runtime::builder()
        .backend(backend.clone())
        .clock(Box::new(clock.clone()))
        .tick_interval(std::time::Duration::from_millis(1))
        .start(tokio::runtime::Handle::current())
        .unwrap();
    let (status, _) = promise_response(
        first
            .api()
            .call(Request::CreatePromise(create_request("durable", 100_000)))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Created);
    first.shutdown();

    let second = Runtime::builder()
        .backend(backend)
        .clock(Box::new(clock))
        .tick_interval(std::time::Duration::from_millis(1))
        .start(tokio::runtime::Handle::current())
        .unwrap();
    let (status, promise) = promise_response(
        second
            .api()
            .call(Request::ReadPromise(vow_core::api::ReadPromiseRequest {
                id: "durable".to_string(),
            }))
            .await
            .unwrap(),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(promise.unwrap().state, State::Pending);
    second.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_response_shape_for_search() {
    let ctx = TestContext::new().await;
    ctx.create("q1", 1000).await;

    match ctx.search("q*", vow_core::api::SearchState::All, 10).await {
        Response::Search { status, promises, cursor } => {
            assert_eq!(status, Status::Ok);
            assert_eq!(promises.len(), 1);
            assert!(cursor.is_none());
        }
        other => panic!("expected search response, got {:?}", other),
    }
}
