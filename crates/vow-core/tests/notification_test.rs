// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notification delivery against a mock HTTP receiver.

mod common;

use common::*;
use vow_core::types::RetryPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn received(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_delivers_notification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let ctx = TestContext::new().await;
    ctx.create("p2", 100_000).await;
    ctx.subscribe("s1", "p2", &format!("{}/cb", server.uri()))
        .await;
    ctx.resolve("p2").await;

    wait_until("notification delivery", || async {
        received(&server).await >= 1
    })
    .await;

    // The POST body is the completed promise snapshot.
    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["id"], "p2");
    assert_eq!(body["state"], "RESOLVED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_delivery_is_retried() {
    let server = MockServer::start().await;
    // First attempt fails, the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let ctx = TestContext::new().await;
    ctx.create("p1", 100_000).await;
    ctx.subscribe_with_policy(
        "s1",
        "p1",
        &format!("{}/cb", server.uri()),
        Some(RetryPolicy {
            delay_ms: 10,
            attempts: 3,
        }),
    )
    .await;
    ctx.resolve("p1").await;

    wait_until("first delivery attempt", || async {
        received(&server).await >= 1
    })
    .await;

    // The retry is rescheduled at now + backoff on the logical clock;
    // advance it so the next sender heartbeat finds the row due.
    ctx.clock.advance(100_000);

    wait_until("retried delivery", || async {
        received(&server).await >= 2
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_promise_notifies_subscribers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let ctx = TestContext::new().await;
    ctx.create("p1", 100).await;
    ctx.subscribe("s1", "p1", &format!("{}/cb", server.uri()))
        .await;

    // Let the sweeper find the expired promise.
    ctx.clock.set(500);

    wait_until("timeout notification", || async {
        received(&server).await >= 1
    })
    .await;

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["id"], "p1");
    assert_eq!(body["state"], "TIMEDOUT");
    assert_eq!(body["completed_on"], 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_policy_drops_the_notification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ctx = TestContext::new().await;
    ctx.create("p1", 100_000).await;
    ctx.subscribe_with_policy(
        "s1",
        "p1",
        &format!("{}/cb", server.uri()),
        Some(RetryPolicy {
            delay_ms: 10,
            attempts: 2,
        }),
    )
    .await;
    ctx.resolve("p1").await;

    wait_until("first attempt", || async { received(&server).await >= 1 }).await;
    ctx.clock.advance(100_000);
    wait_until("second attempt", || async { received(&server).await >= 2 }).await;

    // The policy allowed two attempts; the row is dropped, so the count
    // stops growing no matter how far time advances.
    ctx.clock.advance(1_000_000);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let settled = received(&server).await;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(received(&server).await, settled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delivery_failures_never_surface_to_clients() {
    // A subscription pointing nowhere must not affect the resolve itself.
    let ctx = TestContext::new().await;
    ctx.create("p1", 100_000).await;
    ctx.subscribe_with_policy(
        "s1",
        "p1",
        "http://127.0.0.1:1/unreachable",
        Some(RetryPolicy {
            delay_ms: 10,
            attempts: 1,
        }),
    )
    .await;

    let (status, _) = promise_response(ctx.resolve("p1").await);
    assert_eq!(status, vow_core::types::Status::Created);
}
