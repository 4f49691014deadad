// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic simulation tests: the kernel is driven tick by tick on an
//! injected clock, with the network subsystem replaced by a recorder, and
//! the full trajectory asserted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vow_core::api::{Api, ReadPromiseRequest, Request, Response};
use vow_core::error::Result;
use vow_core::kernel::aio::{Aio, Subsystem};
use vow_core::kernel::scheduler::{ManualClock, Scheduler};
use vow_core::kernel::{Completion, Cqe, HttpResult, Kind, Sqe, Submission};
use vow_core::coroutines::{send_notifications, sweep_timeouts};
use vow_core::store::{SqliteStore, StoreSubsystem};
use vow_core::types::{State, Status};

mod common;
use common::{create_request, promise_response};

/// A network subsystem that records every POST and reports success.
struct RecordingNetwork {
    posts: Arc<Mutex<Vec<String>>>,
}

impl Subsystem for RecordingNetwork {
    fn kind(&self) -> Kind {
        Kind::Network
    }

    fn workers(&self) -> usize {
        1
    }

    fn process(&self, batch: Vec<Sqe>) -> Vec<Cqe> {
        batch
            .into_iter()
            .map(|sqe| match sqe.submission {
                Submission::Network(post) => {
                    self.posts.lock().unwrap().push(post.url);
                    Cqe {
                        token: sqe.token,
                        completion: Ok(Completion::Network(HttpResult {
                            success: true,
                            status: Some(200),
                        })),
                    }
                }
                other => panic!("unexpected {:?} submission", other.kind()),
            })
            .collect()
    }
}

struct Sim {
    scheduler: Scheduler,
    api: Api,
    clock: ManualClock,
    posts: Arc<Mutex<Vec<String>>>,
}

impl Sim {
    async fn new() -> Sim {
        let backend = Arc::new(SqliteStore::connect(":memory:").await.unwrap());
        let posts = Arc::new(Mutex::new(Vec::new()));

        let mut aio = Aio::new();
        aio.register(Arc::new(StoreSubsystem::new(
            backend,
            tokio::runtime::Handle::current(),
            1,
            Duration::from_secs(5),
        )));
        aio.register(Arc::new(RecordingNetwork {
            posts: posts.clone(),
        }));

        let (tx, rx) = crossbeam_channel::bounded(16);
        let clock = ManualClock::starting_at(0);
        let scheduler = Scheduler::new(Box::new(clock.clone()), rx, 16, aio);

        Sim {
            scheduler,
            api: Api::new(tx),
            clock,
            posts,
        }
    }

    /// Tick until `done` holds. Subsystem workers run on real threads, so
    /// the wait is bounded rather than exact; the *logical* trajectory
    /// stays deterministic.
    fn tick_until(&mut self, what: &str, done: impl Fn() -> bool) {
        for _ in 0..2000 {
            self.scheduler.tick();
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {}", what);
    }

    fn call(&mut self, request: Request) -> Result<Response> {
        let slot: Arc<Mutex<Option<Result<Response>>>> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        self.api
            .submit(request, move |result| {
                *out.lock().unwrap() = Some(result);
            })
            .expect("submit failed");
        self.tick_until("response", || slot.lock().unwrap().is_some());
        let result = slot.lock().unwrap().take();
        result.unwrap()
    }

    fn read(&mut self, id: &str) -> (Status, Option<vow_core::types::Promise>) {
        let response = self
            .call(Request::ReadPromise(ReadPromiseRequest { id: id.to_string() }))
            .unwrap();
        promise_response(response)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trajectory_create_read_timeout() {
    let mut sim = Sim::new().await;

    // t=0: create with deadline 100.
    let (status, promise) = promise_response(
        sim.call(Request::CreatePromise(create_request("p1", 100)))
            .unwrap(),
    );
    assert_eq!(status, Status::Created);
    assert_eq!(promise.unwrap().created_on, Some(0));

    // t=50: still pending.
    sim.clock.set(50);
    let (status, promise) = sim.read("p1");
    assert_eq!(status, Status::Ok);
    assert_eq!(promise.unwrap().state, State::Pending);
    assert_eq!(sim.scheduler.time(), 50);

    // t=150: the read observes the deadline and transitions the promise.
    sim.clock.set(150);
    let (status, promise) = sim.read("p1");
    assert_eq!(status, Status::Ok);
    let promise = promise.unwrap();
    assert_eq!(promise.state, State::Timedout);
    assert_eq!(promise.completed_on, Some(100));

    // The transition is durable: every later read agrees.
    let (_, promise) = sim.read("p1");
    assert_eq!(promise.unwrap().state, State::Timedout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trajectory_sweeper_and_sender() {
    let mut sim = Sim::new().await;

    sim.call(Request::CreatePromise(create_request("p1", 100)))
        .unwrap();
    sim.call(Request::CreateSubscription(
        vow_core::api::CreateSubscriptionRequest {
            id: "s1".to_string(),
            promise_id: "p1".to_string(),
            url: "http://receiver/cb".to_string(),
            retry_policy: None,
        },
    ))
    .unwrap();

    // t=200: the promise's deadline has passed. Drive the sweeper and
    // sender heartbeats (no reads, so the lazy path cannot fire) until
    // the notification reaches the recorder.
    sim.clock.set(200);
    let posts = sim.posts.clone();
    for round in 0.. {
        assert!(round < 500, "sweeper/sender never delivered");
        sim.scheduler.add(sweep_timeouts(10));
        sim.scheduler.add(send_notifications(10));
        sim.scheduler.tick();
        if !posts.lock().unwrap().is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(posts.lock().unwrap()[0], "http://receiver/cb");

    // The sweeper committed the transition with completed_on equal to the
    // promise's own deadline.
    let (status, promise) = sim.read("p1");
    assert_eq!(status, Status::Ok);
    let promise = promise.unwrap();
    assert_eq!(promise.state, State::Timedout);
    assert_eq!(promise.completed_on, Some(100));

    // The subscription is gone with the same transaction.
    let response = sim
        .call(Request::ReadSubscriptions(
            vow_core::api::ReadSubscriptionsRequest {
                promise_id: "p1".to_string(),
                limit: 10,
                cursor: None,
            },
        ))
        .unwrap();
    match response {
        Response::Subscriptions { subscriptions, .. } => assert!(subscriptions.is_empty()),
        other => panic!("expected subscriptions response, got {:?}", other),
    }

    // Once the delivered notification row is deleted, further sender
    // heartbeats find nothing: the post count settles.
    for _ in 0..30 {
        sim.scheduler.add(send_notifications(10));
        sim.scheduler.tick();
        std::thread::sleep(Duration::from_millis(1));
    }
    let settled = posts.lock().unwrap().len();
    for _ in 0..30 {
        sim.scheduler.add(send_notifications(10));
        sim.scheduler.tick();
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(posts.lock().unwrap().len(), settled);
}
