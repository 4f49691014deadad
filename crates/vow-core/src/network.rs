// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network subsystem: delivers completion events as HTTP POSTs.
//!
//! Delivery failures are never errors at the kernel boundary; the result
//! carries `success = false` and the notification coroutine decides
//! whether to reschedule.

use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use crate::kernel::aio::Subsystem;
use crate::kernel::{Completion, Cqe, HttpPost, HttpResult, Kind, Sqe, Submission};

/// The outbound HTTP subsystem.
pub struct NetworkSubsystem {
    client: reqwest::Client,
    handle: Handle,
    workers: usize,
}

impl NetworkSubsystem {
    /// Create the subsystem with `workers` threads and a per-request
    /// timeout.
    pub fn new(handle: Handle, workers: usize, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to build http client");

        NetworkSubsystem {
            client,
            handle,
            workers,
        }
    }

    async fn post(&self, post: &HttpPost) -> HttpResult {
        match self.client.post(&post.url).json(&post.body).send().await {
            Ok(response) => HttpResult {
                success: response.status().is_success(),
                status: Some(response.status().as_u16()),
            },
            Err(err) => {
                debug!(url = %post.url, error = %err, "notification post failed");
                HttpResult {
                    success: false,
                    status: None,
                }
            }
        }
    }
}

impl Subsystem for NetworkSubsystem {
    fn kind(&self) -> Kind {
        Kind::Network
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn process(&self, batch: Vec<Sqe>) -> Vec<Cqe> {
        batch
            .into_iter()
            .map(|sqe| match sqe.submission {
                Submission::Network(post) => {
                    let result = self.handle.block_on(self.post(&post));
                    Cqe {
                        token: sqe.token,
                        completion: Ok(Completion::Network(result)),
                    }
                }
                other => panic!("network worker received {:?} submission", other.kind()),
            })
            .collect()
    }
}
