// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime: wires the store backend, the AIO worker pools, and
//! the kernel thread together.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vow_core::runtime::Runtime;
//! use vow_core::store::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(SqliteStore::connect("vow.db").await?);
//!     let runtime = Runtime::builder()
//!         .backend(backend)
//!         .start(tokio::runtime::Handle::current())?;
//!
//!     let api = runtime.api();
//!     // ... serve requests ...
//!
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::bounded;
use tracing::info;

use crate::api::Api;
use crate::config::Config;
use crate::coroutines::{send_notifications, sweep_timeouts};
use crate::error::{Error, Result};
use crate::kernel::aio::Aio;
use crate::kernel::scheduler::{Clock, Scheduler, WallClock};
use crate::network::NetworkSubsystem;
use crate::store::{StoreBackend, StoreSubsystem};

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder {
    backend: Option<Arc<dyn StoreBackend>>,
    clock: Option<Box<dyn Clock>>,
    store_workers: usize,
    network_workers: usize,
    tx_timeout: Duration,
    http_timeout: Duration,
    tick_interval: Duration,
    tick_batch: usize,
    ingress_capacity: usize,
    sweep_interval_ms: i64,
    notify_interval_ms: i64,
    sweep_batch: i64,
    notify_batch: i64,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            backend: None,
            clock: None,
            store_workers: 1,
            network_workers: 4,
            tx_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(10),
            tick_batch: 100,
            ingress_capacity: 1024,
            sweep_interval_ms: 1000,
            notify_interval_ms: 1000,
            sweep_batch: 100,
            notify_batch: 100,
        }
    }
}

impl RuntimeBuilder {
    /// Set the store backend (required).
    pub fn backend(mut self, backend: Arc<dyn StoreBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the kernel clock. Defaults to wall-clock time; tests
    /// inject a manual clock for deterministic trajectories.
    pub fn clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Apply worker, deadline, and heartbeat settings from a [`Config`].
    pub fn with_config(mut self, config: &Config) -> Self {
        self.store_workers = config.store_workers;
        self.network_workers = config.network_workers;
        self.tx_timeout = Duration::from_millis(config.tx_timeout_ms);
        self.http_timeout = Duration::from_millis(config.http_timeout_ms);
        self.tick_interval = Duration::from_millis(config.tick_interval_ms);
        self.tick_batch = config.tick_batch;
        self.ingress_capacity = config.ingress_capacity;
        self.sweep_interval_ms = config.sweep_interval_ms;
        self.notify_interval_ms = config.notify_interval_ms;
        self.sweep_batch = config.sweep_batch;
        self.notify_batch = config.notify_batch;
        self
    }

    /// Override the kernel tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Override the sweeper and sender heartbeat intervals.
    pub fn heartbeat_intervals(mut self, sweep_ms: i64, notify_ms: i64) -> Self {
        self.sweep_interval_ms = sweep_ms;
        self.notify_interval_ms = notify_ms;
        self
    }

    /// Start the kernel thread and the subsystem worker pools.
    ///
    /// `handle` is the tokio runtime the subsystem workers block their
    /// store and HTTP futures on.
    pub fn start(self, handle: tokio::runtime::Handle) -> Result<Runtime> {
        let backend = self.backend.ok_or_else(|| Error::Validation {
            field: "backend",
            message: "a store backend is required".to_string(),
        })?;

        info!(
            store = backend.name(),
            store_workers = self.store_workers,
            network_workers = self.network_workers,
            "starting kernel"
        );

        let mut aio = Aio::new();
        aio.register(Arc::new(StoreSubsystem::new(
            backend,
            handle.clone(),
            self.store_workers,
            self.tx_timeout,
        )));
        aio.register(Arc::new(NetworkSubsystem::new(
            handle,
            self.network_workers,
            self.http_timeout,
        )));

        let (ingress_tx, ingress_rx) = bounded(self.ingress_capacity);
        let clock = self.clock.unwrap_or_else(|| Box::new(WallClock));
        let mut scheduler = Scheduler::new(clock, ingress_rx, self.tick_batch, aio);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let tick_interval = self.tick_interval;
        let sweep_batch = self.sweep_batch;
        let notify_batch = self.notify_batch;

        // Heartbeats are tick-driven so they keep firing under an injected
        // clock that only the tests advance.
        let tick_ms = (self.tick_interval.as_millis() as i64).max(1);
        let sweep_every = (self.sweep_interval_ms / tick_ms).max(1) as u64;
        let notify_every = (self.notify_interval_ms / tick_ms).max(1) as u64;

        let kernel = std::thread::Builder::new()
            .name("vow-kernel".to_string())
            .spawn(move || {
                let mut ticks: u64 = 0;

                loop {
                    let shutting_down = flag.load(Ordering::SeqCst);
                    if shutting_down {
                        scheduler.close_ingress();
                    }

                    scheduler.tick();

                    if !shutting_down {
                        if ticks % sweep_every == 0 {
                            scheduler.add(sweep_timeouts(sweep_batch));
                        }
                        if ticks % notify_every == 0 {
                            scheduler.add(send_notifications(notify_batch));
                        }
                    }
                    ticks = ticks.wrapping_add(1);

                    if shutting_down && scheduler.is_idle() {
                        break;
                    }

                    std::thread::sleep(tick_interval);
                }

                scheduler.shutdown();
            })
            .map_err(|err| Error::Store {
                operation: "spawn",
                details: format!("failed to spawn kernel thread: {}", err),
            })?;

        Ok(Runtime {
            api: Api::new(ingress_tx),
            shutdown,
            kernel: Some(kernel),
        })
    }
}

/// A started kernel: the scheduler thread, its AIO worker pools, and the
/// API handle feeding them.
pub struct Runtime {
    api: Api,
    shutdown: Arc<AtomicBool>,
    kernel: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Handle for submitting requests.
    pub fn api(&self) -> Api {
        self.api.clone()
    }

    /// Graceful shutdown: stop admitting requests, drain live coroutines,
    /// join the kernel and worker threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(kernel) = self.kernel.take() {
            info!("shutting down kernel");
            self.shutdown.store(true, Ordering::SeqCst);
            let _ = kernel.join();
            info!("kernel stopped");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
