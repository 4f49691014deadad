// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;

/// Which store backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Embedded SQLite (file or `:memory:`).
    Sqlite,
    /// PostgreSQL.
    Postgres,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store backend kind.
    pub store_kind: StoreKind,
    /// SQLite database path (sqlite backend).
    pub sqlite_path: String,
    /// PostgreSQL connection URL (postgres backend).
    pub database_url: Option<String>,
    /// Store worker pool size.
    pub store_workers: usize,
    /// PostgreSQL connection pool size.
    pub postgres_connections: u32,
    /// Store transaction deadline, milliseconds.
    pub tx_timeout_ms: u64,
    /// Network worker pool size.
    pub network_workers: usize,
    /// Notification HTTP request timeout, milliseconds.
    pub http_timeout_ms: u64,
    /// Kernel tick interval, milliseconds.
    pub tick_interval_ms: u64,
    /// Maximum requests admitted per tick.
    pub tick_batch: usize,
    /// Bounded ingress queue capacity.
    pub ingress_capacity: usize,
    /// Timeout sweeper heartbeat, milliseconds.
    pub sweep_interval_ms: i64,
    /// Notification sender heartbeat, milliseconds.
    pub notify_interval_ms: i64,
    /// Timeout rows read per sweep.
    pub sweep_batch: i64,
    /// Notifications read per sender heartbeat.
    pub notify_batch: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required for the postgres backend:
    /// - `VOW_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `VOW_STORE`: `sqlite` (default) or `postgres`
    /// - `VOW_SQLITE_PATH`: SQLite path (default: `vow.db`)
    /// - `VOW_STORE_WORKERS`: store workers (default: 1 sqlite, 4 postgres)
    /// - `VOW_POSTGRES_CONNECTIONS`: pool size (default: 10)
    /// - `VOW_TX_TIMEOUT_MS`: transaction deadline (default: 10000)
    /// - `VOW_NETWORK_WORKERS`: network workers (default: 4)
    /// - `VOW_HTTP_TIMEOUT_MS`: notification timeout (default: 10000)
    /// - `VOW_TICK_INTERVAL_MS`: tick interval (default: 10)
    /// - `VOW_TICK_BATCH`: requests admitted per tick (default: 100)
    /// - `VOW_INGRESS_CAPACITY`: ingress queue size (default: 1024)
    /// - `VOW_SWEEP_INTERVAL_MS`: sweeper heartbeat (default: 1000)
    /// - `VOW_NOTIFY_INTERVAL_MS`: sender heartbeat (default: 1000)
    /// - `VOW_SWEEP_BATCH`: timeouts read per sweep (default: 100)
    /// - `VOW_NOTIFY_BATCH`: notifications read per heartbeat (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_kind = match std::env::var("VOW_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .as_str()
        {
            "sqlite" => StoreKind::Sqlite,
            "postgres" => StoreKind::Postgres,
            _ => return Err(ConfigError::Invalid("VOW_STORE", "must be sqlite or postgres")),
        };

        let database_url = std::env::var("VOW_DATABASE_URL").ok();
        if store_kind == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("VOW_DATABASE_URL"));
        }

        let default_store_workers = match store_kind {
            StoreKind::Sqlite => 1,
            StoreKind::Postgres => 4,
        };

        Ok(Config {
            store_kind,
            sqlite_path: std::env::var("VOW_SQLITE_PATH").unwrap_or_else(|_| "vow.db".to_string()),
            database_url,
            store_workers: parse_var("VOW_STORE_WORKERS", default_store_workers)?,
            postgres_connections: parse_var("VOW_POSTGRES_CONNECTIONS", 10)?,
            tx_timeout_ms: parse_var("VOW_TX_TIMEOUT_MS", 10_000)?,
            network_workers: parse_var("VOW_NETWORK_WORKERS", 4)?,
            http_timeout_ms: parse_var("VOW_HTTP_TIMEOUT_MS", 10_000)?,
            tick_interval_ms: parse_var("VOW_TICK_INTERVAL_MS", 10)?,
            tick_batch: parse_var("VOW_TICK_BATCH", 100)?,
            ingress_capacity: parse_var("VOW_INGRESS_CAPACITY", 1024)?,
            sweep_interval_ms: parse_var("VOW_SWEEP_INTERVAL_MS", 1000)?,
            notify_interval_ms: parse_var("VOW_NOTIFY_INTERVAL_MS", 1000)?,
            sweep_batch: parse_var("VOW_SWEEP_BATCH", 100)?,
            notify_batch: parse_var("VOW_NOTIFY_BATCH", 100)?,
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a valid number")),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
