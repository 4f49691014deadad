// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Vow Core server binary.
//!
//! Connects the configured store backend, starts the kernel, and runs
//! until interrupted. Transports attach through the library API.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use vow_core::config::{Config, StoreKind};
use vow_core::runtime::Runtime;
use vow_core::store::{PostgresStore, SqliteStore, StoreBackend};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vow_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Vow Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let backend: Arc<dyn StoreBackend> = match config.store_kind {
        StoreKind::Sqlite => {
            info!(path = %config.sqlite_path, "connecting sqlite store");
            Arc::new(SqliteStore::connect(&config.sqlite_path).await?)
        }
        StoreKind::Postgres => {
            info!("connecting postgres store");
            let url = config
                .database_url
                .as_deref()
                .expect("postgres backend requires VOW_DATABASE_URL");
            Arc::new(PostgresStore::connect(url, config.postgres_connections).await?)
        }
    };

    info!("store connected, migrations applied");

    let runtime = Runtime::builder()
        .backend(backend)
        .with_config(&config)
        .start(tokio::runtime::Handle::current())?;

    info!("Vow Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown();
    info!("Shutdown complete");

    Ok(())
}
