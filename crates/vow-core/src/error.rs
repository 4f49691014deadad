// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for vow-core.

use thiserror::Error;

/// Errors surfaced by the kernel and its subsystems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request validation failed before reaching the kernel.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: &'static str,
        /// The validation error message.
        message: String,
    },

    /// A store transaction failed and was rolled back.
    #[error("store error during '{operation}': {details}")]
    Store {
        /// The operation that failed.
        operation: &'static str,
        /// Error details.
        details: String,
    },

    /// A store transaction exceeded its deadline.
    #[error("store transaction timed out after {0}ms")]
    TxTimeout(u64),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted record could not be decoded into its domain type.
    #[error("corrupt record for '{id}': {details}")]
    CorruptRecord {
        /// The record key.
        id: String,
        /// Decode failure details.
        details: String,
    },

    /// The kernel is shut down and no longer accepts requests.
    #[error("kernel is shut down")]
    Closed,

    /// The ingress queue is full.
    #[error("ingress queue is full")]
    Busy,
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store {
            operation: "query",
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::Store {
            operation: "migrate",
            details: err.to_string(),
        }
    }
}

/// Result type using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
