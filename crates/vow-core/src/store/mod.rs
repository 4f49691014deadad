// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The store subsystem: a dialect-free command taxonomy executed
//! transactionally by interchangeable SQLite and PostgreSQL backends.
//!
//! Command semantics live here; dialect specifics (placeholders,
//! autoincrement vs identity, upsert syntax) stay inside the backends.
//! Promise state is stored as a bitmask integer so a multi-state search is
//! one indexed scan; search translates `*` globs to SQL `LIKE` and pages by
//! keyset on descending `sort_id`.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::error::{Error, Result};
use crate::kernel::aio::Subsystem;
use crate::kernel::{Completion, Cqe, Kind, Sqe, Submission};
use crate::types::{
    Notification, Promise, RetryPolicy, State, Subscription, Value,
};

/// An ordered list of commands executed atomically.
#[derive(Debug)]
pub struct Transaction {
    /// The commands, applied in order.
    pub commands: Vec<Command>,
}

impl Transaction {
    /// A transaction over the given commands.
    pub fn new(commands: Vec<Command>) -> Self {
        assert!(!commands.is_empty(), "transaction must carry a command");
        Transaction { commands }
    }

    /// A single-command transaction.
    pub fn one(command: Command) -> Self {
        Transaction::new(vec![command])
    }
}

/// The complete store command taxonomy.
#[derive(Debug)]
pub enum Command {
    /// Read one promise by id.
    ReadPromise {
        /// Promise id.
        id: String,
    },
    /// Search promises by id glob and state mask, keyset-paginated.
    SearchPromises {
        /// Id pattern with `*` wildcards.
        q: String,
        /// States to match.
        states: Vec<State>,
        /// Page size.
        limit: i64,
        /// Exclusive upper bound on `sort_id` from the previous page.
        sort_id: Option<i64>,
    },
    /// Insert a pending promise; a duplicate id inserts nothing.
    CreatePromise {
        /// Promise id.
        id: String,
        /// Creation payload.
        param: Value,
        /// Absolute deadline, ms since epoch.
        timeout: i64,
        /// Idempotency key for create.
        idempotency_key: Option<String>,
        /// Tag metadata.
        tags: HashMap<String, String>,
        /// Commit-time clock.
        created_on: i64,
    },
    /// Complete a promise, guarded by `state = Pending`.
    UpdatePromise {
        /// Promise id.
        id: String,
        /// Terminal state to transition to.
        state: State,
        /// Completion payload.
        value: Value,
        /// Idempotency key for complete.
        idempotency_key: Option<String>,
        /// Commit-time clock.
        completed_on: i64,
    },
    /// Transition every pending promise with `timeout <= time` to Timedout,
    /// setting `completed_on` to its own deadline.
    TimeoutPromises {
        /// Sweep horizon, ms since epoch.
        time: i64,
    },

    /// Read up to `n` timeout rows ordered by time.
    ReadTimeouts {
        /// Row limit.
        n: i64,
    },
    /// Insert a sweep trigger; duplicates insert nothing.
    CreateTimeout {
        /// Promise id.
        id: String,
        /// Trigger time, ms since epoch.
        time: i64,
    },
    /// Remove a sweep trigger.
    DeleteTimeout {
        /// Promise id.
        id: String,
    },

    /// Read one subscription by `(id, promise_id)`.
    ReadSubscription {
        /// Subscription id.
        id: String,
        /// Promise id.
        promise_id: String,
    },
    /// Read a promise's subscriptions, keyset-paginated.
    ReadSubscriptions {
        /// Promise id.
        promise_id: String,
        /// Page size.
        limit: i64,
        /// Exclusive upper bound on `sort_id` from the previous page.
        sort_id: Option<i64>,
    },
    /// Insert a subscription; a duplicate `(id, promise_id)` inserts
    /// nothing.
    CreateSubscription {
        /// Subscription id.
        id: String,
        /// Promise id.
        promise_id: String,
        /// Delivery target.
        url: String,
        /// Delivery retry schedule.
        retry_policy: RetryPolicy,
        /// Commit-time clock.
        created_on: i64,
    },
    /// Delete one subscription.
    DeleteSubscription {
        /// Subscription id.
        id: String,
        /// Promise id.
        promise_id: String,
    },
    /// Delete every subscription of one promise.
    DeleteSubscriptions {
        /// Promise id.
        promise_id: String,
    },
    /// Delete subscriptions of every pending promise with
    /// `timeout <= time`.
    TimeoutDeleteSubscriptions {
        /// Sweep horizon, ms since epoch.
        time: i64,
    },

    /// Read up to `n` notifications ordered by delivery deadline.
    ReadNotifications {
        /// Row limit.
        n: i64,
    },
    /// Insert one notification per subscription of the promise.
    CreateNotifications {
        /// Promise id.
        promise_id: String,
        /// First delivery deadline.
        time: i64,
    },
    /// Reschedule a notification after a failed delivery.
    UpdateNotification {
        /// Subscription id.
        id: String,
        /// Promise id.
        promise_id: String,
        /// Next delivery deadline.
        time: i64,
        /// Attempts made so far.
        attempt: i64,
    },
    /// Remove a notification.
    DeleteNotification {
        /// Subscription id.
        id: String,
        /// Promise id.
        promise_id: String,
    },
    /// Insert one notification per subscription of every pending promise
    /// with `timeout <= time`.
    TimeoutCreateNotifications {
        /// Sweep horizon, ms since epoch.
        time: i64,
    },
}

/// Raw promise row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PromiseRecord {
    /// Promise id.
    pub id: String,
    /// State bitmask value.
    pub state: i64,
    /// Creation headers as JSON text.
    pub param_headers: Option<String>,
    /// Creation payload bytes.
    pub param_data: Option<Vec<u8>>,
    /// Completion headers as JSON text.
    pub value_headers: Option<String>,
    /// Completion payload bytes.
    pub value_data: Option<Vec<u8>>,
    /// Absolute deadline, ms since epoch.
    pub timeout: i64,
    /// Idempotency key for create.
    pub idempotency_key_for_create: Option<String>,
    /// Idempotency key for complete.
    pub idempotency_key_for_complete: Option<String>,
    /// Tags as JSON text.
    pub tags: Option<String>,
    /// Commit-time clock at creation.
    pub created_on: Option<i64>,
    /// Commit-time clock at completion.
    pub completed_on: Option<i64>,
    /// Server-assigned monotone ordering key; only selected by search.
    #[sqlx(default)]
    pub sort_id: i64,
}

impl PromiseRecord {
    /// Decode the row into its domain type.
    pub fn into_promise(self) -> Result<Promise> {
        let state = State::from_i64(self.state).ok_or_else(|| Error::CorruptRecord {
            id: self.id.clone(),
            details: format!("unknown state {}", self.state),
        })?;

        Ok(Promise {
            state,
            param: Value {
                headers: decode_headers(&self.id, self.param_headers.as_deref())?,
                data: self.param_data.unwrap_or_default(),
            },
            value: Value {
                headers: decode_headers(&self.id, self.value_headers.as_deref())?,
                data: self.value_data.unwrap_or_default(),
            },
            timeout: self.timeout,
            idempotency_key_for_create: self.idempotency_key_for_create,
            idempotency_key_for_complete: self.idempotency_key_for_complete,
            tags: decode_headers(&self.id, self.tags.as_deref())?,
            created_on: self.created_on,
            completed_on: self.completed_on,
            id: self.id,
        })
    }
}

fn decode_headers(id: &str, json: Option<&str>) -> Result<HashMap<String, String>> {
    match json {
        None => Ok(HashMap::new()),
        Some(text) => serde_json::from_str(text).map_err(|err| Error::CorruptRecord {
            id: id.to_string(),
            details: err.to_string(),
        }),
    }
}

fn decode_retry_policy(id: &str, json: Option<&str>) -> Result<RetryPolicy> {
    match json {
        None => Ok(RetryPolicy::default()),
        Some(text) => serde_json::from_str(text).map_err(|err| Error::CorruptRecord {
            id: id.to_string(),
            details: err.to_string(),
        }),
    }
}

/// Raw timeout row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimeoutRecord {
    /// Promise id.
    pub id: String,
    /// Trigger time, ms since epoch.
    pub time: i64,
}

/// Raw subscription row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    /// Subscription id.
    pub id: String,
    /// Promise id.
    pub promise_id: String,
    /// Delivery target.
    pub url: String,
    /// Retry policy as JSON text.
    pub retry_policy: Option<String>,
    /// Commit-time clock at creation.
    pub created_on: Option<i64>,
    /// Server-assigned monotone ordering key; only selected by list reads.
    #[sqlx(default)]
    pub sort_id: i64,
}

impl SubscriptionRecord {
    /// Decode the row into its domain type.
    pub fn into_subscription(self) -> Result<Subscription> {
        Ok(Subscription {
            retry_policy: decode_retry_policy(&self.id, self.retry_policy.as_deref())?,
            id: self.id,
            promise_id: self.promise_id,
            url: self.url,
            created_on: self.created_on,
            sort_id: Some(self.sort_id),
        })
    }
}

/// Raw notification row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRecord {
    /// Subscription id.
    pub id: String,
    /// Promise id.
    pub promise_id: String,
    /// Delivery target.
    pub url: String,
    /// Retry policy as JSON text.
    pub retry_policy: Option<String>,
    /// Next delivery deadline.
    pub time: i64,
    /// Attempts made so far.
    pub attempt: i64,
}

impl NotificationRecord {
    /// Decode the row into its domain type.
    pub fn into_notification(self) -> Result<Notification> {
        Ok(Notification {
            retry_policy: decode_retry_policy(&self.id, self.retry_policy.as_deref())?,
            id: self.id,
            promise_id: self.promise_id,
            url: self.url,
            time: self.time,
            attempt: self.attempt,
        })
    }
}

/// Per-command result. Reads carry typed records; every write reports the
/// rows it touched.
#[derive(Debug)]
pub enum CommandResult {
    /// Result of [`Command::ReadPromise`].
    ReadPromise {
        /// The row, when one matched.
        record: Option<PromiseRecord>,
    },
    /// Result of [`Command::SearchPromises`].
    SearchPromises {
        /// Matching rows, newest first.
        records: Vec<PromiseRecord>,
        /// `sort_id` of the last row, for the next page.
        last_sort_id: i64,
    },
    /// Result of [`Command::ReadTimeouts`].
    ReadTimeouts {
        /// Due-soonest-first rows.
        records: Vec<TimeoutRecord>,
    },
    /// Result of [`Command::ReadSubscription`].
    ReadSubscription {
        /// The row, when one matched.
        record: Option<SubscriptionRecord>,
    },
    /// Result of [`Command::ReadSubscriptions`].
    ReadSubscriptions {
        /// Matching rows, newest first.
        records: Vec<SubscriptionRecord>,
        /// `sort_id` of the last row, for the next page.
        last_sort_id: i64,
    },
    /// Result of [`Command::ReadNotifications`].
    ReadNotifications {
        /// Due-soonest-first rows.
        records: Vec<NotificationRecord>,
    },
    /// Rows affected by a write command.
    RowsAffected(u64),
}

impl CommandResult {
    /// Rows affected by a write. Aborts on a read result: the caller
    /// indexed the transaction's results wrong, which is a kernel bug.
    pub fn rows_affected(&self) -> u64 {
        match self {
            CommandResult::RowsAffected(rows) => *rows,
            other => panic!("expected rows-affected result, got {:?}", other),
        }
    }

    /// Unwrap a [`Command::ReadPromise`] result.
    pub fn into_read_promise(self) -> Option<PromiseRecord> {
        match self {
            CommandResult::ReadPromise { record } => record,
            other => panic!("expected read-promise result, got {:?}", other),
        }
    }

    /// Unwrap a [`Command::SearchPromises`] result.
    pub fn into_search_promises(self) -> (Vec<PromiseRecord>, i64) {
        match self {
            CommandResult::SearchPromises {
                records,
                last_sort_id,
            } => (records, last_sort_id),
            other => panic!("expected search-promises result, got {:?}", other),
        }
    }

    /// Unwrap a [`Command::ReadTimeouts`] result.
    pub fn into_read_timeouts(self) -> Vec<TimeoutRecord> {
        match self {
            CommandResult::ReadTimeouts { records } => records,
            other => panic!("expected read-timeouts result, got {:?}", other),
        }
    }

    /// Unwrap a [`Command::ReadSubscription`] result.
    pub fn into_read_subscription(self) -> Option<SubscriptionRecord> {
        match self {
            CommandResult::ReadSubscription { record } => record,
            other => panic!("expected read-subscription result, got {:?}", other),
        }
    }

    /// Unwrap a [`Command::ReadSubscriptions`] result.
    pub fn into_read_subscriptions(self) -> (Vec<SubscriptionRecord>, i64) {
        match self {
            CommandResult::ReadSubscriptions {
                records,
                last_sort_id,
            } => (records, last_sort_id),
            other => panic!("expected read-subscriptions result, got {:?}", other),
        }
    }

    /// Unwrap a [`Command::ReadNotifications`] result.
    pub fn into_read_notifications(self) -> Vec<NotificationRecord> {
        match self {
            CommandResult::ReadNotifications { records } => records,
            other => panic!("expected read-notifications result, got {:?}", other),
        }
    }
}

/// Translate an id glob (`*` wildcard) into a SQL `LIKE` pattern.
pub fn glob_to_like(q: &str) -> String {
    q.replace('*', "%")
}

/// A store backend executes command batches, each transaction
/// all-or-nothing. Backends differ only in dialect.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Execute the transactions atomically, returning per-command results
    /// in submission order.
    async fn execute(&self, transactions: &[Transaction]) -> Result<Vec<Vec<CommandResult>>>;
}

/// The store subsystem: adapts a [`StoreBackend`] to the AIO worker-pool
/// contract. Each worker blocks on the backend future with a per-batch
/// transaction deadline.
pub struct StoreSubsystem {
    backend: Arc<dyn StoreBackend>,
    handle: Handle,
    workers: usize,
    tx_timeout: Duration,
}

impl StoreSubsystem {
    /// Create the subsystem over a connected backend.
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        handle: Handle,
        workers: usize,
        tx_timeout: Duration,
    ) -> Self {
        StoreSubsystem {
            backend,
            handle,
            workers,
            tx_timeout,
        }
    }
}

impl Subsystem for StoreSubsystem {
    fn kind(&self) -> Kind {
        Kind::Store
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn process(&self, batch: Vec<Sqe>) -> Vec<Cqe> {
        let mut tokens = Vec::with_capacity(batch.len());
        let mut transactions = Vec::with_capacity(batch.len());
        for sqe in batch {
            match sqe.submission {
                Submission::Store(transaction) => {
                    tokens.push(sqe.token);
                    transactions.push(transaction);
                }
                other => panic!("store worker received {:?} submission", other.kind()),
            }
        }

        // The whole batch shares one database transaction (and one
        // deadline); on failure every submitter sees the error.
        let outcome = self.handle.block_on(async {
            tokio::time::timeout(self.tx_timeout, self.backend.execute(&transactions)).await
        });

        match outcome {
            Ok(Ok(results)) => {
                assert_eq!(
                    results.len(),
                    tokens.len(),
                    "backend returned {} results for {} transactions",
                    results.len(),
                    tokens.len()
                );
                tokens
                    .into_iter()
                    .zip(results)
                    .map(|(token, result)| Cqe {
                        token,
                        completion: Ok(Completion::Store(result)),
                    })
                    .collect()
            }
            Ok(Err(err)) => {
                let details = err.to_string();
                tokens
                    .into_iter()
                    .map(|token| Cqe {
                        token,
                        completion: Err(Error::Store {
                            operation: "transaction",
                            details: details.clone(),
                        }),
                    })
                    .collect()
            }
            Err(_elapsed) => tokens
                .into_iter()
                .map(|token| Cqe {
                    token,
                    completion: Err(Error::TxTimeout(self.tx_timeout.as_millis() as u64)),
                })
                .collect(),
        }
    }
}
