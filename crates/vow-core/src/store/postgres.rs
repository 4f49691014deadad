//! PostgreSQL-backed store.
//!
//! Connection-pooled; identical command semantics to the SQLite backend
//! modulo dialect (`$n` placeholders, identity column for `sort_id`).

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

use crate::error::{Error, Result};
use crate::types::State;

use super::{
    Command, CommandResult, NotificationRecord, PromiseRecord, StoreBackend, SubscriptionRecord,
    TimeoutRecord, Transaction, glob_to_like,
};

/// PostgreSQL store backend.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a backend from an existing pool. Migrations must already
    /// have run.
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    /// Connect to the given database URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|err| Error::Store {
                operation: "connect",
                details: format!("failed to connect to postgres: {}", err),
            })?;

        crate::migrations::POSTGRES.run(&pool).await?;

        Ok(PostgresStore { pool })
    }
}

#[async_trait]
impl StoreBackend for PostgresStore {
    fn name(&self) -> &'static str {
        "store:postgres"
    }

    async fn execute(&self, transactions: &[Transaction]) -> Result<Vec<Vec<CommandResult>>> {
        let mut tx = self.pool.begin().await?;

        let mut results = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let mut command_results = Vec::with_capacity(transaction.commands.len());
            for command in &transaction.commands {
                command_results.push(apply(&mut tx, command).await?);
            }
            results.push(command_results);
        }

        tx.commit().await?;
        Ok(results)
    }
}

async fn apply(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    command: &Command,
) -> Result<CommandResult> {
    match command {
        Command::ReadPromise { id } => {
            let record = sqlx::query_as::<_, PromiseRecord>(
                r#"
                SELECT id, state, param_headers, param_data, value_headers, value_data,
                       timeout, idempotency_key_for_create, idempotency_key_for_complete,
                       tags, created_on, completed_on
                FROM promises
                WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

            Ok(CommandResult::ReadPromise { record })
        }

        Command::SearchPromises {
            q,
            states,
            limit,
            sort_id,
        } => {
            let records = sqlx::query_as::<_, PromiseRecord>(
                r#"
                SELECT id, state, param_headers, param_data, value_headers, value_data,
                       timeout, idempotency_key_for_create, idempotency_key_for_complete,
                       tags, created_on, completed_on, sort_id
                FROM promises
                WHERE ($1::BIGINT IS NULL OR sort_id < $1)
                  AND state & $2 != 0
                  AND id LIKE $3
                ORDER BY sort_id DESC
                LIMIT $4
                "#,
            )
            .bind(sort_id)
            .bind(State::mask(states))
            .bind(glob_to_like(q))
            .bind(limit)
            .fetch_all(&mut **tx)
            .await?;

            let last_sort_id = records.last().map(|r| r.sort_id).unwrap_or(0);
            Ok(CommandResult::SearchPromises {
                records,
                last_sort_id,
            })
        }

        Command::CreatePromise {
            id,
            param,
            timeout,
            idempotency_key,
            tags,
            created_on,
        } => {
            let result = sqlx::query(
                r#"
                INSERT INTO promises
                    (id, state, param_headers, param_data, timeout,
                     idempotency_key_for_create, tags, created_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(State::Pending as i64)
            .bind(serde_json::to_string(&param.headers)?)
            .bind(&param.data)
            .bind(timeout)
            .bind(idempotency_key.as_deref())
            .bind(serde_json::to_string(tags)?)
            .bind(created_on)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::UpdatePromise {
            id,
            state,
            value,
            idempotency_key,
            completed_on,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE promises
                SET state = $1, value_headers = $2, value_data = $3,
                    idempotency_key_for_complete = $4, completed_on = $5
                WHERE id = $6 AND state = 1
                "#,
            )
            .bind(*state as i64)
            .bind(serde_json::to_string(&value.headers)?)
            .bind(&value.data)
            .bind(idempotency_key.as_deref())
            .bind(completed_on)
            .bind(id)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::TimeoutPromises { time } => {
            let result = sqlx::query(
                r#"
                UPDATE promises
                SET state = 8, completed_on = timeout
                WHERE state = 1 AND timeout <= $1
                "#,
            )
            .bind(time)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::ReadTimeouts { n } => {
            let records = sqlx::query_as::<_, TimeoutRecord>(
                r#"
                SELECT id, time FROM timeouts ORDER BY time ASC, id LIMIT $1
                "#,
            )
            .bind(n)
            .fetch_all(&mut **tx)
            .await?;

            Ok(CommandResult::ReadTimeouts { records })
        }

        Command::CreateTimeout { id, time } => {
            let result = sqlx::query(
                r#"
                INSERT INTO timeouts (id, time) VALUES ($1, $2)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(time)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::DeleteTimeout { id } => {
            let result = sqlx::query("DELETE FROM timeouts WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::ReadSubscription { id, promise_id } => {
            let record = sqlx::query_as::<_, SubscriptionRecord>(
                r#"
                SELECT id, promise_id, url, retry_policy, created_on, sort_id
                FROM subscriptions
                WHERE id = $1 AND promise_id = $2
                "#,
            )
            .bind(id)
            .bind(promise_id)
            .fetch_optional(&mut **tx)
            .await?;

            Ok(CommandResult::ReadSubscription { record })
        }

        Command::ReadSubscriptions {
            promise_id,
            limit,
            sort_id,
        } => {
            let records = sqlx::query_as::<_, SubscriptionRecord>(
                r#"
                SELECT id, promise_id, url, retry_policy, created_on, sort_id
                FROM subscriptions
                WHERE ($1::BIGINT IS NULL OR sort_id < $1) AND promise_id = $2
                ORDER BY sort_id DESC
                LIMIT $3
                "#,
            )
            .bind(sort_id)
            .bind(promise_id)
            .bind(limit)
            .fetch_all(&mut **tx)
            .await?;

            let last_sort_id = records.last().map(|r| r.sort_id).unwrap_or(0);
            Ok(CommandResult::ReadSubscriptions {
                records,
                last_sort_id,
            })
        }

        Command::CreateSubscription {
            id,
            promise_id,
            url,
            retry_policy,
            created_on,
        } => {
            let result = sqlx::query(
                r#"
                INSERT INTO subscriptions (id, promise_id, url, retry_policy, created_on)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id, promise_id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(promise_id)
            .bind(url)
            .bind(serde_json::to_string(retry_policy)?)
            .bind(created_on)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::DeleteSubscription { id, promise_id } => {
            let result =
                sqlx::query("DELETE FROM subscriptions WHERE id = $1 AND promise_id = $2")
                    .bind(id)
                    .bind(promise_id)
                    .execute(&mut **tx)
                    .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::DeleteSubscriptions { promise_id } => {
            let result = sqlx::query("DELETE FROM subscriptions WHERE promise_id = $1")
                .bind(promise_id)
                .execute(&mut **tx)
                .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::TimeoutDeleteSubscriptions { time } => {
            let result = sqlx::query(
                r#"
                DELETE FROM subscriptions
                WHERE promise_id IN
                    (SELECT id FROM promises WHERE state = 1 AND timeout <= $1)
                "#,
            )
            .bind(time)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::ReadNotifications { n } => {
            let records = sqlx::query_as::<_, NotificationRecord>(
                r#"
                SELECT id, promise_id, url, retry_policy, time, attempt
                FROM notifications
                ORDER BY time ASC, promise_id, id
                LIMIT $1
                "#,
            )
            .bind(n)
            .fetch_all(&mut **tx)
            .await?;

            Ok(CommandResult::ReadNotifications { records })
        }

        Command::CreateNotifications { promise_id, time } => {
            let result = sqlx::query(
                r#"
                INSERT INTO notifications (id, promise_id, url, retry_policy, time, attempt)
                SELECT id, promise_id, url, retry_policy, $1, 0
                FROM subscriptions
                WHERE promise_id = $2
                ON CONFLICT (id, promise_id) DO NOTHING
                "#,
            )
            .bind(time)
            .bind(promise_id)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::UpdateNotification {
            id,
            promise_id,
            time,
            attempt,
        } => {
            let result = sqlx::query(
                r#"
                UPDATE notifications SET time = $1, attempt = $2
                WHERE id = $3 AND promise_id = $4
                "#,
            )
            .bind(time)
            .bind(attempt)
            .bind(id)
            .bind(promise_id)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::DeleteNotification { id, promise_id } => {
            let result =
                sqlx::query("DELETE FROM notifications WHERE id = $1 AND promise_id = $2")
                    .bind(id)
                    .bind(promise_id)
                    .execute(&mut **tx)
                    .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }

        Command::TimeoutCreateNotifications { time } => {
            let result = sqlx::query(
                r#"
                INSERT INTO notifications (id, promise_id, url, retry_policy, time, attempt)
                SELECT id, promise_id, url, retry_policy, $1, 0
                FROM subscriptions
                WHERE promise_id IN
                    (SELECT id FROM promises WHERE state = 1 AND timeout <= $1)
                ON CONFLICT (id, promise_id) DO NOTHING
                "#,
            )
            .bind(time)
            .execute(&mut **tx)
            .await?;

            Ok(CommandResult::RowsAffected(result.rows_affected()))
        }
    }
}
