// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: promises, subscriptions, notifications.
//!
//! The promise state machine is a strict one-way tree:
//!
//! ```text
//!              ┌──────────┐
//!              │ Pending  │
//!              └────┬─────┘
//!        ┌───────┬──┴────┬─────────┐
//!        ▼       ▼       ▼         ▼
//!   Resolved  Rejected  Canceled  Timedout
//! ```
//!
//! Terminal states never transition again. States are powers of two so a
//! search over several states is a single `state & mask != 0` predicate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Promise lifecycle state, stored as a bitmask integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i64)]
pub enum State {
    /// Awaiting completion.
    Pending = 1,
    /// Completed successfully by a client.
    Resolved = 2,
    /// Completed with failure by a client.
    Rejected = 4,
    /// Deadline elapsed before completion.
    Timedout = 8,
    /// Canceled by a client.
    Canceled = 16,
}

impl State {
    /// Combine states into a search bitmask.
    pub fn mask(states: &[State]) -> i64 {
        states.iter().fold(0, |m, s| m | *s as i64)
    }

    /// Decode a stored state integer.
    pub fn from_i64(value: i64) -> Option<State> {
        match value {
            1 => Some(State::Pending),
            2 => Some(State::Resolved),
            4 => Some(State::Rejected),
            8 => Some(State::Timedout),
            16 => Some(State::Canceled),
            _ => None,
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, State::Pending)
    }
}

/// An opaque headers + data pair carried by a promise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Opaque header mapping.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque payload bytes.
    #[serde(default)]
    pub data: Vec<u8>,
}

/// A durable promise record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promise {
    /// Client-chosen unique identifier.
    pub id: String,
    /// Current lifecycle state.
    pub state: State,
    /// Immutable creation payload.
    pub param: Value,
    /// Completion payload; empty while pending.
    pub value: Value,
    /// Absolute deadline in milliseconds since epoch.
    pub timeout: i64,
    /// Idempotency key supplied on create.
    pub idempotency_key_for_create: Option<String>,
    /// Idempotency key supplied on completion.
    pub idempotency_key_for_complete: Option<String>,
    /// Opaque tag metadata.
    pub tags: HashMap<String, String>,
    /// Commit-time clock at creation.
    pub created_on: Option<i64>,
    /// Commit-time clock at completion; equals `timeout` for timeouts.
    pub completed_on: Option<i64>,
}

impl Promise {
    /// The snapshot a caller observes when a pending promise is found past
    /// its deadline: Timedout, empty value, `completed_on = timeout`.
    pub fn timed_out_view(&self) -> Promise {
        Promise {
            id: self.id.clone(),
            state: State::Timedout,
            param: self.param.clone(),
            value: Value::default(),
            timeout: self.timeout,
            idempotency_key_for_create: self.idempotency_key_for_create.clone(),
            idempotency_key_for_complete: self.idempotency_key_for_complete.clone(),
            tags: self.tags.clone(),
            created_on: self.created_on,
            completed_on: Some(self.timeout),
        }
    }
}

/// Retry schedule for notification delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between attempts, in milliseconds.
    #[serde(default = "RetryPolicy::default_delay_ms")]
    pub delay_ms: i64,
    /// Attempts before the notification is dropped.
    #[serde(default = "RetryPolicy::default_attempts")]
    pub attempts: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            delay_ms: Self::default_delay_ms(),
            attempts: Self::default_attempts(),
        }
    }
}

impl RetryPolicy {
    fn default_delay_ms() -> i64 {
        15_000
    }

    fn default_attempts() -> i64 {
        3
    }

    /// Delay before the attempt following `attempt`, exponential in the
    /// attempt number. The shift is capped so the schedule cannot overflow.
    pub fn backoff_ms(&self, attempt: i64) -> i64 {
        let shift = attempt.clamp(0, 16) as u32;
        self.delay_ms.saturating_mul(1_i64 << shift)
    }
}

/// A registered completion callback URL for a specific promise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier, unique per promise.
    pub id: String,
    /// The promise this subscription watches.
    pub promise_id: String,
    /// Delivery target.
    pub url: String,
    /// Delivery retry schedule.
    pub retry_policy: RetryPolicy,
    /// Commit-time clock at creation.
    pub created_on: Option<i64>,
    /// Server-assigned monotone ordering key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_id: Option<i64>,
}

/// A pending outbound delivery of a completion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Originating subscription identifier.
    pub id: String,
    /// The completed promise.
    pub promise_id: String,
    /// Delivery target.
    pub url: String,
    /// Delivery retry schedule.
    pub retry_policy: RetryPolicy,
    /// Next delivery deadline in milliseconds since epoch.
    pub time: i64,
    /// Attempts made so far.
    pub attempt: i64,
}

/// Response status, mapped onto HTTP by transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Idempotent hit or read.
    Ok,
    /// A state transition occurred.
    Created,
    /// State conflict, or already terminal under strict mode.
    Forbidden,
    /// Unknown promise or subscription.
    NotFound,
    /// Create collision under strict mode.
    Conflict,
}

impl Status {
    /// The HTTP status code for this status.
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::Conflict => 409,
        }
    }
}

/// Whether two idempotency keys match. Absent keys never match.
pub fn keys_match(stored: Option<&str>, requested: Option<&str>) -> bool {
    matches!((stored, requested), (Some(a), Some(b)) if a == b)
}

/// Response status for a completion verb that found the promise already in
/// a terminal state. Pure so it can be tested independently of storage.
///
/// Strict mode demands the stored state match the verb's target; outside
/// strict mode a matching idempotency key turns the replay into an OK.
pub fn completion_status(
    current: State,
    target: State,
    strict: bool,
    stored_key: Option<&str>,
    requested_key: Option<&str>,
) -> Status {
    let strict_mismatch = strict && current != target;

    if !strict_mismatch && keys_match(stored_key, requested_key) {
        Status::Ok
    } else {
        Status::Forbidden
    }
}
