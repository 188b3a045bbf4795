/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Outbox Event Model
//!
//! Transactional outbox: a pending domain event is written in the same
//! transaction as the task mutation that caused it, so there is no event
//! without its committed cause and no committed cause without its event.
//! The dispatcher is the sole consumer; it moves events from `Pending` to
//! `Published` or `Dead`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Business event types carried through the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Task accepted into the queue
    TaskCreated,
    /// Task reached `Succeeded`; billing commits the held units
    TaskSucceeded,
    /// Task reached `Failed`
    TaskFailed,
    /// Task reached `Canceled`; billing releases the held units
    TaskCanceled,
    /// Failed task re-entered the queue via the retry action
    TaskRetried,
    /// Synthetic event used for endpoint verification deliveries only;
    /// never picked up by the dispatch loop
    EndpointTest,
}

impl EventType {
    /// Returns the wire representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task.created",
            EventType::TaskSucceeded => "task.succeeded",
            EventType::TaskFailed => "task.failed",
            EventType::TaskCanceled => "task.canceled",
            EventType::TaskRetried => "task.retried",
            EventType::EndpointTest => "endpoint.test",
        }
    }

    /// Parses an event type from its wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task.created" => Some(EventType::TaskCreated),
            "task.succeeded" => Some(EventType::TaskSucceeded),
            "task.failed" => Some(EventType::TaskFailed),
            "task.canceled" => Some(EventType::TaskCanceled),
            "task.retried" => Some(EventType::TaskRetried),
            "endpoint.test" => Some(EventType::EndpointTest),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of aggregate an outbox event references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    Task,
    /// Endpoint-scoped synthetic events (verification deliveries)
    Endpoint,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Task => "task",
            AggregateType::Endpoint => "endpoint",
        }
    }
}

/// Dispatch status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting for dispatch, or waiting out a retry window
    Pending,
    /// Delivered to every subscribed endpoint (or there were none)
    Published,
    /// Transient marker used while a cycle is in flight; not a terminal state
    Failed,
    /// Retries exhausted or aggregate missing; only operator replay recovers it
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Dead => "DEAD",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A staged domain event (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique event identifier; stable across delivery attempts
    pub event_id: Uuid,
    /// Business event type
    pub event_type: EventType,
    /// Kind of aggregate `aggregate_id` references
    pub aggregate_type: AggregateType,
    /// The aggregate this event announces a change of
    pub aggregate_id: Uuid,
    /// Tenant that owns the aggregate; scopes endpoint resolution
    pub user_id: String,
    /// Trace id propagated into delivery headers
    pub trace_id: String,
    /// Event body, delivered as the `data` field of the envelope
    pub payload: serde_json::Value,
    /// Dispatch status
    pub status: OutboxStatus,
    /// Number of dispatch cycles in which at least one endpoint attempt failed
    pub retry_count: i32,
    /// Replay epoch: set when operator replay pulls the event out of `Dead`.
    /// Failed delivery rows older than this belong to a previous life of the
    /// event; attempt numbering continues above them but the retry budget
    /// restarts.
    pub replayed_at: Option<DateTime<Utc>>,
    /// When the event was staged; dispatch order is oldest-first on this
    pub created_at: DateTime<Utc>,
    /// When the dispatch status last changed
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Creates a new pending event for a task aggregate.
    pub fn for_task(
        event_type: EventType,
        task_id: Uuid,
        user_id: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            aggregate_type: AggregateType::Task,
            aggregate_id: task_id,
            user_id: user_id.into(),
            trace_id: Uuid::new_v4().to_string(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            replayed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
