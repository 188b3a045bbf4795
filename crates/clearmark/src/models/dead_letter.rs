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

//! Dead-Letter Entry Model
//!
//! Terminal quarantine for events and processing jobs that exhausted their
//! retry budget or hit a non-retryable failure. Entries keep full diagnostic
//! context; the guarded replay tool is the only recovery route.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subsystem a quarantined item came from. Determines how replay re-injects
/// it: processing jobs get a follow-up job, outbox events are reset to
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadLetterSource {
    /// Worker-orchestrator processing job
    TaskProgress,
    /// Webhook dispatch of an outbox event
    OutboxDispatch,
}

impl DeadLetterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterSource::TaskProgress => "task.progress",
            DeadLetterSource::OutboxDispatch => "outbox.dispatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task.progress" => Some(DeadLetterSource::TaskProgress),
            "outbox.dispatch" => Some(DeadLetterSource::OutboxDispatch),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeadLetterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an item was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// Data-integrity or configuration failure; retrying cannot succeed
    NonRetryable,
    /// A processing job ran out of attempts
    AttemptsExhausted,
    /// Every subscribed endpoint exhausted its delivery retry budget
    OutboxAttemptsExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::NonRetryable => "NON_RETRYABLE",
            DeadLetterReason::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
            DeadLetterReason::OutboxAttemptsExhausted => "OUTBOX_ATTEMPTS_EXHAUSTED",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A quarantined item with full diagnostic context (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Unique entry identifier
    pub entry_id: Uuid,
    /// Originating subsystem
    pub source: DeadLetterSource,
    /// Failure classification
    pub reason: DeadLetterReason,
    /// Task the item relates to, when known
    pub task_id: Option<Uuid>,
    /// Outbox event, for `OutboxDispatch` entries
    pub event_id: Option<Uuid>,
    /// Processing job, for `TaskProgress` entries
    pub job_id: Option<Uuid>,
    /// How many attempts were burned before quarantine
    pub attempts: i32,
    /// Last error text observed
    pub error: Option<String>,
    /// Set when the replay tool re-injected this entry
    pub replayed_at: Option<DateTime<Utc>>,
    /// When the item was quarantined
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Quarantines an outbox event.
    pub fn for_outbox_event(
        event_id: Uuid,
        task_id: Option<Uuid>,
        reason: DeadLetterReason,
        attempts: i32,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            source: DeadLetterSource::OutboxDispatch,
            reason,
            task_id,
            event_id: Some(event_id),
            job_id: None,
            attempts,
            error,
            replayed_at: None,
            created_at: now,
        }
    }

    /// Quarantines a processing job.
    pub fn for_job(
        job_id: Uuid,
        task_id: Uuid,
        reason: DeadLetterReason,
        attempts: i32,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            source: DeadLetterSource::TaskProgress,
            reason,
            task_id: Some(task_id),
            event_id: None,
            job_id: Some(job_id),
            attempts,
            error,
            replayed_at: None,
            created_at: now,
        }
    }
}
