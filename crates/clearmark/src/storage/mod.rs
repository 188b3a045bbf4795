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

//! Storage port.
//!
//! Business logic is written once against this interface. Reads are plain
//! queries; all writes go through [`Storage::apply`], an atomic conditional
//! write batch: either every operation in the batch commits, or none does.
//! Optimistic preconditions (task version/status, unique constraints) are
//! checked inside the batch, so a losing writer observes a typed
//! [`StorageError`] and retries or defers rather than blocking.
//!
//! The relational production backend lives outside this crate; the in-memory
//! backend in [`memory`] implements the same all-or-nothing semantics and is
//! the test double used throughout the suite.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{
    DeadLetterEntry, EndpointStatus, EventType, IdempotencyRecord, IdempotencyScope, OutboxEvent,
    OutboxStatus, Task, TaskStatus, UsageLedgerEntry, UsageTotals, WebhookDelivery,
    WebhookEndpoint,
};

pub use memory::MemoryStorage;

/// Field updates applied to a task by a conditional [`WriteOp::UpdateTask`].
///
/// The storage layer bumps `version` by exactly 1 and refreshes `updated_at`;
/// callers never write those directly.
#[derive(Debug, Clone)]
pub struct TaskPatch {
    /// New status (always set; a transition is the only reason to patch)
    pub status: TaskStatus,
    /// New progress, if the transition carries one
    pub progress: Option<i32>,
    /// Error fields, set when entering `Failed`
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Result URL, set when entering `Succeeded`
    pub result_url: Option<String>,
    /// Clears error fields (the retry edge leaving `Failed`)
    pub clear_error: bool,
}

impl TaskPatch {
    /// A patch that only moves the status.
    pub fn status_only(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            error_code: None,
            error_message: None,
            result_url: None,
            clear_error: false,
        }
    }

    /// Applies this patch to a task, bumping the version by exactly 1.
    /// Backends and the engine share this so the returned task matches the
    /// committed row.
    pub fn apply_to(&self, task: &mut Task) {
        task.status = self.status;
        task.version += 1;
        task.updated_at = Utc::now();
        if let Some(progress) = self.progress {
            task.progress = progress;
        }
        if self.clear_error {
            task.error_code = None;
            task.error_message = None;
        }
        if let Some(ref code) = self.error_code {
            task.error_code = Some(code.clone());
        }
        if let Some(ref message) = self.error_message {
            task.error_message = Some(message.clone());
        }
        if let Some(ref url) = self.result_url {
            task.result_url = Some(url.clone());
        }
    }
}

/// Field updates applied to a webhook endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    pub url: Option<String>,
    pub events: Option<Vec<EventType>>,
    pub status: Option<EndpointStatus>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    /// Marks this key id active for new signatures
    pub active_key_id: Option<String>,
    /// Registers an additional signing secret as `(key_id, secret)`
    pub add_secret: Option<(String, String)>,
}

/// One operation inside an atomic write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertTask(Task),
    /// Conditional update: commits only if the current row still matches
    /// `(task_id, expected_version, expected_status)`. Zero matches means
    /// another writer won the race and the whole batch fails with
    /// [`StorageError::VersionConflict`].
    UpdateTask {
        task_id: Uuid,
        expected_version: i64,
        expected_status: TaskStatus,
        patch: TaskPatch,
    },
    /// Unique on `(actor_id, idempotency_key, scope)`.
    InsertIdempotency(IdempotencyRecord),
    AppendUsage(UsageLedgerEntry),
    InsertOutboxEvent(OutboxEvent),
    UpdateOutboxEvent {
        event_id: Uuid,
        status: OutboxStatus,
        /// New retry count, if the cycle changed it
        retry_count: Option<i32>,
    },
    /// Operator replay: back to `Pending` with a zeroed retry count, and the
    /// replay epoch recorded so the dispatcher restarts the retry budget.
    ResetOutboxEvent {
        event_id: Uuid,
        at: DateTime<Utc>,
    },
    /// Unique on `(endpoint_id, event_id, attempt)`.
    InsertDelivery(WebhookDelivery),
    InsertEndpoint(WebhookEndpoint),
    UpdateEndpoint {
        endpoint_id: Uuid,
        patch: EndpointPatch,
    },
    InsertDeadLetter(DeadLetterEntry),
    MarkDeadLetterReplayed {
        entry_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// Transaction-scoped storage client.
///
/// Implementations must guarantee that [`apply`](Storage::apply) is atomic
/// and that no partial batch is ever visible to readers.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StorageError>;

    async fn get_idempotency(
        &self,
        actor_id: &str,
        idempotency_key: &str,
        scope: IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, StorageError>;

    /// Ledger sums for one user and billing period, for the quota check.
    async fn sum_usage(&self, user_id: &str, period: &str) -> Result<UsageTotals, StorageError>;

    /// Every ledger row a task has produced, in append order. Settlement
    /// reads the original hold from here.
    async fn list_task_usage(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<UsageLedgerEntry>, StorageError>;

    async fn get_event(&self, event_id: Uuid) -> Result<Option<OutboxEvent>, StorageError>;

    /// Pending events of the given types, oldest first (FIFO fairness),
    /// capped at `limit`.
    async fn list_pending_events(
        &self,
        event_types: &[EventType],
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StorageError>;

    async fn get_endpoint(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, StorageError>;

    /// All endpoints owned by a tenant, regardless of status; dispatch-time
    /// filtering (active + subscribed) is the caller's concern.
    async fn list_endpoints(&self, user_id: &str) -> Result<Vec<WebhookEndpoint>, StorageError>;

    /// The highest-attempt delivery row for an (endpoint, event) pair.
    async fn latest_delivery(
        &self,
        endpoint_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, StorageError>;

    /// All delivery rows for an (endpoint, event) pair, ordered by attempt.
    async fn list_deliveries(
        &self,
        endpoint_id: Uuid,
        event_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, StorageError>;

    /// Un-replayed dead-letter entries, oldest first, capped at `limit`
    /// (the replay tool's bounded scan window).
    async fn list_dead_letters(&self, limit: usize)
        -> Result<Vec<DeadLetterEntry>, StorageError>;

    /// Applies every operation atomically, or none of them.
    async fn apply(&self, batch: Vec<WriteOp>) -> Result<(), StorageError>;
}
