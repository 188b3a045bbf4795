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

//! In-memory storage backend.
//!
//! Transaction semantics are explicit: a batch is applied to a staged copy of
//! the state under the lock, and the copy replaces the live state only if
//! every operation succeeded. Readers never observe a partial batch. This is
//! the test double the suite runs against; the relational backend implements
//! the same port outside this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{EndpointPatch, Storage, WriteOp};
use crate::error::StorageError;
use crate::models::{
    DeadLetterEntry, EventType, IdempotencyRecord, IdempotencyScope, OutboxEvent, OutboxStatus,
    Task, UsageLedgerEntry, UsageStatus, UsageTotals, WebhookDelivery, WebhookEndpoint,
};

type IdempotencyKey = (String, String, IdempotencyScope);

#[derive(Debug, Clone, Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    usage: Vec<UsageLedgerEntry>,
    events: HashMap<Uuid, OutboxEvent>,
    /// Insertion order of events, the FIFO tiebreaker for equal timestamps
    event_order: Vec<Uuid>,
    endpoints: HashMap<Uuid, WebhookEndpoint>,
    deliveries: Vec<WebhookDelivery>,
    dead_letters: HashMap<Uuid, DeadLetterEntry>,
    dead_letter_order: Vec<Uuid>,
}

/// In-memory [`Storage`] implementation with all-or-nothing batch commits.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_endpoint_patch(endpoint: &mut WebhookEndpoint, patch: &EndpointPatch) {
    if let Some(ref url) = patch.url {
        endpoint.url = url.clone();
    }
    if let Some(ref events) = patch.events {
        endpoint.events = events.clone();
    }
    if let Some(status) = patch.status {
        endpoint.status = status;
    }
    if let Some(timeout_ms) = patch.timeout_ms {
        endpoint.timeout_ms = timeout_ms;
    }
    if let Some(max_retries) = patch.max_retries {
        endpoint.max_retries = max_retries;
    }
    if let Some((ref key_id, ref secret)) = patch.add_secret {
        endpoint.secrets.insert(key_id.clone(), secret.clone());
    }
    if let Some(ref key_id) = patch.active_key_id {
        endpoint.active_key_id = key_id.clone();
    }
    endpoint.updated_at = Utc::now();
}

/// Applies one operation to the staged state, or reports why it cannot.
fn apply_op(state: &mut State, op: &WriteOp) -> Result<(), StorageError> {
    match op {
        WriteOp::InsertTask(task) => {
            if state.tasks.contains_key(&task.task_id) {
                return Err(StorageError::UniqueViolation {
                    constraint: "tasks.task_id".to_string(),
                });
            }
            state.tasks.insert(task.task_id, task.clone());
            Ok(())
        }
        WriteOp::UpdateTask {
            task_id,
            expected_version,
            expected_status,
            patch,
        } => {
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or(StorageError::VersionConflict { task_id: *task_id })?;
            // Conditional write: (id, version, status) must all still match
            if task.version != *expected_version || task.status != *expected_status {
                return Err(StorageError::VersionConflict { task_id: *task_id });
            }
            patch.apply_to(task);
            Ok(())
        }
        WriteOp::InsertIdempotency(record) => {
            let key = (
                record.actor_id.clone(),
                record.idempotency_key.clone(),
                record.scope,
            );
            if state.idempotency.contains_key(&key) {
                return Err(StorageError::UniqueViolation {
                    constraint: "idempotency.actor_key_scope".to_string(),
                });
            }
            state.idempotency.insert(key, record.clone());
            Ok(())
        }
        WriteOp::AppendUsage(entry) => {
            state.usage.push(entry.clone());
            Ok(())
        }
        WriteOp::InsertOutboxEvent(event) => {
            if state.events.contains_key(&event.event_id) {
                return Err(StorageError::UniqueViolation {
                    constraint: "outbox_events.event_id".to_string(),
                });
            }
            state.events.insert(event.event_id, event.clone());
            state.event_order.push(event.event_id);
            Ok(())
        }
        WriteOp::UpdateOutboxEvent {
            event_id,
            status,
            retry_count,
        } => {
            let event = state
                .events
                .get_mut(event_id)
                .ok_or_else(|| StorageError::RowMissing {
                    entity: "outbox_event",
                    id: event_id.to_string(),
                })?;
            event.status = *status;
            if let Some(retry_count) = retry_count {
                event.retry_count = *retry_count;
            }
            event.updated_at = Utc::now();
            Ok(())
        }
        WriteOp::ResetOutboxEvent { event_id, at } => {
            let event = state
                .events
                .get_mut(event_id)
                .ok_or_else(|| StorageError::RowMissing {
                    entity: "outbox_event",
                    id: event_id.to_string(),
                })?;
            event.status = OutboxStatus::Pending;
            event.retry_count = 0;
            event.replayed_at = Some(*at);
            event.updated_at = *at;
            Ok(())
        }
        WriteOp::InsertDelivery(delivery) => {
            let duplicate = state.deliveries.iter().any(|d| {
                d.endpoint_id == delivery.endpoint_id
                    && d.event_id == delivery.event_id
                    && d.attempt == delivery.attempt
            });
            if duplicate {
                return Err(StorageError::UniqueViolation {
                    constraint: "webhook_deliveries.endpoint_event_attempt".to_string(),
                });
            }
            state.deliveries.push(delivery.clone());
            Ok(())
        }
        WriteOp::InsertEndpoint(endpoint) => {
            if state.endpoints.contains_key(&endpoint.endpoint_id) {
                return Err(StorageError::UniqueViolation {
                    constraint: "webhook_endpoints.endpoint_id".to_string(),
                });
            }
            state.endpoints.insert(endpoint.endpoint_id, endpoint.clone());
            Ok(())
        }
        WriteOp::UpdateEndpoint { endpoint_id, patch } => {
            let endpoint =
                state
                    .endpoints
                    .get_mut(endpoint_id)
                    .ok_or_else(|| StorageError::RowMissing {
                        entity: "webhook_endpoint",
                        id: endpoint_id.to_string(),
                    })?;
            apply_endpoint_patch(endpoint, patch);
            Ok(())
        }
        WriteOp::InsertDeadLetter(entry) => {
            if state.dead_letters.contains_key(&entry.entry_id) {
                return Err(StorageError::UniqueViolation {
                    constraint: "dead_letters.entry_id".to_string(),
                });
            }
            state.dead_letters.insert(entry.entry_id, entry.clone());
            state.dead_letter_order.push(entry.entry_id);
            Ok(())
        }
        WriteOp::MarkDeadLetterReplayed { entry_id, at } => {
            let entry =
                state
                    .dead_letters
                    .get_mut(entry_id)
                    .ok_or_else(|| StorageError::RowMissing {
                        entity: "dead_letter",
                        id: entry_id.to_string(),
                    })?;
            entry.replayed_at = Some(*at);
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StorageError> {
        Ok(self.inner.lock().tasks.get(&task_id).cloned())
    }

    async fn get_idempotency(
        &self,
        actor_id: &str,
        idempotency_key: &str,
        scope: IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, StorageError> {
        let key = (actor_id.to_string(), idempotency_key.to_string(), scope);
        Ok(self.inner.lock().idempotency.get(&key).cloned())
    }

    async fn sum_usage(&self, user_id: &str, period: &str) -> Result<UsageTotals, StorageError> {
        let state = self.inner.lock();
        let mut totals = UsageTotals::default();
        for entry in state
            .usage
            .iter()
            .filter(|e| e.user_id == user_id && e.period == period)
        {
            match entry.status {
                UsageStatus::Held => totals.held += entry.consume_unit,
                UsageStatus::Committed => totals.committed += entry.consume_unit,
                UsageStatus::Released => totals.released += entry.consume_unit,
            }
        }
        Ok(totals)
    }

    async fn list_task_usage(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<UsageLedgerEntry>, StorageError> {
        let state = self.inner.lock();
        Ok(state
            .usage
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<OutboxEvent>, StorageError> {
        Ok(self.inner.lock().events.get(&event_id).cloned())
    }

    async fn list_pending_events(
        &self,
        event_types: &[EventType],
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StorageError> {
        let state = self.inner.lock();
        let mut pending: Vec<OutboxEvent> = state
            .event_order
            .iter()
            .filter_map(|id| state.events.get(id))
            .filter(|e| e.status == OutboxStatus::Pending && event_types.contains(&e.event_type))
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_endpoint(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Option<WebhookEndpoint>, StorageError> {
        Ok(self.inner.lock().endpoints.get(&endpoint_id).cloned())
    }

    async fn list_endpoints(&self, user_id: &str) -> Result<Vec<WebhookEndpoint>, StorageError> {
        let state = self.inner.lock();
        let mut endpoints: Vec<WebhookEndpoint> = state
            .endpoints
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.created_at);
        Ok(endpoints)
    }

    async fn latest_delivery(
        &self,
        endpoint_id: Uuid,
        event_id: Uuid,
    ) -> Result<Option<WebhookDelivery>, StorageError> {
        let state = self.inner.lock();
        Ok(state
            .deliveries
            .iter()
            .filter(|d| d.endpoint_id == endpoint_id && d.event_id == event_id)
            .max_by_key(|d| d.attempt)
            .cloned())
    }

    async fn list_deliveries(
        &self,
        endpoint_id: Uuid,
        event_id: Uuid,
    ) -> Result<Vec<WebhookDelivery>, StorageError> {
        let state = self.inner.lock();
        let mut rows: Vec<WebhookDelivery> = state
            .deliveries
            .iter()
            .filter(|d| d.endpoint_id == endpoint_id && d.event_id == event_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.attempt);
        Ok(rows)
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StorageError> {
        let state = self.inner.lock();
        Ok(state
            .dead_letter_order
            .iter()
            .filter_map(|id| state.dead_letters.get(id))
            .filter(|e| e.replayed_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn apply(&self, batch: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut state = self.inner.lock();
        // Stage the whole batch on a copy; commit by replacement. Readers
        // never observe a partially applied batch.
        let mut staged = state.clone();
        for op in &batch {
            apply_op(&mut staged, op)?;
        }
        *state = staged;
        Ok(())
    }
}
