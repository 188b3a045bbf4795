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

//! Task Lifecycle Engine.
//!
//! The sole producer of outbox events. Every mutating operation reads the
//! current task state, computes the new state, and writes back conditioned on
//! `(task_id, version, status)` all matching what was read; zero matches
//! means another writer won the race and the caller sees `VersionConflict`.
//! The task row, usage-ledger row, and outbox row touched by one transition
//! are committed in a single atomic batch.

pub mod quota;
pub mod state_machine;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, StorageError};
use crate::models::{
    EventType, IdempotencyRecord, IdempotencyScope, MediaType, OutboxEvent, Task, TaskStatus,
    UsageLedgerEntry, UsageStatus,
};
use crate::storage::{Storage, TaskPatch, WriteOp};

pub use quota::{FixedQuota, QuotaService};
pub use state_machine::{is_cancelable, is_transition_allowed, CANCELABLE};

/// Request body for task creation. Hashed for idempotency comparison, so the
/// field set is the identity of the request.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskInput {
    pub asset_id: String,
    pub media_type: MediaType,
    pub policy: String,
    /// Quota units this task holds; defaults to 1
    pub consume_unit: i64,
}

impl CreateTaskInput {
    pub fn new(
        asset_id: impl Into<String>,
        media_type: MediaType,
        policy: impl Into<String>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            media_type,
            policy: policy.into(),
            consume_unit: 1,
        }
    }
}

/// Optional payload carried by a status advance.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub progress: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub result_url: Option<String>,
}

/// Discriminated result of a lifecycle operation.
///
/// The HTTP layer maps these to status codes; callers branch on the variant
/// and the compiler enforces that every branch is handled. None of these is
/// an `Err`: infrastructure failures are, business rejections are not.
#[derive(Debug, Clone)]
pub enum TaskActionOutcome {
    /// Committed (or replayed from the idempotency table when `replayed`)
    Success { task: Task, replayed: bool },
    /// No such task
    NotFound,
    /// Task exists but is not owned by the acting user
    Forbidden,
    /// The supplied version is stale; re-read and retry
    VersionConflict { current_version: i64 },
    /// Current status differs from the transition's declared `from`
    StatusMismatch { actual: TaskStatus },
    /// The requested edge is not in the state machine
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    /// Idempotency key reused with a different payload
    IdempotencyConflict,
    /// Monthly quota consumed; surfaced synchronously, never retried
    QuotaExceeded { consumed: i64, quota: i64 },
}

/// The transactional task-lifecycle engine.
pub struct LifecycleEngine {
    storage: Arc<dyn Storage>,
    quota: Arc<dyn QuotaService>,
}

/// Billing period a timestamp falls into, `YYYY-MM`.
pub fn billing_period(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash of a create request payload.
fn create_payload_hash(input: &CreateTaskInput) -> Result<String, EngineError> {
    let encoded =
        serde_json::to_vec(input).map_err(|e| EngineError::PayloadEncoding(e.to_string()))?;
    Ok(sha256_hex(&encoded))
}

/// Hash of an action payload, `"{action}:{task_id}"`.
fn action_payload_hash(action: &str, task_id: Uuid) -> String {
    sha256_hex(format!("{action}:{task_id}").as_bytes())
}

impl LifecycleEngine {
    pub fn new(storage: Arc<dyn Storage>, quota: Arc<dyn QuotaService>) -> Self {
        Self { storage, quota }
    }

    /// Creates a task in `Queued` at version 1, holds quota units, and stages
    /// a `task.created` event, all in one transaction.
    ///
    /// Replaying the same `(actor, idempotency_key)` with an identical
    /// payload returns the original task with `replayed = true`; the same key
    /// with a different payload is an `IdempotencyConflict`.
    pub async fn create_task(
        &self,
        actor_id: &str,
        idempotency_key: &str,
        input: CreateTaskInput,
    ) -> Result<TaskActionOutcome, EngineError> {
        let payload_hash = create_payload_hash(&input)?;

        // One retry: losing the idempotency-insert race to a concurrent
        // request with the same key falls through to the replay path.
        for _ in 0..2 {
            if let Some(record) = self
                .storage
                .get_idempotency(actor_id, idempotency_key, IdempotencyScope::Create)
                .await?
            {
                return self.resolve_replay(&record, &payload_hash).await;
            }

            let now = Utc::now();
            let period = billing_period(now);
            let totals = self.storage.sum_usage(actor_id, &period).await?;
            let quota = self.quota.monthly_quota(actor_id).await?;
            if totals.consumed() >= quota {
                debug!(
                    actor_id,
                    consumed = totals.consumed(),
                    quota,
                    "task creation rejected: quota exceeded"
                );
                return Ok(TaskActionOutcome::QuotaExceeded {
                    consumed: totals.consumed(),
                    quota,
                });
            }

            let task = Task {
                task_id: Uuid::new_v4(),
                user_id: actor_id.to_string(),
                asset_id: input.asset_id.clone(),
                media_type: input.media_type,
                policy: input.policy.clone(),
                status: TaskStatus::Queued,
                progress: 0,
                version: 1,
                error_code: None,
                error_message: None,
                result_url: None,
                created_at: now,
                updated_at: now,
            };
            let usage = UsageLedgerEntry::for_task(
                actor_id,
                task.task_id,
                UsageStatus::Held,
                input.consume_unit,
                &period,
                now,
            );
            let event = OutboxEvent::for_task(
                EventType::TaskCreated,
                task.task_id,
                actor_id,
                serde_json::json!({
                    "taskId": task.task_id,
                    "assetId": task.asset_id,
                    "mediaType": task.media_type,
                    "policy": task.policy,
                    "status": task.status,
                }),
                now,
            );
            let record = IdempotencyRecord {
                actor_id: actor_id.to_string(),
                idempotency_key: idempotency_key.to_string(),
                scope: IdempotencyScope::Create,
                payload_hash: payload_hash.clone(),
                task_id: task.task_id,
                created_at: now,
            };

            match self
                .storage
                .apply(vec![
                    WriteOp::InsertTask(task.clone()),
                    WriteOp::AppendUsage(usage),
                    WriteOp::InsertOutboxEvent(event),
                    WriteOp::InsertIdempotency(record),
                ])
                .await
            {
                Ok(()) => {
                    info!(task_id = %task.task_id, actor_id, "task created");
                    return Ok(TaskActionOutcome::Success {
                        task,
                        replayed: false,
                    });
                }
                // A concurrent request with the same key committed first;
                // loop back and resolve against the stored record.
                Err(StorageError::UniqueViolation { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(TaskActionOutcome::IdempotencyConflict)
    }

    /// Advances a task along one edge of the state machine.
    ///
    /// Rejection checks run in a fixed order: existence, ownership, version,
    /// declared source status, edge membership. Reaching `Succeeded` commits
    /// the held units and stages `task.succeeded`; `Canceled` releases them
    /// and stages `task.canceled`; `Failed` records error fields and stages
    /// `task.failed`; the retry edge stages `task.retried`.
    pub async fn advance_status(
        &self,
        actor_id: &str,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        expected_version: i64,
        detail: TransitionDetail,
    ) -> Result<TaskActionOutcome, EngineError> {
        let Some(task) = self.storage.get_task(task_id).await? else {
            return Ok(TaskActionOutcome::NotFound);
        };
        if task.user_id != actor_id {
            return Ok(TaskActionOutcome::Forbidden);
        }
        if task.version != expected_version {
            return Ok(TaskActionOutcome::VersionConflict {
                current_version: task.version,
            });
        }
        if task.status != from {
            return Ok(TaskActionOutcome::StatusMismatch {
                actual: task.status,
            });
        }
        if !is_transition_allowed(from, to) {
            return Ok(TaskActionOutcome::InvalidTransition { from, to });
        }

        let now = Utc::now();
        let mut patch = TaskPatch {
            status: to,
            progress: detail.progress,
            error_code: detail.error_code.clone(),
            error_message: detail.error_message.clone(),
            result_url: detail.result_url.clone(),
            clear_error: from == TaskStatus::Failed && to == TaskStatus::Queued,
        };
        if to == TaskStatus::Succeeded {
            patch.progress = Some(100);
        }

        let mut ops = vec![WriteOp::UpdateTask {
            task_id,
            expected_version,
            expected_status: from,
            patch: patch.clone(),
        }];

        match to {
            TaskStatus::Succeeded => {
                ops.push(WriteOp::AppendUsage(
                    self.settlement_entry(&task, UsageStatus::Committed, now).await?,
                ));
                ops.push(WriteOp::InsertOutboxEvent(OutboxEvent::for_task(
                    EventType::TaskSucceeded,
                    task_id,
                    &task.user_id,
                    serde_json::json!({
                        "taskId": task_id,
                        "status": TaskStatus::Succeeded,
                        "progress": 100,
                        "resultUrl": detail.result_url,
                    }),
                    now,
                )));
            }
            TaskStatus::Canceled => {
                ops.push(WriteOp::AppendUsage(
                    self.settlement_entry(&task, UsageStatus::Released, now).await?,
                ));
                ops.push(WriteOp::InsertOutboxEvent(OutboxEvent::for_task(
                    EventType::TaskCanceled,
                    task_id,
                    &task.user_id,
                    serde_json::json!({
                        "taskId": task_id,
                        "status": TaskStatus::Canceled,
                    }),
                    now,
                )));
            }
            TaskStatus::Failed => {
                ops.push(WriteOp::InsertOutboxEvent(OutboxEvent::for_task(
                    EventType::TaskFailed,
                    task_id,
                    &task.user_id,
                    serde_json::json!({
                        "taskId": task_id,
                        "status": TaskStatus::Failed,
                        "errorCode": detail.error_code,
                        "errorMessage": detail.error_message,
                    }),
                    now,
                )));
            }
            TaskStatus::Queued if from == TaskStatus::Failed => {
                ops.push(WriteOp::InsertOutboxEvent(OutboxEvent::for_task(
                    EventType::TaskRetried,
                    task_id,
                    &task.user_id,
                    serde_json::json!({
                        "taskId": task_id,
                        "status": TaskStatus::Queued,
                    }),
                    now,
                )));
            }
            // Plain pipeline progress announces nothing
            _ => {}
        }

        match self.storage.apply(ops).await {
            Ok(()) => {
                let mut updated = task;
                patch.apply_to(&mut updated);
                debug!(task_id = %task_id, from = %from, to = %to, version = updated.version, "task advanced");
                Ok(TaskActionOutcome::Success {
                    task: updated,
                    replayed: false,
                })
            }
            Err(StorageError::VersionConflict { .. }) => {
                // Lost the race after our read; report the winner's version
                let current_version = self
                    .storage
                    .get_task(task_id)
                    .await?
                    .map(|t| t.version)
                    .unwrap_or(expected_version);
                Ok(TaskActionOutcome::VersionConflict { current_version })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancels a task. Legal only from `Queued`, `Preprocessing`, or
    /// `Detecting`; releases the held units and stages `task.canceled`.
    ///
    /// Idempotent under `(actor, idempotency_key)` with payload hash
    /// `"cancel:{task_id}"`.
    pub async fn cancel(
        &self,
        actor_id: &str,
        idempotency_key: &str,
        task_id: Uuid,
    ) -> Result<TaskActionOutcome, EngineError> {
        self.run_action(
            actor_id,
            idempotency_key,
            task_id,
            IdempotencyScope::Cancel,
        )
        .await
    }

    /// Retries a failed task: clears error fields, re-enters `Queued`, and
    /// stages `task.retried`. Legal only from `Failed`.
    pub async fn retry(
        &self,
        actor_id: &str,
        idempotency_key: &str,
        task_id: Uuid,
    ) -> Result<TaskActionOutcome, EngineError> {
        self.run_action(actor_id, idempotency_key, task_id, IdempotencyScope::Retry)
            .await
    }

    async fn run_action(
        &self,
        actor_id: &str,
        idempotency_key: &str,
        task_id: Uuid,
        scope: IdempotencyScope,
    ) -> Result<TaskActionOutcome, EngineError> {
        let payload_hash = action_payload_hash(scope.as_str(), task_id);

        for _ in 0..2 {
            if let Some(record) = self
                .storage
                .get_idempotency(actor_id, idempotency_key, scope)
                .await?
            {
                return self.resolve_replay(&record, &payload_hash).await;
            }

            let Some(task) = self.storage.get_task(task_id).await? else {
                return Ok(TaskActionOutcome::NotFound);
            };
            if task.user_id != actor_id {
                return Ok(TaskActionOutcome::Forbidden);
            }

            let now = Utc::now();
            let (patch, extra_ops) = match scope {
                IdempotencyScope::Cancel => {
                    if !is_cancelable(task.status) {
                        return Ok(TaskActionOutcome::InvalidTransition {
                            from: task.status,
                            to: TaskStatus::Canceled,
                        });
                    }
                    let usage = self
                        .settlement_entry(&task, UsageStatus::Released, now)
                        .await?;
                    let event = OutboxEvent::for_task(
                        EventType::TaskCanceled,
                        task_id,
                        &task.user_id,
                        serde_json::json!({
                            "taskId": task_id,
                            "status": TaskStatus::Canceled,
                        }),
                        now,
                    );
                    (
                        TaskPatch::status_only(TaskStatus::Canceled),
                        vec![WriteOp::AppendUsage(usage), WriteOp::InsertOutboxEvent(event)],
                    )
                }
                IdempotencyScope::Retry => {
                    if task.status != TaskStatus::Failed {
                        return Ok(TaskActionOutcome::InvalidTransition {
                            from: task.status,
                            to: TaskStatus::Queued,
                        });
                    }
                    let event = OutboxEvent::for_task(
                        EventType::TaskRetried,
                        task_id,
                        &task.user_id,
                        serde_json::json!({
                            "taskId": task_id,
                            "status": TaskStatus::Queued,
                        }),
                        now,
                    );
                    let patch = TaskPatch {
                        status: TaskStatus::Queued,
                        progress: Some(0),
                        error_code: None,
                        error_message: None,
                        result_url: None,
                        clear_error: true,
                    };
                    (patch, vec![WriteOp::InsertOutboxEvent(event)])
                }
                IdempotencyScope::Create => unreachable!("create is not an action"),
            };

            let record = IdempotencyRecord {
                actor_id: actor_id.to_string(),
                idempotency_key: idempotency_key.to_string(),
                scope,
                payload_hash: payload_hash.clone(),
                task_id,
                created_at: now,
            };

            let mut ops = vec![WriteOp::UpdateTask {
                task_id,
                expected_version: task.version,
                expected_status: task.status,
                patch: patch.clone(),
            }];
            ops.extend(extra_ops);
            ops.push(WriteOp::InsertIdempotency(record));

            match self.storage.apply(ops).await {
                Ok(()) => {
                    let mut updated = task;
                    patch.apply_to(&mut updated);
                    info!(task_id = %task_id, action = %scope, "task action committed");
                    return Ok(TaskActionOutcome::Success {
                        task: updated,
                        replayed: false,
                    });
                }
                Err(StorageError::VersionConflict { .. }) => {
                    let current_version = self
                        .storage
                        .get_task(task_id)
                        .await?
                        .map(|t| t.version)
                        .unwrap_or(task.version);
                    warn!(task_id = %task_id, action = %scope, "task action lost optimistic race");
                    return Ok(TaskActionOutcome::VersionConflict { current_version });
                }
                // Concurrent identical action committed its idempotency
                // record first; resolve against it on the next pass.
                Err(StorageError::UniqueViolation { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(TaskActionOutcome::IdempotencyConflict)
    }

    /// Resolves a replayed request against its stored idempotency record.
    async fn resolve_replay(
        &self,
        record: &IdempotencyRecord,
        payload_hash: &str,
    ) -> Result<TaskActionOutcome, EngineError> {
        if record.payload_hash != payload_hash {
            return Ok(TaskActionOutcome::IdempotencyConflict);
        }
        let task = self
            .storage
            .get_task(record.task_id)
            .await?
            .ok_or(StorageError::RowMissing {
                entity: "task",
                id: record.task_id.to_string(),
            })?;
        Ok(TaskActionOutcome::Success {
            task,
            replayed: true,
        })
    }

    /// Builds the ledger row that settles a task's hold (commit or release),
    /// using the units and period of the original HELD entry.
    async fn settlement_entry(
        &self,
        task: &Task,
        status: UsageStatus,
        now: DateTime<Utc>,
    ) -> Result<UsageLedgerEntry, EngineError> {
        let held = self
            .storage
            .list_task_usage(task.task_id)
            .await?
            .into_iter()
            .find(|e| e.status == UsageStatus::Held);
        let (units, period) = match held {
            Some(entry) => (entry.consume_unit, entry.period),
            // A task without a hold should not exist; settle 1 unit in the
            // current period rather than dropping the settlement.
            None => (1, billing_period(now)),
        };
        Ok(UsageLedgerEntry::for_task(
            &task.user_id,
            task.task_id,
            status,
            units,
            period,
            now,
        ))
    }
}
