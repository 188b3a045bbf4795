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

//! Lifecycle engine integration tests: idempotency, optimistic concurrency,
//! quota accounting, and outbox atomicity.

use std::sync::Arc;

use uuid::Uuid;

use clearmark::dispatcher::SUPPORTED_EVENT_TYPES;
use clearmark::engine::{
    CreateTaskInput, FixedQuota, LifecycleEngine, TaskActionOutcome, TransitionDetail,
};
use clearmark::models::{EventType, MediaType, Task, TaskStatus, UsageStatus};
use clearmark::storage::{MemoryStorage, Storage};

use crate::common::init_test_logging;

fn engine_with_quota(storage: Arc<MemoryStorage>, quota: i64) -> LifecycleEngine {
    LifecycleEngine::new(storage, Arc::new(FixedQuota::new(quota)))
}

fn input(asset_id: &str) -> CreateTaskInput {
    CreateTaskInput::new(asset_id, MediaType::Image, "standard")
}

async fn create(engine: &LifecycleEngine, actor: &str, key: &str, asset: &str) -> Task {
    match engine.create_task(actor, key, input(asset)).await.unwrap() {
        TaskActionOutcome::Success { task, replayed } => {
            assert!(!replayed);
            task
        }
        other => panic!("expected success, got {other:?}"),
    }
}

async fn event_types(storage: &MemoryStorage) -> Vec<EventType> {
    storage
        .list_pending_events(&SUPPORTED_EVENT_TYPES, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn test_create_is_idempotent_under_the_same_key() {
    init_test_logging();
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage.clone(), 100);

    let task = create(&engine, "tenant-1", "K1", "asset-1").await;
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.version, 1);

    // Identical payload replays the original task
    match engine
        .create_task("tenant-1", "K1", input("asset-1"))
        .await
        .unwrap()
    {
        TaskActionOutcome::Success { task: replay, replayed } => {
            assert!(replayed);
            assert_eq!(replay.task_id, task.task_id);
        }
        other => panic!("expected replay, got {other:?}"),
    }

    // Same key, different payload: conflict, not a second task
    let conflict = engine
        .create_task("tenant-1", "K1", input("asset-OTHER"))
        .await
        .unwrap();
    assert!(matches!(conflict, TaskActionOutcome::IdempotencyConflict));

    // Exactly one task.created event was staged
    assert_eq!(event_types(&storage).await, vec![EventType::TaskCreated]);
}

#[tokio::test]
async fn test_create_holds_quota_units() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage.clone(), 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let usage = storage.list_task_usage(task.task_id).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status, UsageStatus::Held);
    assert_eq!(usage[0].consume_unit, 1);
}

#[tokio::test]
async fn test_quota_exhaustion_rejects_synchronously() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage, 1);

    create(&engine, "tenant-1", "K1", "asset-1").await;
    let outcome = engine
        .create_task("tenant-1", "K2", input("asset-2"))
        .await
        .unwrap();
    match outcome {
        TaskActionOutcome::QuotaExceeded { consumed, quota } => {
            assert_eq!(consumed, 1);
            assert_eq!(quota, 1);
        }
        other => panic!("expected quota rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_quota_is_per_tenant() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage, 1);
    create(&engine, "tenant-1", "K1", "asset-1").await;
    // Another tenant's ledger is untouched
    create(&engine, "tenant-2", "K1", "asset-1").await;
}

#[tokio::test]
async fn test_pipeline_advance_bumps_version_by_one() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage.clone(), 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let chain = [
        (TaskStatus::Queued, TaskStatus::Preprocessing),
        (TaskStatus::Preprocessing, TaskStatus::Detecting),
        (TaskStatus::Detecting, TaskStatus::Inpainting),
        (TaskStatus::Inpainting, TaskStatus::Packaging),
    ];
    let mut version = task.version;
    for (from, to) in chain {
        match engine
            .advance_status(
                "tenant-1",
                task.task_id,
                from,
                to,
                version,
                TransitionDetail::default(),
            )
            .await
            .unwrap()
        {
            TaskActionOutcome::Success { task, .. } => {
                assert_eq!(task.status, to);
                assert_eq!(task.version, version + 1);
                version = task.version;
            }
            other => panic!("{from} -> {to} rejected: {other:?}"),
        }
    }

    // Final transition commits the hold and stages task.succeeded
    let detail = TransitionDetail {
        result_url: Some("https://cdn.example/results/asset-1.png".to_string()),
        ..Default::default()
    };
    match engine
        .advance_status(
            "tenant-1",
            task.task_id,
            TaskStatus::Packaging,
            TaskStatus::Succeeded,
            version,
            detail,
        )
        .await
        .unwrap()
    {
        TaskActionOutcome::Success { task: done, .. } => {
            assert_eq!(done.status, TaskStatus::Succeeded);
            assert_eq!(done.progress, 100);
            assert!(done.result_url.is_some());
        }
        other => panic!("expected success, got {other:?}"),
    }

    let usage = storage.list_task_usage(task.task_id).await.unwrap();
    let statuses: Vec<UsageStatus> = usage.iter().map(|u| u.status).collect();
    assert_eq!(statuses, vec![UsageStatus::Held, UsageStatus::Committed]);

    let events = event_types(&storage).await;
    assert_eq!(
        events,
        vec![EventType::TaskCreated, EventType::TaskSucceeded]
    );
}

#[tokio::test]
async fn test_stale_version_leaves_state_unchanged() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage.clone(), 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let outcome = engine
        .advance_status(
            "tenant-1",
            task.task_id,
            TaskStatus::Queued,
            TaskStatus::Preprocessing,
            99,
            TransitionDetail::default(),
        )
        .await
        .unwrap();
    match outcome {
        TaskActionOutcome::VersionConflict { current_version } => {
            assert_eq!(current_version, 1)
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    let stored = storage.get_task(task.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_status_mismatch_is_distinct_from_version_conflict() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage, 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let outcome = engine
        .advance_status(
            "tenant-1",
            task.task_id,
            TaskStatus::Preprocessing,
            TaskStatus::Detecting,
            1,
            TransitionDetail::default(),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        TaskActionOutcome::StatusMismatch {
            actual: TaskStatus::Queued
        }
    ));
}

#[tokio::test]
async fn test_backward_transition_always_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage, 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let outcome = engine
        .advance_status(
            "tenant-1",
            task.task_id,
            TaskStatus::Queued,
            TaskStatus::Uploaded,
            1,
            TransitionDetail::default(),
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        TaskActionOutcome::InvalidTransition { .. }
    ));
}

#[tokio::test]
async fn test_ownership_and_existence_checks() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage, 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let foreign = engine
        .advance_status(
            "tenant-2",
            task.task_id,
            TaskStatus::Queued,
            TaskStatus::Preprocessing,
            1,
            TransitionDetail::default(),
        )
        .await
        .unwrap();
    assert!(matches!(foreign, TaskActionOutcome::Forbidden));

    let missing = engine
        .advance_status(
            "tenant-1",
            Uuid::new_v4(),
            TaskStatus::Queued,
            TaskStatus::Preprocessing,
            1,
            TransitionDetail::default(),
        )
        .await
        .unwrap();
    assert!(matches!(missing, TaskActionOutcome::NotFound));
}

#[tokio::test]
async fn test_cancel_releases_units_and_replays() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage.clone(), 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    match engine.cancel("tenant-1", "C1", task.task_id).await.unwrap() {
        TaskActionOutcome::Success { task: canceled, replayed } => {
            assert!(!replayed);
            assert_eq!(canceled.status, TaskStatus::Canceled);
        }
        other => panic!("expected cancel success, got {other:?}"),
    }

    let usage = storage.list_task_usage(task.task_id).await.unwrap();
    let statuses: Vec<UsageStatus> = usage.iter().map(|u| u.status).collect();
    assert_eq!(statuses, vec![UsageStatus::Held, UsageStatus::Released]);

    // Same key replays the stored outcome
    match engine.cancel("tenant-1", "C1", task.task_id).await.unwrap() {
        TaskActionOutcome::Success { replayed, .. } => assert!(replayed),
        other => panic!("expected replay, got {other:?}"),
    }

    // A fresh key finds the task no longer cancelable
    let again = engine.cancel("tenant-1", "C2", task.task_id).await.unwrap();
    assert!(matches!(again, TaskActionOutcome::InvalidTransition { .. }));

    assert_eq!(
        event_types(&storage).await,
        vec![EventType::TaskCreated, EventType::TaskCanceled]
    );
}

#[tokio::test]
async fn test_retry_clears_error_state() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_quota(storage.clone(), 100);
    let task = create(&engine, "tenant-1", "K1", "asset-1").await;

    let detail = TransitionDetail {
        error_code: Some("PIPELINE_CRASH".to_string()),
        error_message: Some("detector ran out of memory".to_string()),
        ..Default::default()
    };
    let failed = match engine
        .advance_status(
            "tenant-1",
            task.task_id,
            TaskStatus::Queued,
            TaskStatus::Failed,
            1,
            detail,
        )
        .await
        .unwrap()
    {
        TaskActionOutcome::Success { task, .. } => task,
        other => panic!("expected failure transition, got {other:?}"),
    };
    assert_eq!(failed.error_code.as_deref(), Some("PIPELINE_CRASH"));

    match engine.retry("tenant-1", "R1", task.task_id).await.unwrap() {
        TaskActionOutcome::Success { task: retried, .. } => {
            assert_eq!(retried.status, TaskStatus::Queued);
            assert_eq!(retried.progress, 0);
            assert!(retried.error_code.is_none());
            assert!(retried.error_message.is_none());
        }
        other => panic!("expected retry success, got {other:?}"),
    }

    // Retry from a non-failed status is rejected
    let again = engine.retry("tenant-1", "R2", task.task_id).await.unwrap();
    assert!(matches!(again, TaskActionOutcome::InvalidTransition { .. }));

    assert_eq!(
        event_types(&storage).await,
        vec![
            EventType::TaskCreated,
            EventType::TaskFailed,
            EventType::TaskRetried
        ]
    );
}
