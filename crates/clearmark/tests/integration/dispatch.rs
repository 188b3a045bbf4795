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

//! Dispatch loop integration tests: per-endpoint fan-out, status
//! aggregation, retry deferral, exhaustion, and end-to-end signature
//! verification against an independent receiver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use clearmark::dispatcher::{DeliveryOutcome, SignatureVerifier, WebhookTransport};
use clearmark::models::{
    DeadLetterReason, DeliveryStatus, EndpointStatus, EventType, FailureCode, OutboxStatus,
    Task, TaskStatus, WebhookEndpoint,
};
use clearmark::storage::{MemoryStorage, Storage, WriteOp};
use clearmark::{DispatcherConfig, OutboxDispatcher};

use crate::common::{
    immediate_retry_config, init_test_logging, seed_endpoint, seed_event, ScriptedTransport,
};

async fn seed_task(storage: &MemoryStorage, user_id: &str) -> Task {
    let now = Utc::now();
    let task = Task {
        task_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        asset_id: "asset-1".to_string(),
        media_type: clearmark::models::MediaType::Image,
        policy: "standard".to_string(),
        status: TaskStatus::Succeeded,
        progress: 100,
        version: 7,
        error_code: None,
        error_message: None,
        result_url: Some("https://cdn.example/r.png".to_string()),
        created_at: now,
        updated_at: now,
    };
    storage
        .apply(vec![WriteOp::InsertTask(task.clone())])
        .await
        .unwrap();
    task
}

fn dispatcher(
    storage: Arc<MemoryStorage>,
    transport: Arc<dyn WebhookTransport>,
    config: DispatcherConfig,
) -> OutboxDispatcher {
    OutboxDispatcher::new(storage, transport, config)
}

#[tokio::test]
async fn test_success_publishes_event() {
    init_test_logging();
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let endpoint =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::always_ok());
    let d = dispatcher(storage.clone(), transport.clone(), DispatcherConfig::default());
    let summary = d.run_cycle().await.unwrap();

    assert_eq!(summary.scanned, 1);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.delivery_successes, 1);

    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Published);
    assert_eq!(stored.retry_count, 0);

    let rows = storage
        .list_deliveries(endpoint.endpoint_id, event.event_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeliveryStatus::Success);
    assert_eq!(rows[0].attempt, 1);
    assert!(rows[0].request_signed);
}

#[tokio::test]
async fn test_no_subscribers_is_published_not_failed() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    // Subscribed to a different event type only
    seed_endpoint(&storage, "tenant-1", vec![EventType::TaskFailed], 3, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let d = dispatcher(
        storage.clone(),
        Arc::new(ScriptedTransport::always_ok()),
        DispatcherConfig::default(),
    );
    let summary = d.run_cycle().await.unwrap();

    assert_eq!(summary.published, 1);
    assert_eq!(summary.deliveries_created, 0);
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Published);
}

#[tokio::test]
async fn test_missing_aggregate_is_dead_and_quarantined() {
    let storage = Arc::new(MemoryStorage::new());
    // Event references a task that was never inserted
    let event = seed_event(&storage, EventType::TaskSucceeded, Uuid::new_v4(), "tenant-1").await;

    let d = dispatcher(
        storage.clone(),
        Arc::new(ScriptedTransport::always_ok()),
        DispatcherConfig::default(),
    );
    let summary = d.run_cycle().await.unwrap();

    assert_eq!(summary.dead, 1);
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Dead);

    let quarantined = storage.list_dead_letters(10).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason, DeadLetterReason::NonRetryable);
    assert_eq!(quarantined[0].event_id, Some(event.event_id));
}

#[tokio::test]
async fn test_failure_defers_until_backoff_elapses() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let endpoint =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::failing_with(500),
    ]));
    // Default schedule: first retry due 60s after the failure
    let d = dispatcher(storage.clone(), transport, DispatcherConfig::default());

    let first = d.run_cycle().await.unwrap();
    assert_eq!(first.delivery_failures, 1);
    assert_eq!(first.pending, 1);
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.retry_count, 1);

    // Immediately after, the pair is deferred: no new attempt, no count bump
    let second = d.run_cycle().await.unwrap();
    assert_eq!(second.deliveries_created, 0);
    assert_eq!(second.pending, 1);
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    let rows = storage
        .list_deliveries(endpoint.endpoint_id, event.event_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_attempts_are_strictly_increasing() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let endpoint =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 5, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::failing_with(500),
        ScriptedTransport::failing_with(503),
    ]));
    let d = dispatcher(storage.clone(), transport, immediate_retry_config());

    d.run_cycle().await.unwrap();
    d.run_cycle().await.unwrap();
    let third = d.run_cycle().await.unwrap();
    assert_eq!(third.delivery_successes, 1);

    let rows = storage
        .list_deliveries(endpoint.endpoint_id, event.event_id)
        .await
        .unwrap();
    let attempts: Vec<i32> = rows.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let mut ids: Vec<Uuid> = rows.iter().map(|r| r.delivery_id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Published);
    // Two cycles saw a failure; the success-only cycle added nothing
    assert_eq!(stored.retry_count, 2);
}

#[tokio::test]
async fn test_exhaustion_quarantines_the_event() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    // No retries beyond the first attempt
    seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 0, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::failing_with(500),
    ]));
    let d = dispatcher(storage.clone(), transport, DispatcherConfig::default());
    let summary = d.run_cycle().await.unwrap();

    assert_eq!(summary.dead, 1);
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Dead);

    let quarantined = storage.list_dead_letters(10).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(
        quarantined[0].reason,
        DeadLetterReason::OutboxAttemptsExhausted
    );
    assert_eq!(quarantined[0].attempts, 1);
}

#[tokio::test]
async fn test_missing_secret_fails_without_a_network_call() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let now = Utc::now();
    let endpoint = WebhookEndpoint {
        endpoint_id: Uuid::new_v4(),
        user_id: "tenant-1".to_string(),
        url: "https://receiver.example/hooks".to_string(),
        events: vec![EventType::TaskSucceeded],
        status: EndpointStatus::Active,
        timeout_ms: 1_000,
        max_retries: 3,
        active_key_id: "k1".to_string(),
        // Key declared but no secret registered for it
        secrets: HashMap::new(),
        created_at: now,
        updated_at: now,
    };
    storage
        .apply(vec![WriteOp::InsertEndpoint(endpoint.clone())])
        .await
        .unwrap();
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::always_ok());
    let d = dispatcher(storage.clone(), transport.clone(), DispatcherConfig::default());
    let summary = d.run_cycle().await.unwrap();

    // Configuration error: exhausted on the first attempt, never retried
    assert_eq!(summary.dead, 1);
    assert!(transport.requests.lock().is_empty());
    let rows = storage
        .list_deliveries(endpoint.endpoint_id, event.event_id)
        .await
        .unwrap();
    assert_eq!(rows[0].failure_code, Some(FailureCode::SecretMissing));
    // Nothing signed this request; the row says so
    assert!(!rows[0].request_signed);
}

#[tokio::test]
async fn test_slow_endpoint_does_not_block_another() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let healthy =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    let flaky =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    // Endpoint iteration is creation-ordered: healthy succeeds, flaky fails
    let transport = Arc::new(ScriptedTransport::new(vec![
        DeliveryOutcome::Delivered { response_status: 200 },
        ScriptedTransport::failing_with(503),
    ]));
    let d = dispatcher(storage.clone(), transport, immediate_retry_config());

    let first = d.run_cycle().await.unwrap();
    assert_eq!(first.delivery_successes, 1);
    assert_eq!(first.delivery_failures, 1);
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);

    // Next cycle: healthy is already delivered, flaky retries and succeeds
    let second = d.run_cycle().await.unwrap();
    assert_eq!(second.published, 1);
    assert_eq!(
        storage
            .list_deliveries(healthy.endpoint_id, event.event_id)
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        storage
            .list_deliveries(flaky.endpoint_id, event.event_id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_receiver_verifies_the_signature_independently() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::always_ok());
    let d = dispatcher(storage, transport.clone(), DispatcherConfig::default());
    d.run_cycle().await.unwrap();

    let requests = transport.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let verifier =
        SignatureVerifier::new(HashMap::from([("k1".to_string(), "s3cr3t".to_string())]));
    let verified = verifier
        .verify(&request.headers, &request.body, Utc::now())
        .expect("independent verification must pass");
    assert_eq!(verified.event_type, "task.succeeded");

    // The same X-Webhook-Id is rejected on exact replay
    let replayed = verifier.verify(&request.headers, &request.body, Utc::now());
    assert!(replayed.is_err());

    // A tampered body no longer matches the signature
    let fresh =
        SignatureVerifier::new(HashMap::from([("k1".to_string(), "s3cr3t".to_string())]));
    let tampered = request.body.replace("task.succeeded", "task.failed");
    assert!(fresh.verify(&request.headers, &tampered, Utc::now()).is_err());
}

/// Receiver that applies its side effect before answering, fails the first
/// call with 503, and deduplicates retries on the event id.
struct FlakyReceiver {
    side_effects: Mutex<HashMap<String, u32>>,
    calls: Mutex<u32>,
}

impl FlakyReceiver {
    fn new() -> Self {
        Self {
            side_effects: Mutex::new(HashMap::new()),
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl WebhookTransport for FlakyReceiver {
    async fn deliver(
        &self,
        _url: &str,
        _headers: &HashMap<String, String>,
        body: &str,
        _timeout: Duration,
    ) -> DeliveryOutcome {
        *self.calls.lock() += 1;
        let envelope: serde_json::Value = serde_json::from_str(body).unwrap();
        let event_id = envelope["eventId"].as_str().unwrap().to_string();

        let mut effects = self.side_effects.lock();
        if effects.contains_key(&event_id) {
            // Already processed this logical event: acknowledge, skip the work
            return DeliveryOutcome::Delivered {
                response_status: 200,
            };
        }
        effects.insert(event_id, 1);
        // Side effect applied, then the response is lost
        DeliveryOutcome::Failed {
            code: FailureCode::HttpNon2xx,
            response_status: Some(503),
            detail: "receiver crashed after committing".to_string(),
        }
    }
}

#[tokio::test]
async fn test_retried_event_applies_receiver_side_effect_exactly_once() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let endpoint =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let receiver = Arc::new(FlakyReceiver::new());
    let d = dispatcher(storage.clone(), receiver.clone(), immediate_retry_config());

    let first = d.run_cycle().await.unwrap();
    assert_eq!(first.delivery_failures, 1);
    let second = d.run_cycle().await.unwrap();
    assert_eq!(second.delivery_successes, 1);

    // Attempt 1 failed, attempt 2 succeeded, the side effect ran once
    let rows = storage
        .list_deliveries(endpoint.endpoint_id, event.event_id)
        .await
        .unwrap();
    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert_eq!(rows[1].status, DeliveryStatus::Success);
    assert_eq!(*receiver.calls.lock(), 2);
    assert_eq!(receiver.side_effects.lock().len(), 1);
}

#[tokio::test]
async fn test_paused_endpoints_are_skipped() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    let endpoint =
        seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    storage
        .apply(vec![WriteOp::UpdateEndpoint {
            endpoint_id: endpoint.endpoint_id,
            patch: clearmark::storage::EndpointPatch {
                status: Some(EndpointStatus::Paused),
                ..Default::default()
            },
        }])
        .await
        .unwrap();
    let event = seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let transport = Arc::new(ScriptedTransport::always_ok());
    let d = dispatcher(storage.clone(), transport.clone(), DispatcherConfig::default());
    let summary = d.run_cycle().await.unwrap();

    // No active subscriber left: published, nothing delivered
    assert_eq!(summary.published, 1);
    assert!(transport.requests.lock().is_empty());
    let stored = storage.get_event(event.event_id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Published);
}

#[tokio::test]
async fn test_attached_monitor_sees_delivery_attempts() {
    let storage = Arc::new(MemoryStorage::new());
    let task = seed_task(&storage, "tenant-1").await;
    seed_endpoint(&storage, "tenant-1", vec![EventType::TaskSucceeded], 3, "s3cr3t").await;
    seed_event(&storage, EventType::TaskSucceeded, task.task_id, "tenant-1").await;

    let monitor = Arc::new(clearmark::alerts::DeliveryMonitor::new(
        clearmark::config::AlertConfig {
            min_success_rate: 0.9,
            max_retry_rate: 0.5,
            min_samples: 1,
            window: Duration::from_secs(300),
        },
    ));
    let transport = Arc::new(ScriptedTransport::new(vec![
        ScriptedTransport::failing_with(500),
    ]));
    let d = OutboxDispatcher::new(storage, transport, DispatcherConfig::default())
        .with_monitor(monitor.clone());
    d.run_cycle().await.unwrap();

    let alerts = monitor.evaluate(Utc::now());
    assert!(matches!(
        alerts.as_slice(),
        [clearmark::alerts::Alert::SuccessRateBelowThreshold { samples: 1, .. }]
    ));
}
