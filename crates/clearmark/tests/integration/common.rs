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

//! Shared test fixtures: scripted transport, endpoint seeding, event seeding.

use std::collections::{HashMap, VecDeque};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use clearmark::dispatcher::{DeliveryOutcome, WebhookTransport};
use clearmark::models::{
    DeadLetterEntry, DeadLetterReason, EndpointStatus, EventType, FailureCode, OutboxEvent,
    OutboxStatus, WebhookEndpoint,
};
use clearmark::storage::{MemoryStorage, Storage, WriteOp};

static LOG_INIT: Once = Once::new();

/// Installs the test log subscriber once per process. `RUST_LOG` overrides
/// the default filter.
pub fn init_test_logging() {
    LOG_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("clearmark=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One request the scripted transport saw.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Transport that answers from a script and records every request.
/// An exhausted script answers 200.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<DeliveryOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    pub fn failing_with(status: u16) -> DeliveryOutcome {
        DeliveryOutcome::Failed {
            code: FailureCode::HttpNon2xx,
            response_status: Some(status),
            detail: format!("receiver answered {status}"),
        }
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn deliver(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &str,
        _timeout: Duration,
    ) -> DeliveryOutcome {
        self.requests.lock().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.clone(),
            body: body.to_string(),
        });
        self.script.lock().pop_front().unwrap_or(DeliveryOutcome::Delivered {
            response_status: 200,
        })
    }
}

/// Inserts an active endpoint with a known secret under key id `k1`.
pub async fn seed_endpoint(
    storage: &MemoryStorage,
    user_id: &str,
    events: Vec<EventType>,
    max_retries: u32,
    secret: &str,
) -> WebhookEndpoint {
    let now = Utc::now();
    let endpoint = WebhookEndpoint {
        endpoint_id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        url: "https://receiver.example/hooks".to_string(),
        events,
        status: EndpointStatus::Active,
        timeout_ms: 1_000,
        max_retries,
        active_key_id: "k1".to_string(),
        secrets: HashMap::from([("k1".to_string(), secret.to_string())]),
        created_at: now,
        updated_at: now,
    };
    storage
        .apply(vec![WriteOp::InsertEndpoint(endpoint.clone())])
        .await
        .expect("seed endpoint");
    endpoint
}

/// Stages a pending event for an existing task.
pub async fn seed_event(
    storage: &MemoryStorage,
    event_type: EventType,
    task_id: Uuid,
    user_id: &str,
) -> OutboxEvent {
    let event = OutboxEvent::for_task(
        event_type,
        task_id,
        user_id,
        serde_json::json!({"taskId": task_id}),
        Utc::now(),
    );
    storage
        .apply(vec![WriteOp::InsertOutboxEvent(event.clone())])
        .await
        .expect("seed event");
    event
}

/// Stages a dead event plus its quarantine entry, as the dispatcher leaves
/// them after exhaustion.
pub async fn seed_dead_event(storage: &MemoryStorage, user_id: &str) -> (Uuid, Uuid) {
    let event = seed_event(storage, EventType::TaskSucceeded, Uuid::new_v4(), user_id).await;
    let entry = DeadLetterEntry::for_outbox_event(
        event.event_id,
        Some(event.aggregate_id),
        DeadLetterReason::OutboxAttemptsExhausted,
        7,
        Some("DISPATCH_HTTP_NON_2XX".to_string()),
        Utc::now(),
    );
    storage
        .apply(vec![
            WriteOp::UpdateOutboxEvent {
                event_id: event.event_id,
                status: OutboxStatus::Dead,
                retry_count: None,
            },
            WriteOp::InsertDeadLetter(entry.clone()),
        ])
        .await
        .expect("seed dead event");
    (event.event_id, entry.entry_id)
}

/// A dispatcher config with the backoff collapsed to zero, so retries are
/// due on the next cycle.
pub fn immediate_retry_config() -> clearmark::DispatcherConfig {
    clearmark::DispatcherConfig::default().with_retry_schedule_ms(vec![0])
}
