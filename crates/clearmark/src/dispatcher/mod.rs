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

//! Outbox dispatch loop.
//!
//! Polls the outbox on a fixed interval and drives each pending event toward
//! `Published` or `Dead`. Each cycle scans the oldest pending events first,
//! resolves the event's aggregate, fans out to every active subscribed
//! endpoint, and aggregates the per-endpoint outcomes back onto the event.
//! The loop is single-threaded per process but safe to run in parallel
//! across processes: simultaneous attempt races land on the delivery row's
//! unique constraint, and the loser treats the collision as a deferral.

pub mod retry;
pub mod signing;
pub mod transport;
pub mod verify;

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::DeliveryMonitor;
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::models::{
    AggregateType, DeadLetterEntry, DeadLetterReason, DeliveryStatus, EndpointStatus, EventType,
    FailureCode, OutboxEvent, OutboxStatus, WebhookDelivery, WebhookEndpoint,
};
use crate::storage::{Storage, WriteOp};

pub use retry::{backoff_delay, decide, RetryDecision, DEFAULT_RETRY_SCHEDULE_MS};
pub use transport::{DeliveryOutcome, HttpTransport, WebhookTransport};
pub use verify::SignatureVerifier;

/// Event types the dispatch loop picks up. `endpoint.test` is synthetic and
/// delivered inline by the registry, never through the loop.
pub const SUPPORTED_EVENT_TYPES: [EventType; 5] = [
    EventType::TaskCreated,
    EventType::TaskSucceeded,
    EventType::TaskFailed,
    EventType::TaskCanceled,
    EventType::TaskRetried,
];

/// Operational summary of one poll cycle, consumed by logging and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub scanned: usize,
    pub published: usize,
    pub pending: usize,
    pub dead: usize,
    pub deliveries_created: usize,
    pub delivery_successes: usize,
    pub delivery_failures: usize,
}

/// Result of one delivery attempt, after the row is recorded.
enum AttemptResult {
    Success,
    Failed { code: FailureCode, attempt: i32 },
    /// A concurrent worker recorded this attempt first; treated as deferred
    LostRace,
}

/// The outbox dispatcher.
pub struct OutboxDispatcher {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn WebhookTransport>,
    config: DispatcherConfig,
    monitor: Option<Arc<DeliveryMonitor>>,
    shutdown: Arc<Notify>,
}

impl OutboxDispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn WebhookTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            config,
            monitor: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Attaches a delivery-health monitor. Every recorded attempt feeds the
    /// rolling window and each cycle evaluates it.
    pub fn with_monitor(mut self, monitor: Arc<DeliveryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Handle used to stop [`run`](Self::run) from another task.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs poll cycles until the shutdown handle is notified. A failed
    /// cycle is logged and the loop keeps going; the next cycle re-reads
    /// everything from storage.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(summary) if summary.scanned > 0 => {
                            info!(
                                scanned = summary.scanned,
                                published = summary.published,
                                pending = summary.pending,
                                dead = summary.dead,
                                deliveries = summary.deliveries_created,
                                "dispatch cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("dispatch cycle failed: {e}"),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("outbox dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// Processes one batch of pending events and returns the cycle summary.
    pub async fn run_cycle(&self) -> Result<CycleSummary, DispatchError> {
        let mut summary = CycleSummary::default();
        let events = self
            .storage
            .list_pending_events(&SUPPORTED_EVENT_TYPES, self.config.batch_size)
            .await?;
        summary.scanned = events.len();

        for event in &events {
            self.process_event(event, &mut summary).await?;
        }

        if let Some(monitor) = &self.monitor {
            monitor.evaluate(Utc::now());
        }

        Ok(summary)
    }

    async fn process_event(
        &self,
        event: &OutboxEvent,
        summary: &mut CycleSummary,
    ) -> Result<(), DispatchError> {
        // Data-integrity check: an event whose aggregate is gone can never
        // deliver meaningfully. Dead immediately, logged, never dropped.
        if event.aggregate_type == AggregateType::Task
            && self.storage.get_task(event.aggregate_id).await?.is_none()
        {
            warn!(
                event_id = %event.event_id,
                aggregate_id = %event.aggregate_id,
                "outbox event references a missing task; marking dead"
            );
            let entry = DeadLetterEntry::for_outbox_event(
                event.event_id,
                Some(event.aggregate_id),
                DeadLetterReason::NonRetryable,
                event.retry_count,
                Some("aggregate row missing".to_string()),
                Utc::now(),
            );
            self.storage
                .apply(vec![
                    WriteOp::UpdateOutboxEvent {
                        event_id: event.event_id,
                        status: OutboxStatus::Dead,
                        retry_count: None,
                    },
                    WriteOp::InsertDeadLetter(entry),
                ])
                .await?;
            summary.dead += 1;
            counter!("dispatcher_events_dead_total").increment(1);
            return Ok(());
        }

        let endpoints: Vec<WebhookEndpoint> = self
            .storage
            .list_endpoints(&event.user_id)
            .await?
            .into_iter()
            .filter(|ep| ep.status == EndpointStatus::Active && ep.is_subscribed(event.event_type))
            .collect();

        // No subscribers is success, not failure
        if endpoints.is_empty() {
            self.storage
                .apply(vec![WriteOp::UpdateOutboxEvent {
                    event_id: event.event_id,
                    status: OutboxStatus::Published,
                    retry_count: None,
                }])
                .await?;
            summary.published += 1;
            return Ok(());
        }

        let mut any_eligible = false;
        let mut any_exhausted = false;
        let mut failed_this_cycle = false;
        let mut exhausted_attempts = 0;
        let mut last_error: Option<String> = None;

        for endpoint in &endpoints {
            let latest = self
                .storage
                .latest_delivery(endpoint.endpoint_id, event.event_id)
                .await?;
            // Failed rows from before a replay reset are a previous life of
            // the event: attempt numbering continues above them, the retry
            // budget does not. Successes stay terminal across replays.
            let (current, attempt_base) = match event.replayed_at {
                Some(epoch) => {
                    let base = self
                        .storage
                        .list_deliveries(endpoint.endpoint_id, event.event_id)
                        .await?
                        .iter()
                        .filter(|row| row.created_at < epoch)
                        .map(|row| row.attempt)
                        .max()
                        .unwrap_or(0);
                    let current = latest.filter(|row| {
                        row.created_at >= epoch || row.status == DeliveryStatus::Success
                    });
                    (current, base)
                }
                None => (latest, 0),
            };
            let decision = decide(
                current.as_ref(),
                attempt_base,
                endpoint.max_retries,
                &self.config.retry_schedule_ms,
                Utc::now(),
            );

            match decision {
                RetryDecision::AlreadyDelivered => {}
                RetryDecision::Deferred { due_at } => {
                    debug!(
                        event_id = %event.event_id,
                        endpoint_id = %endpoint.endpoint_id,
                        due_at = %due_at,
                        "delivery deferred until backoff elapses"
                    );
                    any_eligible = true;
                }
                RetryDecision::Exhausted => {
                    any_exhausted = true;
                    if let Some(row) = current.as_ref() {
                        exhausted_attempts = exhausted_attempts.max(row.attempt);
                        last_error = row.failure_code.map(|c| c.as_str().to_string());
                    }
                }
                RetryDecision::Attempt { attempt } => {
                    match self.attempt_delivery(event, endpoint, attempt).await? {
                        AttemptResult::Success => {
                            summary.deliveries_created += 1;
                            summary.delivery_successes += 1;
                        }
                        AttemptResult::Failed { code, attempt } => {
                            summary.deliveries_created += 1;
                            summary.delivery_failures += 1;
                            failed_this_cycle = true;
                            let spent = !code.is_retryable()
                                || attempt - attempt_base >= endpoint.max_retries as i32 + 1;
                            if spent {
                                any_exhausted = true;
                                exhausted_attempts = exhausted_attempts.max(attempt);
                                last_error = Some(code.as_str().to_string());
                            } else {
                                any_eligible = true;
                            }
                        }
                        AttemptResult::LostRace => {
                            any_eligible = true;
                        }
                    }
                }
            }
        }

        // Aggregate per-endpoint outcomes onto the event. Any endpoint still
        // in its retry window keeps the event pending; exhaustion with no
        // eligible endpoint left means dead; otherwise everything delivered.
        let new_status = if any_eligible {
            OutboxStatus::Pending
        } else if any_exhausted {
            OutboxStatus::Dead
        } else {
            OutboxStatus::Published
        };

        // Success-only cycles do not inflate the retry count
        let retry_count = failed_this_cycle.then(|| event.retry_count + 1);

        let mut ops = Vec::new();
        if new_status != OutboxStatus::Pending || retry_count.is_some() {
            ops.push(WriteOp::UpdateOutboxEvent {
                event_id: event.event_id,
                status: new_status,
                retry_count,
            });
        }
        if new_status == OutboxStatus::Dead {
            warn!(
                event_id = %event.event_id,
                attempts = exhausted_attempts,
                "event exhausted every endpoint's retry budget; quarantined"
            );
            ops.push(WriteOp::InsertDeadLetter(DeadLetterEntry::for_outbox_event(
                event.event_id,
                (event.aggregate_type == AggregateType::Task).then_some(event.aggregate_id),
                DeadLetterReason::OutboxAttemptsExhausted,
                exhausted_attempts,
                last_error,
                Utc::now(),
            )));
        }
        if !ops.is_empty() {
            self.storage.apply(ops).await?;
        }

        match new_status {
            OutboxStatus::Published => {
                summary.published += 1;
                counter!("dispatcher_events_published_total").increment(1);
            }
            OutboxStatus::Dead => {
                summary.dead += 1;
                counter!("dispatcher_events_dead_total").increment(1);
            }
            _ => summary.pending += 1,
        }
        Ok(())
    }

    /// Makes one delivery attempt and records its row. The unique constraint
    /// on `(endpoint, event, attempt)` resolves concurrent-worker races; the
    /// loser reports [`AttemptResult::LostRace`] and nothing else happens.
    async fn attempt_delivery(
        &self,
        event: &OutboxEvent,
        endpoint: &WebhookEndpoint,
        attempt: i32,
    ) -> Result<AttemptResult, DispatchError> {
        let now = Utc::now();
        let delivery_id = Uuid::new_v4();

        let Some(secret) = endpoint.active_secret() else {
            // Configuration error: no HTTP call, exhausted on first attempt
            warn!(
                endpoint_id = %endpoint.endpoint_id,
                key_id = %endpoint.active_key_id,
                "no secret registered for the active key id"
            );
            let row = WebhookDelivery {
                delivery_id,
                event_id: event.event_id,
                endpoint_id: endpoint.endpoint_id,
                attempt,
                status: DeliveryStatus::Failed,
                failure_code: Some(FailureCode::SecretMissing),
                request_headers: Default::default(),
                payload_sha256: String::new(),
                request_signed: false,
                response_status: None,
                created_at: now,
            };
            return self.record_attempt(row).await;
        };

        let request = signing::build_request(
            event,
            delivery_id,
            &endpoint.active_key_id,
            secret,
            now,
        )?;

        let outcome = self
            .transport
            .deliver(
                &endpoint.url,
                &request.headers,
                &request.body,
                endpoint.timeout(),
            )
            .await;

        let row = match &outcome {
            DeliveryOutcome::Delivered { response_status } => WebhookDelivery {
                delivery_id,
                event_id: event.event_id,
                endpoint_id: endpoint.endpoint_id,
                attempt,
                status: DeliveryStatus::Success,
                failure_code: None,
                request_headers: request.headers.clone(),
                payload_sha256: request.payload_sha256.clone(),
                request_signed: true,
                response_status: Some(*response_status),
                created_at: now,
            },
            DeliveryOutcome::Failed {
                code,
                response_status,
                detail,
            } => {
                debug!(
                    event_id = %event.event_id,
                    endpoint_id = %endpoint.endpoint_id,
                    attempt,
                    code = %code,
                    "delivery attempt failed: {detail}"
                );
                WebhookDelivery {
                    delivery_id,
                    event_id: event.event_id,
                    endpoint_id: endpoint.endpoint_id,
                    attempt,
                    status: DeliveryStatus::Failed,
                    failure_code: Some(*code),
                    request_headers: request.headers.clone(),
                    payload_sha256: request.payload_sha256.clone(),
                    request_signed: true,
                    response_status: *response_status,
                    created_at: now,
                }
            }
        };

        self.record_attempt(row).await
    }

    async fn record_attempt(&self, row: WebhookDelivery) -> Result<AttemptResult, DispatchError> {
        let (status, code, attempt) = (row.status, row.failure_code, row.attempt);
        match self.storage.apply(vec![WriteOp::InsertDelivery(row)]).await {
            Ok(()) => {
                if let Some(monitor) = &self.monitor {
                    monitor.record_attempt(status == DeliveryStatus::Success, attempt > 1, Utc::now());
                }
                match status {
                    DeliveryStatus::Success => {
                        counter!("webhook_deliveries_total", "status" => "success").increment(1);
                        Ok(AttemptResult::Success)
                    }
                    DeliveryStatus::Failed => {
                        counter!("webhook_deliveries_total", "status" => "failed").increment(1);
                        Ok(AttemptResult::Failed {
                            // Failed rows always carry a code
                            code: code.unwrap_or(FailureCode::NetworkError),
                            attempt,
                        })
                    }
                }
            }
            Err(crate::error::StorageError::UniqueViolation { .. }) => {
                debug!(attempt, "delivery attempt already recorded by a concurrent worker");
                Ok(AttemptResult::LostRace)
            }
            Err(e) => Err(e.into()),
        }
    }
}
