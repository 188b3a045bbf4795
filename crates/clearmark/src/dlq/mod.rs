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

//! Guarded dead-letter replay.
//!
//! The only recovery route out of quarantine. A replay run scans a bounded
//! window, filters, and re-injects each match: outbox events go back to
//! `PENDING` with a zeroed retry count, processing jobs are handed to the
//! [`JobInjector`] port. Two independent guards protect against operator
//! error: the concurrency hard cap, and the bulk-reject threshold at
//! elevated concurrency. An ambiguous bulk operation aborts with zero
//! mutations; partial application is never an outcome of a rejected run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ReplayConfig;
use crate::error::ReplayError;
use crate::models::{DeadLetterEntry, DeadLetterSource};
use crate::storage::{Storage, WriteOp};

/// Replay concurrency cap without the elevated flag.
pub const BASE_CONCURRENCY_CAP: usize = 10;

/// Replay concurrency cap with `DLQ_ALLOW_HIGH_CONCURRENCY`.
pub const ELEVATED_CONCURRENCY_CAP: usize = 20;

/// Matched-item count at which an elevated-concurrency run requires the
/// explicit bulk confirmation flag.
pub const BULK_REJECT_THRESHOLD: usize = 100;

/// Hands a quarantined processing job back to the worker orchestrator.
/// The orchestrator itself is an external system.
#[async_trait]
pub trait JobInjector: Send + Sync {
    async fn inject(&self, entry: &DeadLetterEntry) -> Result<(), ReplayError>;
}

/// Per-invocation match criteria; every set field must match.
#[derive(Debug, Clone, Default)]
pub struct ReplayFilter {
    pub job_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    pub source: Option<DeadLetterSource>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ReplayFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        if let Some(job_id) = self.job_id {
            if entry.job_id != Some(job_id) {
                return false;
            }
        }
        if let Some(task_id) = self.task_id {
            if entry.task_id != Some(task_id) {
                return false;
            }
        }
        if let Some(event_id) = self.event_id {
            if entry.event_id != Some(event_id) {
                return false;
            }
        }
        if let Some(source) = self.source {
            if entry.source != source {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if entry.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if entry.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Operational summary of one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub scanned: usize,
    pub matched: usize,
    pub replayed: usize,
    pub failed: usize,
    pub dry_run: bool,
    /// The concurrency the run actually used, after clamping
    pub concurrency: usize,
}

/// Effective concurrency after the hard cap, never below 1.
pub fn effective_concurrency(requested: usize, allow_high: bool) -> usize {
    let cap = if allow_high {
        ELEVATED_CONCURRENCY_CAP
    } else {
        BASE_CONCURRENCY_CAP
    };
    requested.clamp(1, cap)
}

/// The dead-letter replay tool.
pub struct ReplayTool {
    storage: Arc<dyn Storage>,
    injector: Arc<dyn JobInjector>,
    config: ReplayConfig,
}

impl ReplayTool {
    pub fn new(
        storage: Arc<dyn Storage>,
        injector: Arc<dyn JobInjector>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            storage,
            injector,
            config,
        }
    }

    /// Runs one guarded replay pass.
    ///
    /// Guard order matters: the bulk-reject check runs before any mutation,
    /// so a rejected run leaves storage byte-for-byte unchanged.
    pub async fn replay(&self, filter: &ReplayFilter) -> Result<ReplaySummary, ReplayError> {
        let entries = self.storage.list_dead_letters(self.config.max_scan).await?;
        let scanned = entries.len();

        let matched: Vec<DeadLetterEntry> = entries
            .into_iter()
            .filter(|e| self.config.source.map_or(true, |s| e.source == s))
            .filter(|e| filter.matches(e))
            .collect();

        let concurrency =
            effective_concurrency(self.config.concurrency, self.config.allow_high_concurrency);

        if concurrency > BASE_CONCURRENCY_CAP
            && matched.len() >= BULK_REJECT_THRESHOLD
            && !self.config.allow_bulk_replay
        {
            warn!(
                matched = matched.len(),
                threshold = BULK_REJECT_THRESHOLD,
                concurrency,
                "bulk replay at elevated concurrency rejected; no state was mutated"
            );
            return Err(ReplayError::BulkReplayRejected {
                matched: matched.len(),
                threshold: BULK_REJECT_THRESHOLD,
            });
        }

        let mut summary = ReplaySummary {
            scanned,
            matched: matched.len(),
            dry_run: self.config.dry_run,
            concurrency,
            ..Default::default()
        };

        if self.config.dry_run {
            for entry in &matched {
                info!(
                    entry_id = %entry.entry_id,
                    source = %entry.source,
                    reason = %entry.reason,
                    attempts = entry.attempts,
                    "dry run: would replay"
                );
            }
            return Ok(summary);
        }

        let results: Vec<Result<(), ReplayError>> = stream::iter(
            matched.into_iter().take(self.config.max_replay),
        )
        .map(|entry| async move { self.replay_one(entry).await })
        .buffer_unordered(concurrency)
        .collect()
        .await;

        for result in results {
            match result {
                Ok(()) => summary.replayed += 1,
                Err(e) => {
                    warn!("replay of one entry failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            scanned = summary.scanned,
            matched = summary.matched,
            replayed = summary.replayed,
            failed = summary.failed,
            "replay run complete"
        );
        Ok(summary)
    }

    async fn replay_one(&self, entry: DeadLetterEntry) -> Result<(), ReplayError> {
        let now = Utc::now();
        match entry.source {
            DeadLetterSource::OutboxDispatch => {
                let event_id = entry.event_id.ok_or(ReplayError::MalformedEntry {
                    entry_id: entry.entry_id,
                    field: "event_id",
                })?;
                // Reset and mark replayed atomically; a re-run of the tool
                // will not see this entry again. The reset records the replay
                // epoch, so exhausted delivery history no longer counts
                // against the retry budget.
                self.storage
                    .apply(vec![
                        WriteOp::ResetOutboxEvent { event_id, at: now },
                        WriteOp::MarkDeadLetterReplayed {
                            entry_id: entry.entry_id,
                            at: now,
                        },
                    ])
                    .await?;
                info!(entry_id = %entry.entry_id, event_id = %event_id, "outbox event reset to pending");
            }
            DeadLetterSource::TaskProgress => {
                self.injector.inject(&entry).await?;
                self.storage
                    .apply(vec![WriteOp::MarkDeadLetterReplayed {
                        entry_id: entry.entry_id,
                        at: now,
                    }])
                    .await?;
                info!(entry_id = %entry.entry_id, "follow-up processing job injected");
            }
        }
        Ok(())
    }
}
