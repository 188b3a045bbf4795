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

//! Error types shared across the crate.
//!
//! Domain *outcomes* that callers branch on (version conflicts visible to the
//! HTTP layer, idempotency conflicts, invalid transitions) are not errors;
//! they are variants of [`crate::engine::TaskActionOutcome`]. The types here
//! cover infrastructure and configuration failures that cannot be expressed
//! as a business result.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the storage port.
///
/// `VersionConflict` and `UniqueViolation` are the two signals the optimistic
/// concurrency model is built on: a losing writer observes one of these,
/// re-reads, and retries or defers. Neither indicates data corruption.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A conditional update found zero rows matching the expected
    /// `(id, version, status)` tuple. Another writer won the race.
    #[error("optimistic version check failed for task {task_id}")]
    VersionConflict { task_id: Uuid },

    /// An insert violated a unique constraint. The constraint name tells the
    /// caller which race was lost (idempotency key, delivery attempt, ...).
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// An update targeted a row that does not exist.
    #[error("{entity} {id} not found")]
    RowMissing { entity: &'static str, id: String },

    /// The backend itself failed (connection loss, serialization, ...).
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Errors from the lifecycle engine that are not task-action outcomes.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The plans/subscriptions service could not answer a quota lookup.
    #[error("quota lookup failed: {0}")]
    QuotaUnavailable(String),

    #[error("failed to encode payload for hashing: {0}")]
    PayloadEncoding(String),
}

/// Errors from the dispatcher's poll cycle.
///
/// Per-endpoint delivery failures are not errors; they are recorded as
/// failed delivery rows and drive the retry schedule. This type covers
/// failures of the cycle itself.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to encode webhook envelope: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from webhook endpoint registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("webhook endpoint {endpoint_id} not found")]
    NotFound { endpoint_id: Uuid },

    #[error("webhook endpoint {endpoint_id} is deleted")]
    Deleted { endpoint_id: Uuid },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("failed to encode webhook envelope: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors from receiver-side signature verification.
///
/// Every variant is a rejection reason; none is retryable by the sender
/// without changing the request.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing or malformed header: {header}")]
    MalformedHeader { header: &'static str },

    #[error("timestamp {timestamp} is outside the {window_secs}s replay window")]
    TimestampOutsideWindow { timestamp: i64, window_secs: u64 },

    #[error("unknown signing key id: {key_id}")]
    UnknownKeyId { key_id: String },

    #[error("signature mismatch")]
    InvalidSignature,

    /// The delivery id was already accepted within the replay-cache TTL.
    #[error("replayed delivery id: {delivery_id}")]
    ReplayedDelivery { delivery_id: String },
}

/// Errors from the dead-letter replay tool.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Bulk replay at elevated concurrency was rejected by the fail-closed
    /// guard. No state was mutated.
    #[error(
        "bulk replay rejected: {matched} matched items at elevated concurrency \
         requires explicit bulk confirmation (threshold {threshold})"
    )]
    BulkReplayRejected { matched: usize, threshold: usize },

    /// A quarantined entry lacks the id its source requires for re-injection.
    #[error("dead-letter entry {entry_id} is missing its {field}")]
    MalformedEntry { entry_id: Uuid, field: &'static str },

    #[error("job injection failed: {0}")]
    Injection(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from environment-style configuration parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}
