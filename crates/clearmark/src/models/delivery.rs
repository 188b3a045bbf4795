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

//! Webhook Delivery Model
//!
//! Append-only record of every delivery attempt per (event, endpoint) pair.
//! Serves as both the audit trail and the state the dispatcher consults to
//! decide the next retry. Rows are never mutated after insert; the only race
//! that matters is the unique constraint on `(endpoint_id, event_id, attempt)`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified failure cause of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    /// Receiver answered with a non-2xx status
    HttpNon2xx,
    /// The request exceeded the endpoint's timeout
    Timeout,
    /// Connection-level failure (DNS, refused, reset)
    NetworkError,
    /// No secret registered for the endpoint's active key id; a configuration
    /// error, exhausted on first attempt rather than retried
    SecretMissing,
    /// Sandbox short-circuit for endpoint verification deliveries
    SimulatedDispatchFailure,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::HttpNon2xx => "DISPATCH_HTTP_NON_2XX",
            FailureCode::Timeout => "DISPATCH_TIMEOUT",
            FailureCode::NetworkError => "DISPATCH_NETWORK_ERROR",
            FailureCode::SecretMissing => "DISPATCH_SECRET_MISSING",
            FailureCode::SimulatedDispatchFailure => "SIMULATED_DISPATCH_FAILURE",
        }
    }

    /// Whether the dispatcher may retry after this failure.
    ///
    /// Configuration errors are not transient; retrying would fail the same
    /// way until an operator intervenes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureCode::HttpNon2xx | FailureCode::Timeout | FailureCode::NetworkError
        )
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One delivery attempt (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Unique per attempt; sent as `X-Webhook-Id`. Receivers dedupe on this,
    /// not on the event id: each attempt is a distinct HTTP call for the same
    /// logical event.
    pub delivery_id: Uuid,
    /// The logical event being delivered
    pub event_id: Uuid,
    /// Destination endpoint
    pub endpoint_id: Uuid,
    /// 1-based attempt number; unique with (endpoint_id, event_id)
    pub attempt: i32,
    /// Attempt outcome
    pub status: DeliveryStatus,
    /// Failure classification, set only on failure
    pub failure_code: Option<FailureCode>,
    /// Headers sent with the request, for audit
    pub request_headers: HashMap<String, String>,
    /// SHA-256 hex of the request body
    pub payload_sha256: String,
    /// Whether the request carried a `v1` signature header. False only when
    /// no secret was available to sign with (the attempt never left the
    /// process); verification is the receiver's side of the contract.
    pub request_signed: bool,
    /// HTTP status the receiver answered with, if any response arrived
    pub response_status: Option<u16>,
    /// When the attempt was made; retry due times are computed from this
    pub created_at: DateTime<Utc>,
}
