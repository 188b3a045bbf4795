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

//! Retry decision logic.
//!
//! Pure functions over the latest delivery row for an (event, endpoint)
//! pair. No clock, no I/O; the caller supplies `now`, which keeps the whole
//! schedule unit-testable without real time.

use chrono::{DateTime, Duration, Utc};

use crate::models::WebhookDelivery;

/// Default backoff schedule in milliseconds: 1m, 2m, 5m, 15m, 30m, 1h.
/// Attempts beyond the table reuse the last entry.
pub const DEFAULT_RETRY_SCHEDULE_MS: [u64; 6] =
    [60_000, 120_000, 300_000, 900_000, 1_800_000, 3_600_000];

/// What the dispatcher should do for one (event, endpoint) pair this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the delivery attempt with this 1-based number now
    Attempt { attempt: i32 },
    /// The latest attempt succeeded; nothing left to do for this endpoint
    AlreadyDelivered,
    /// Not yet due; leave the event pending without burning an attempt
    Deferred { due_at: DateTime<Utc> },
    /// Retry budget spent; this pair counts toward marking the event dead
    Exhausted,
}

/// Backoff delay before the attempt after `attempt` (1-based), from the
/// schedule table. Attempts past the end of the table flatten to the last
/// entry.
pub fn backoff_delay(schedule_ms: &[u64], attempt: i32) -> Duration {
    let index = (attempt.max(1) as usize - 1).min(schedule_ms.len().saturating_sub(1));
    Duration::milliseconds(schedule_ms[index] as i64)
}

/// Decides the next action from the latest prior delivery row.
///
/// `attempt_base` is the highest attempt number burned before the event's
/// replay epoch (0 when the event was never replayed): attempt numbering
/// continues above it, the budget does not. `max_retries` is the retry budget
/// beyond the first attempt, so a pair is exhausted once
/// `attempt - attempt_base >= max_retries + 1`.
pub fn decide(
    latest: Option<&WebhookDelivery>,
    attempt_base: i32,
    max_retries: u32,
    schedule_ms: &[u64],
    now: DateTime<Utc>,
) -> RetryDecision {
    let Some(latest) = latest else {
        return RetryDecision::Attempt {
            attempt: attempt_base + 1,
        };
    };

    if latest.status == crate::models::DeliveryStatus::Success {
        return RetryDecision::AlreadyDelivered;
    }

    // Non-retryable failures spend the whole budget at once
    if latest
        .failure_code
        .map(|code| !code.is_retryable())
        .unwrap_or(false)
    {
        return RetryDecision::Exhausted;
    }

    let attempts_used = latest.attempt - attempt_base;
    if attempts_used >= max_retries as i32 + 1 {
        return RetryDecision::Exhausted;
    }

    let due_at = latest.created_at + backoff_delay(schedule_ms, attempts_used);
    if now < due_at {
        return RetryDecision::Deferred { due_at };
    }

    RetryDecision::Attempt {
        attempt: latest.attempt + 1,
    }
}
