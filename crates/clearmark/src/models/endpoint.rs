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

//! Webhook Endpoint Model
//!
//! Per-tenant webhook subscription: destination URL, subscribed event types,
//! retry budget, timeout, and signing keys. Key rotation keeps multiple
//! signing keys valid simultaneously, with exactly one marked active for new
//! signatures.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::outbox::EventType;

/// Minimum enforced delivery timeout, regardless of configuration.
pub const MIN_TIMEOUT_MS: u64 = 1_000;

/// Subscription status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointStatus {
    /// Receives deliveries
    Active,
    /// Temporarily excluded from dispatch; subscription data retained
    Paused,
    /// Soft-deleted; never dispatched to, kept for the audit trail
    Deleted,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Active => "ACTIVE",
            EndpointStatus::Paused => "PAUSED",
            EndpointStatus::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A webhook subscription (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Unique endpoint identifier
    pub endpoint_id: Uuid,
    /// Owning tenant; only this tenant's events are delivered here
    pub user_id: String,
    /// Destination URL for POST deliveries
    pub url: String,
    /// Event types this endpoint is subscribed to
    pub events: Vec<EventType>,
    /// Subscription status
    pub status: EndpointStatus,
    /// Per-delivery HTTP timeout in milliseconds (floor [`MIN_TIMEOUT_MS`])
    pub timeout_ms: u64,
    /// Retry budget: attempts beyond the first, per event
    pub max_retries: u32,
    /// Key id used to sign new deliveries
    pub active_key_id: String,
    /// All currently valid signing secrets, by key id
    pub secrets: HashMap<String, String>,
    /// When the endpoint was registered
    pub created_at: DateTime<Utc>,
    /// When the endpoint was last modified
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Returns true if the endpoint is subscribed to the given event type.
    pub fn is_subscribed(&self, event_type: EventType) -> bool {
        self.events.contains(&event_type)
    }

    /// The secret for the currently active key id, if present.
    ///
    /// A missing secret for the declared active key is a configuration error
    /// (`DISPATCH_SECRET_MISSING`), not a transient fault.
    pub fn active_secret(&self) -> Option<&str> {
        self.secrets.get(&self.active_key_id).map(String::as_str)
    }

    /// The secret registered under an arbitrary key id (receiver-side lookup
    /// during rotation windows).
    pub fn secret_for(&self, key_id: &str) -> Option<&str> {
        self.secrets.get(key_id).map(String::as_str)
    }

    /// Effective delivery timeout with the floor applied.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(MIN_TIMEOUT_MS))
    }
}
