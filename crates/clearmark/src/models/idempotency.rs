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

//! Idempotency Record Model
//!
//! Keyed by `(actor, idempotency_key, scope)`. A replay with the same key and
//! the same payload hash returns the stored outcome unchanged; the same key
//! with a different payload hash is a conflict and is never silently accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which operation family an idempotency record protects.
///
/// Each action has its own table scope so a `cancel` and a `retry` issued
/// with the same client key do not collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyScope {
    Create,
    Cancel,
    Retry,
}

impl IdempotencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyScope::Create => "create",
            IdempotencyScope::Cancel => "cancel",
            IdempotencyScope::Retry => "retry",
        }
    }
}

impl std::fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored idempotency decision (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Actor that issued the original request
    pub actor_id: String,
    /// Client-supplied idempotency key
    pub idempotency_key: String,
    /// Operation family this record protects
    pub scope: IdempotencyScope,
    /// SHA-256 hex of the original request payload. For actions this is the
    /// hash of `"{action}:{task_id}"`.
    pub payload_hash: String,
    /// The task the original request resolved to
    pub task_id: Uuid,
    /// When the original request committed
    pub created_at: DateTime<Utc>,
}
