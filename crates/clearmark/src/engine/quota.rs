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

//! Quota lookup port.
//!
//! The plans/subscriptions service is an external collaborator; the engine
//! only needs the monthly unit quota for a user. A fixed implementation is
//! provided for tests and single-tenant deployments.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::EngineError;

/// Read-only plan quota lookup.
#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Monthly unit quota for a user's current plan.
    async fn monthly_quota(&self, user_id: &str) -> Result<i64, EngineError>;
}

/// Static quota table with a default, for tests and development.
pub struct FixedQuota {
    default_quota: i64,
    overrides: HashMap<String, i64>,
}

impl FixedQuota {
    pub fn new(default_quota: i64) -> Self {
        Self {
            default_quota,
            overrides: HashMap::new(),
        }
    }

    /// Sets a per-user quota override.
    pub fn with_user(mut self, user_id: impl Into<String>, quota: i64) -> Self {
        self.overrides.insert(user_id.into(), quota);
        self
    }
}

#[async_trait]
impl QuotaService for FixedQuota {
    async fn monthly_quota(&self, user_id: &str) -> Result<i64, EngineError> {
        Ok(self
            .overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.default_quota))
    }
}
