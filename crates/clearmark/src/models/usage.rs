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

//! Usage Ledger Model
//!
//! Append-only quota bookkeeping. Creating a task holds units; reaching
//! `Succeeded` commits them; cancellation releases them. At most one active
//! accounting state exists per (user, task, source): held units are later
//! committed or released, never both. The billing reconciliation job reads
//! this ledger but does not participate in delivery correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accounting state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageStatus {
    /// Units reserved at task creation
    Held,
    /// Task succeeded; held units become billable
    Committed,
    /// Task canceled; held units returned to the quota
    Released,
}

impl UsageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatus::Held => "HELD",
            UsageStatus::Committed => "COMMITTED",
            UsageStatus::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One quota-affecting row for a task (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    /// Unique row identifier
    pub entry_id: Uuid,
    /// User whose quota this entry affects
    pub user_id: String,
    /// Task that caused the entry
    pub task_id: Uuid,
    /// Originating subsystem, `"task"` for lifecycle entries
    pub source: String,
    /// Accounting state
    pub status: UsageStatus,
    /// Units this entry holds/commits/releases
    pub consume_unit: i64,
    /// Billing period the entry counts toward, `YYYY-MM`
    pub period: String,
    /// When the entry was appended
    pub created_at: DateTime<Utc>,
}

impl UsageLedgerEntry {
    /// Creates a lifecycle ledger entry for a task.
    pub fn for_task(
        user_id: impl Into<String>,
        task_id: Uuid,
        status: UsageStatus,
        consume_unit: i64,
        period: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            user_id: user_id.into(),
            task_id,
            source: "task".to_string(),
            status,
            consume_unit,
            period: period.into(),
            created_at: now,
        }
    }
}

/// Aggregated ledger sums for one user and billing period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub held: i64,
    pub committed: i64,
    pub released: i64,
}

impl UsageTotals {
    /// Units counted against the monthly quota: committed plus outstanding
    /// holds.
    pub fn consumed(&self) -> i64 {
        self.committed + (self.held - self.released)
    }
}
