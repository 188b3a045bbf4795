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

//! Domain model types.
//!
//! These are API-level types used by the engine, dispatcher, and replay tool.
//! Backend-specific storage models live behind the storage port and convert
//! to/from these at the boundary.

pub mod dead_letter;
pub mod delivery;
pub mod endpoint;
pub mod idempotency;
pub mod outbox;
pub mod task;
pub mod usage;

pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DeadLetterSource};
pub use delivery::{DeliveryStatus, FailureCode, WebhookDelivery};
pub use endpoint::{EndpointStatus, WebhookEndpoint};
pub use idempotency::{IdempotencyRecord, IdempotencyScope};
pub use outbox::{AggregateType, EventType, OutboxEvent, OutboxStatus};
pub use task::{MediaType, Task, TaskStatus};
pub use usage::{UsageLedgerEntry, UsageStatus, UsageTotals};
