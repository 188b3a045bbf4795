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

//! # Clearmark
//!
//! Transactional task lifecycle and webhook event delivery core for the
//! Clearmark media platform.
//!
//! The crate has two halves joined by the transactional outbox:
//!
//! - The **lifecycle engine** owns the task state machine (upload through
//!   watermark-removal pipeline stages to a terminal status), idempotent
//!   mutations, quota holds on the usage ledger, and optimistic concurrency
//!   on every write. Each committed transition stages its domain event in
//!   the same atomic batch.
//! - The **dispatcher** drains the outbox on a poll interval, signs each
//!   delivery with the endpoint's active HMAC key, retries on a backoff
//!   schedule, and quarantines exhausted events in the dead-letter queue.
//!   The guarded replay tool is the only way back out.
//!
//! Persistence is a port ([`storage::Storage`]); the in-memory backend ships
//! here and mimics real transaction semantics, so every piece of business
//! logic is written once and tested without a database.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use clearmark::engine::{CreateTaskInput, FixedQuota, LifecycleEngine, TaskActionOutcome};
//! use clearmark::models::MediaType;
//! use clearmark::storage::MemoryStorage;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryStorage::new());
//! let engine = LifecycleEngine::new(storage, Arc::new(FixedQuota::new(100)));
//!
//! let outcome = engine
//!     .create_task(
//!         "tenant-1",
//!         "idem-key-1",
//!         CreateTaskInput::new("asset-42", MediaType::Image, "standard"),
//!     )
//!     .await?;
//!
//! match outcome {
//!     TaskActionOutcome::Success { task, .. } => println!("queued {}", task.task_id),
//!     other => println!("rejected: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod models;
pub mod registry;
pub mod storage;

pub use alerts::{Alert, DeliveryMonitor};
pub use config::{AlertConfig, DispatcherConfig, ReplayConfig};
pub use dispatcher::{
    CycleSummary, HttpTransport, OutboxDispatcher, SignatureVerifier, WebhookTransport,
};
pub use dlq::{JobInjector, ReplayFilter, ReplaySummary, ReplayTool};
pub use engine::{CreateTaskInput, LifecycleEngine, QuotaService, TaskActionOutcome};
pub use error::{
    ConfigError, DispatchError, EngineError, RegistryError, ReplayError, SignatureError,
    StorageError,
};
pub use registry::{EndpointRegistry, RegisterEndpointInput};
pub use storage::{MemoryStorage, Storage};
