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

//! Task Model
//!
//! One processing job submitted by a user: an image or video asset flowing
//! through the watermark-removal pipeline. The task row is the aggregate root
//! of the lifecycle engine; every committed mutation bumps `version`, and any
//! write must supply the version it read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a processing task.
///
/// Transitions form a directed graph with a single backward edge
/// (`Failed -> Queued`, the retry path); see
/// [`crate::engine::state_machine`] for the edge set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Asset uploaded, task not yet accepted into the queue
    Uploaded,
    /// Accepted and waiting for a worker
    Queued,
    /// Decode/normalize pass
    Preprocessing,
    /// Watermark detection pass
    Detecting,
    /// Inpainting pass (the expensive one)
    Inpainting,
    /// Re-encode and packaging of the result
    Packaging,
    /// Terminal: result available at `result_url`
    Succeeded,
    /// Error fields set; only exit is the retry edge back to Queued
    Failed,
    /// Terminal: user or operator canceled before completion
    Canceled,
}

impl TaskStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Uploaded => "UPLOADED",
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Preprocessing => "PREPROCESSING",
            TaskStatus::Detecting => "DETECTING",
            TaskStatus::Inpainting => "INPAINTING",
            TaskStatus::Packaging => "PACKAGING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
        }
    }

    /// Parses a status from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADED" => Some(TaskStatus::Uploaded),
            "QUEUED" => Some(TaskStatus::Queued),
            "PREPROCESSING" => Some(TaskStatus::Preprocessing),
            "DETECTING" => Some(TaskStatus::Detecting),
            "INPAINTING" => Some(TaskStatus::Inpainting),
            "PACKAGING" => Some(TaskStatus::Packaging),
            "SUCCEEDED" => Some(TaskStatus::Succeeded),
            "FAILED" => Some(TaskStatus::Failed),
            "CANCELED" => Some(TaskStatus::Canceled),
            _ => None,
        }
    }

    /// Returns true if no further transitions are accepted from this status.
    ///
    /// `Failed` is not terminal: the retry edge re-enters `Queued`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of media asset the task processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "IMAGE",
            MediaType::Video => "VIDEO",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A watermark-removal task (domain type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Immutable unique identifier
    pub task_id: Uuid,
    /// Owning user (actor identity from the auth layer)
    pub user_id: String,
    /// The uploaded asset this task processes
    pub asset_id: String,
    /// Image or video
    pub media_type: MediaType,
    /// Processing policy name (model/quality preset)
    pub policy: String,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Progress percentage, 0..=100
    pub progress: i32,
    /// Optimistic lock: increments by exactly 1 on every committed mutation
    pub version: i64,
    /// Machine-readable error code, set only in `Failed`
    pub error_code: Option<String>,
    /// Human-readable error message, set only in `Failed`
    pub error_message: Option<String>,
    /// Download URL of the processed result, set only in `Succeeded`
    pub result_url: Option<String>,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated
    pub updated_at: DateTime<Utc>,
}
