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

//! Task status state machine.
//!
//! The pipeline is a straight line with two escape hatches: any non-terminal
//! status may fail, and the early statuses may be canceled. The only backward
//! edge is `Failed -> Queued` (retry). `Succeeded` and `Canceled` accept
//! nothing.

use crate::models::TaskStatus;

/// Statuses from which a user-initiated cancel is legal.
pub const CANCELABLE: [TaskStatus; 3] = [
    TaskStatus::Queued,
    TaskStatus::Preprocessing,
    TaskStatus::Detecting,
];

/// The forward pipeline successor of a status, if any.
fn pipeline_successor(status: TaskStatus) -> Option<TaskStatus> {
    match status {
        TaskStatus::Uploaded => Some(TaskStatus::Queued),
        TaskStatus::Queued => Some(TaskStatus::Preprocessing),
        TaskStatus::Preprocessing => Some(TaskStatus::Detecting),
        TaskStatus::Detecting => Some(TaskStatus::Inpainting),
        TaskStatus::Inpainting => Some(TaskStatus::Packaging),
        TaskStatus::Packaging => Some(TaskStatus::Succeeded),
        TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled => None,
    }
}

/// Whether `from -> to` is in the allowed edge set.
pub fn is_transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if pipeline_successor(from) == Some(to) {
        return true;
    }
    match to {
        // Any non-terminal status may fail (Failed -> Failed excluded)
        TaskStatus::Failed => from != TaskStatus::Failed,
        TaskStatus::Canceled => CANCELABLE.contains(&from),
        // The retry edge, the only cycle in the graph
        TaskStatus::Queued => from == TaskStatus::Failed,
        _ => false,
    }
}

/// Whether a cancel action is legal from the given status.
pub fn is_cancelable(status: TaskStatus) -> bool {
    CANCELABLE.contains(&status)
}
