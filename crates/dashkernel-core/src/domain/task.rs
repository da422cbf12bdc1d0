//! Task snapshot and partial updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TaskId, TaskStatus};

/// Full snapshot of a task, as cached, stored and pushed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,

    /// Short human-readable progress line ("transcoding 40%").
    pub progress: Option<String>,

    /// Opaque payload produced by the worker, usually serialized JSON.
    pub result: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A freshly created task in `Init`.
    pub fn new(id: TaskId, progress: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::Init,
            progress,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge the fields present in `patch`.
    ///
    /// Transition rules are checked by the caller; this only copies fields.
    pub fn apply(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = &patch.progress {
            self.progress = Some(progress.clone());
        }
        if let Some(result) = &patch.result {
            self.result = Some(result.clone());
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
    }
}

/// Partial update of a task.
///
/// `id` is optional on purpose: a patch without an id is silently ignored by
/// `TaskManager::update`, which lets callers forward whatever they were handed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    pub id: Option<TaskId>,
    pub status: Option<TaskStatus>,
    pub progress: Option<String>,
    pub result: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn new(id: TaskId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_info(mut self, info: TaskInfo) -> Self {
        if info.progress.is_some() {
            self.progress = info.progress;
        }
        if info.result.is_some() {
            self.result = info.result;
        }
        self
    }

    /// Fold a newer patch into this one; fields set in `newer` win.
    pub fn merge(&mut self, newer: &TaskPatch) {
        if newer.id.is_some() {
            self.id = newer.id;
        }
        if newer.status.is_some() {
            self.status = newer.status;
        }
        if newer.progress.is_some() {
            self.progress.clone_from(&newer.progress);
        }
        if newer.result.is_some() {
            self.result.clone_from(&newer.result);
        }
        if newer.updated_at.is_some() {
            self.updated_at = newer.updated_at;
        }
    }
}

impl From<&Task> for TaskPatch {
    fn from(task: &Task) -> Self {
        Self {
            id: Some(task.id),
            status: Some(task.status),
            progress: task.progress.clone(),
            result: task.result.clone(),
            updated_at: Some(task.updated_at),
        }
    }
}

/// Progress/result pair carried by `process`, `finish` and `fail`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskInfo {
    pub progress: Option<String>,
    pub result: Option<String>,
}

impl TaskInfo {
    pub fn progress(progress: impl Into<String>) -> Self {
        Self {
            progress: Some(progress.into()),
            result: None,
        }
    }

    pub fn result(result: impl Into<String>) -> Self {
        Self {
            progress: None,
            result: Some(result.into()),
        }
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = Some(progress.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }
}
