//! TaskStore port - 永続化先（source of truth）
//!
//! TaskManager はキャッシュを先に更新し、store への書き込みは
//! flush ループがまとめて行います（write-behind）。
//! したがって store は常に「少し古い」可能性があります。

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Task, TaskId, TaskPatch, TaskStatus};
use crate::error::StoreError;

/// Fields of a task about to be inserted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct TaskDraft {
    pub progress: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// TaskStore は task の正本
///
/// # 設計原則
/// - id の採番は store の責務（`insert`）
/// - `write` は終端状態からの遷移を拒否してよい（`StoreError::IllegalTransition`）
/// - `cancel_unfinished` は起動時の掃除専用
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new `Init` task and return it with its assigned id.
    async fn insert(&self, draft: TaskDraft) -> Result<Task, StoreError>;

    /// Apply a (possibly merged) patch to an existing task.
    async fn write(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Move every `Init`/`InProgress` task to `Cancelled`. Returns how many rows changed.
    async fn cancel_unfinished(
        &self,
        progress: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Durable record layout: one row per task, every column stored as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub status: String,
    pub progress: Option<String>,
    pub result: Option<String>,
    /// RFC 3339, UTC.
    pub created_at: String,
    /// RFC 3339, UTC.
    pub updated_at: String,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("timestamp {raw:?}: {e}"),
        })
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            status: task.status.as_str().to_string(),
            progress: task.progress.clone(),
            result: task.result.clone(),
            created_at: format_ts(task.created_at),
            updated_at: format_ts(task.updated_at),
        }
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };
        let id: TaskId = row.id.parse().map_err(|e| corrupt(format!("{e}")))?;
        let status: TaskStatus = row.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let created_at = parse_ts(&row.id, &row.created_at)?;
        let updated_at = parse_ts(&row.id, &row.updated_at)?;

        Ok(Task {
            id,
            status,
            progress: row.progress,
            result: row.result,
            created_at,
            updated_at,
        })
    }
}
