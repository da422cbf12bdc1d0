//! InMemoryTaskStore - 開発用・テスト用の正本
//!
//! # 実装詳細
//! - 行は `TaskRow`（全カラム text）のまま保持し、読み書きのたびに変換する
//! - id は IdGenerator で採番（既定は ULID）
//! - 終端状態から動かす書き込みは `StoreError::IllegalTransition` で拒否

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Task, TaskId, TaskPatch, TaskStatus};
use crate::error::StoreError;
use crate::ports::{IdGenerator, SystemClock, TaskDraft, TaskRow, TaskStore, UlidGenerator};

pub struct InMemoryTaskStore {
    rows: Mutex<BTreeMap<TaskId, TaskRow>>,
    ids: Box<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_id_generator(Box::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Box<dyn IdGenerator>) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            ids,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TaskId, TaskRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw stored row, as a database would hold it.
    pub fn row(&self, id: TaskId) -> Option<TaskRow> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, draft: TaskDraft) -> Result<Task, StoreError> {
        let task = Task::new(self.ids.generate_task_id(), draft.progress, draft.created_at);
        self.lock().insert(task.id, TaskRow::from(&task));
        Ok(task)
    }

    async fn write(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        let mut rows = self.lock();
        let row = rows.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        let mut task = Task::try_from(row)?;

        let from = task.status;
        let to = patch.status.unwrap_or(from);
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { id, from, to });
        }

        task.apply(patch);
        rows.insert(id, TaskRow::from(&task));
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = self.lock().get(&id).cloned();
        row.map(Task::try_from).transpose()
    }

    async fn cancel_unfinished(
        &self,
        progress: &str,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut rows = self.lock();
        let mut swept = 0;
        for row in rows.values_mut() {
            let mut task = Task::try_from(row.clone())?;
            if task.status.is_terminal() {
                continue;
            }
            task.status = TaskStatus::Cancelled;
            task.progress = Some(progress.to_string());
            task.updated_at = at;
            *row = TaskRow::from(&task);
            swept += 1;
        }
        Ok(swept)
    }
}
