//! Domain identifiers.
//!
//! # ULID ベースの TaskId
//! TaskId は store が採番します（`TaskStore::insert`）。
//! - **時刻でソート可能**: 生成順に並ぶので、一覧表示で created_at を引かずに済む
//! - **不透明**: 呼び出し側は値の中身を解釈しない
//!
//! 永続化時は `task-<ULID>` 形式のテキストとして保存します。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

const PREFIX: &str = "task-";

/// Identifier of a background task.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    /// ULID から TaskId を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid task id {input:?}: {reason}")]
pub struct ParseTaskIdError {
    input: String,
    reason: String,
}

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    /// Accepts both `task-<ULID>` and the bare ULID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(PREFIX).unwrap_or(s);
        Ulid::from_string(raw)
            .map(TaskId)
            .map_err(|e| ParseTaskIdError {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }
}
