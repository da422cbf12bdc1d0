//! Task status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task status.
///
/// State transitions:
/// - Init -> InProgress -> Done | Failed | Cancelled
/// - Init -> Cancelled (cancelled before any work was reported)
/// - Init -> Done | Failed (worker finished or failed before its first progress report)
///
/// The last edge is wider than the classic Init -> InProgress -> terminal
/// chain: a short job may call `finish`/`fail` without ever reporting
/// progress, and that must not be rejected.
///
/// Terminal states accept no further writes, not even progress text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no progress reported yet.
    Init,

    /// A worker is running it.
    InProgress,

    /// Finished successfully.
    Done,

    /// Finished with an error.
    Failed,

    /// Stopped at a cancellation checkpoint (or swept at startup).
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Init,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Init => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled => 2,
        }
    }

    /// Whether a patch may move a task from `self` to `next`.
    ///
    /// Status only moves forward (Init < InProgress < terminal), so Init may
    /// jump straight to Done or Failed. Staying in the same non-terminal
    /// status is allowed (progress updates).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    /// Text form used by durable storage.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Init => "init",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}
