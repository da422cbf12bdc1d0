//! TaskManager settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// # 既定値
/// - flush 間隔: 3 秒
/// - キャッシュ: 直近 2000 件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskManagerConfig {
    /// Period of the write-behind loop.
    pub flush_interval_ms: u64,

    /// Tasks kept in memory; the least recently used one is evicted first.
    pub cache_capacity: usize,

    /// Progress text of a freshly created task.
    pub created_progress: String,

    /// Progress text written by `cancel_all`.
    pub cancelled_progress: String,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 3_000,
            cache_capacity: 2_000,
            created_progress: "task created".to_string(),
            cancelled_progress: "task cancelled".to_string(),
        }
    }
}

impl TaskManagerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| KernelError::Configuration(format!("task manager: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.flush_interval_ms == 0 {
            return Err(KernelError::Configuration(
                "flush_interval_ms must be positive".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(KernelError::Configuration(
                "cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
