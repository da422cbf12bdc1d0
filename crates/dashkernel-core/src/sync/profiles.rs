//! Named concurrency profiles.
//!
//! ConcurrencyKernel は key ごとにここから設定を引き、インスタンスを作ります。
//! 既定値はコードに持ち、JSON で部分的に上書きできます。

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreProfile {
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterProfile {
    pub max_requests: usize,
    pub window_ms: u64,
}

impl RateLimiterProfile {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerProfile {
    pub time_slice_ms: u64,
    #[serde(default)]
    pub yield_delay_ms: u64,
}

impl SchedulerProfile {
    pub fn time_slice(&self) -> Duration {
        Duration::from_millis(self.time_slice_ms)
    }

    pub fn yield_delay(&self) -> Duration {
        Duration::from_millis(self.yield_delay_ms)
    }
}

/// Key of the scheduler used when callers do not name one.
pub const DEFAULT_SCHEDULER: &str = "default";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyProfiles {
    pub semaphore: HashMap<String, SemaphoreProfile>,
    pub rate_limiter: HashMap<String, RateLimiterProfile>,
    pub scheduler: HashMap<String, SchedulerProfile>,
}

impl ConcurrencyProfiles {
    /// Built-in limits for the media and AI workloads.
    ///
    /// - `ffmpeg`: 2 concurrent transcodes
    /// - `whisper`: 1 transcription at a time
    /// - `download`: 3 concurrent downloads
    /// - `gpt`: 20 requests per minute
    /// - `default` scheduler: 8ms slices, plain yield
    pub fn defaults() -> Self {
        let semaphore = [
            ("ffmpeg", SemaphoreProfile { capacity: 2 }),
            ("whisper", SemaphoreProfile { capacity: 1 }),
            ("download", SemaphoreProfile { capacity: 3 }),
        ]
        .into_iter()
        .map(|(key, profile)| (key.to_string(), profile))
        .collect();

        let rate_limiter = [(
            "gpt",
            RateLimiterProfile {
                max_requests: 20,
                window_ms: 60_000,
            },
        )]
        .into_iter()
        .map(|(key, profile)| (key.to_string(), profile))
        .collect();

        let scheduler = [(
            DEFAULT_SCHEDULER,
            SchedulerProfile {
                time_slice_ms: 8,
                yield_delay_ms: 0,
            },
        )]
        .into_iter()
        .map(|(key, profile)| (key.to_string(), profile))
        .collect();

        Self {
            semaphore,
            rate_limiter,
            scheduler,
        }
    }

    /// Overlay `overrides`; keys present there replace ours.
    pub fn merge(mut self, overrides: ConcurrencyProfiles) -> Self {
        self.semaphore.extend(overrides.semaphore);
        self.rate_limiter.extend(overrides.rate_limiter);
        self.scheduler.extend(overrides.scheduler);
        self
    }

    /// Parse overrides from JSON and lay them over [`defaults`](Self::defaults).
    pub fn from_json(json: &str) -> Result<Self, KernelError> {
        let overrides: ConcurrencyProfiles = serde_json::from_str(json)
            .map_err(|e| KernelError::Configuration(format!("concurrency profiles: {e}")))?;
        let merged = Self::defaults().merge(overrides);
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if let Some((key, _)) = self.semaphore.iter().find(|(_, p)| p.capacity == 0) {
            return Err(KernelError::Configuration(format!(
                "semaphore profile {key}: capacity must be positive"
            )));
        }
        if let Some((key, _)) = self
            .rate_limiter
            .iter()
            .find(|(_, p)| p.max_requests == 0 || p.window_ms == 0)
        {
            return Err(KernelError::Configuration(format!(
                "rate limiter profile {key}: max_requests and window_ms must be positive"
            )));
        }
        if let Some((key, _)) = self.scheduler.iter().find(|(_, p)| p.time_slice_ms == 0) {
            return Err(KernelError::Configuration(format!(
                "scheduler profile {key}: time_slice_ms must be positive"
            )));
        }
        Ok(())
    }
}
