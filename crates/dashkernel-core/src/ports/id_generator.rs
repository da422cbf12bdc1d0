//! Task id allocation.
//!
//! `InMemoryTaskStore` は insert のたびにここから TaskId を引きます。
//! ULID の時刻部分は Clock から取るので、FixedClock を渡せば
//! 採番順とタイムスタンプをテストで固定できます。

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Source of fresh task ids for a store.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULIDs stamped with the injected clock's time; the random part comes from `rand`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        // clocks before the epoch clamp to 0
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        TaskId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
