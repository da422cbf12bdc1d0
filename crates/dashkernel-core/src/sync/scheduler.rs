//! CooperativeScheduler - 時間予算つきの自発的な譲り
//!
//! 長いループの途中で `yield_if_needed()` を呼ぶと、frame の開始から
//! time slice 以上経っていれば一度 runtime に制御を返します。
//! 同じ key の scheduler は複数の task で共有され、frame も共有です。

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::KernelError;
use crate::observability::SchedulerSnapshot;

struct Frame {
    started_at: Instant,
    yields: u64,
}

struct SchedulerInner {
    name: String,
    time_slice: Duration,
    yield_delay: Duration,
    frame: Mutex<Frame>,
}

/// Time-sliced cooperative yielding. Cheap to clone; clones share the frame.
#[derive(Clone)]
pub struct CooperativeScheduler {
    inner: Arc<SchedulerInner>,
}

impl CooperativeScheduler {
    /// `time_slice` must be non-zero. A zero `yield_delay` yields to the
    /// runtime without sleeping.
    pub fn new(
        time_slice: Duration,
        yield_delay: Duration,
        name: impl Into<String>,
    ) -> Result<Self, KernelError> {
        let name = name.into();
        if time_slice.is_zero() {
            return Err(KernelError::Configuration(format!(
                "scheduler {name}: time slice must be positive"
            )));
        }
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                name,
                time_slice,
                yield_delay,
                frame: Mutex::new(Frame {
                    started_at: Instant::now(),
                    yields: 0,
                }),
            }),
        })
    }

    fn frame(&self) -> MutexGuard<'_, Frame> {
        self.inner.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Start a new unit of work; the time budget restarts from now.
    pub fn begin_frame(&self) {
        self.frame().started_at = Instant::now();
    }

    /// Yield once the current frame has used up its time slice.
    pub async fn yield_if_needed(&self) {
        let due = self.frame().started_at.elapsed() >= self.inner.time_slice;
        if due {
            self.yield_now().await;
        }
    }

    /// Yield regardless of the budget, then start a new frame.
    pub async fn yield_now(&self) {
        {
            let mut frame = self.frame();
            frame.yields += 1;
            trace!(target: "dashkernel::scheduler", name = %self.inner.name, yields = frame.yields, "yielding");
        }
        if self.inner.yield_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.inner.yield_delay).await;
        }
        self.begin_frame();
    }

    /// Run `worker` over `items` in order, yielding between items when the
    /// budget runs out. Stops at the first error.
    pub async fn run_chunked<I, F, Fut, E>(&self, items: I, mut worker: F) -> Result<(), E>
    where
        I: IntoIterator,
        F: FnMut(I::Item, usize) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        self.begin_frame();
        for (index, item) in items.into_iter().enumerate() {
            worker(item, index).await?;
            self.yield_if_needed().await;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let frame = self.frame();
        SchedulerSnapshot {
            name: self.inner.name.clone(),
            time_slice_ms: self.inner.time_slice.as_millis() as u64,
            yield_delay_ms: self.inner.yield_delay.as_millis() as u64,
            frame_elapsed_ms: frame.started_at.elapsed().as_millis() as u64,
            yield_count: frame.yields,
        }
    }
}

impl std::fmt::Debug for CooperativeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooperativeScheduler")
            .field("name", &self.inner.name)
            .field("time_slice", &self.inner.time_slice)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(slice_ms: u64, delay_ms: u64) -> CooperativeScheduler {
        CooperativeScheduler::new(
            Duration::from_millis(slice_ms),
            Duration::from_millis(delay_ms),
            "test",
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn yields_only_after_the_slice_is_spent() {
        let sched = scheduler(8, 0);
        sched.begin_frame();

        tokio::time::advance(Duration::from_millis(5)).await;
        sched.yield_if_needed().await;
        assert_eq!(sched.snapshot().yield_count, 0);

        tokio::time::advance(Duration::from_millis(5)).await;
        sched.yield_if_needed().await;
        let snap = sched.snapshot();
        assert_eq!(snap.yield_count, 1);
        assert_eq!(snap.frame_elapsed_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn yield_delay_sleeps_before_the_next_frame() {
        let sched = scheduler(1, 20);
        let start = Instant::now();

        sched.yield_now().await;
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(sched.snapshot().yield_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_chunked_visits_items_in_order_and_yields() {
        let sched = scheduler(10, 0);
        let mut seen = Vec::new();

        sched
            .run_chunked(["a", "b", "c"], |item, index| {
                seen.push((index, item));
                async {
                    tokio::time::sleep(Duration::from_millis(6)).await;
                    Ok::<_, KernelError>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![(0, "a"), (1, "b"), (2, "c")]);
        // b ends 12ms into the frame and yields; c ends 6ms into the next one
        assert_eq!(sched.snapshot().yield_count, 1);
    }

    #[tokio::test]
    async fn run_chunked_stops_at_the_first_error() {
        let sched = scheduler(10, 0);
        let mut calls = 0;

        let res = sched
            .run_chunked(1..=5, |n, _| {
                calls += 1;
                async move {
                    if n == 2 {
                        Err(KernelError::Configuration("bad item".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(res.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn zero_time_slice_is_rejected() {
        let err = CooperativeScheduler::new(Duration::ZERO, Duration::ZERO, "bad").unwrap_err();
        assert!(matches!(err, KernelError::Configuration(_)));
    }
}
