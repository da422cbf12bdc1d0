//! Sliding-window rate limiter.
//!
//! 直近 `window` の間に許可した時刻を記録し、その数が `max_requests`
//! 未満のときだけ次を通します。固定バケットと違い、境界をまたいだ
//! 2 倍のバーストは起きません。
//!
//! 待ちが残っている間は、最も古い許可が窓から外れる瞬間にタイマーを張り、
//! そこで再び先頭から順に許可を配ります。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::waiter::{PendingWait, WaitHost, WaitOptions, WaitQueue};
use crate::error::KernelError;
use crate::observability::RateLimiterSnapshot;

struct LimiterState {
    /// Grant instants, oldest first.
    grants: VecDeque<Instant>,
    queue: WaitQueue,
    timer: Option<JoinHandle<()>>,
}

impl LimiterState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.grants.front() {
            if oldest + window > now {
                break;
            }
            self.grants.pop_front();
        }
    }
}

struct LimiterInner {
    me: Weak<LimiterInner>,
    name: String,
    max_requests: usize,
    window: Duration,
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant queued waiters while slots remain, then arm the timer if anyone
    /// is still waiting.
    fn drain(&self, state: &mut LimiterState) {
        let now = Instant::now();
        state.prune(now, self.window);

        while state.grants.len() < self.max_requests {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            if waiter.grant() {
                state.grants.push_back(now);
            }
        }

        if state.queue.is_empty() || state.timer.is_some() {
            return;
        }
        let Some(&oldest) = state.grants.front() else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!(
                target: "dashkernel::sync",
                limiter = %self.name,
                "no tokio runtime; queued waiters stay parked until the next call"
            );
            return;
        };

        let me = self.me.clone();
        let at = oldest + self.window;
        state.timer = Some(handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(inner) = me.upgrade() {
                inner.on_timer();
            }
        }));
    }

    fn on_timer(&self) {
        let mut state = self.lock();
        state.timer = None;
        self.drain(&mut state);
    }
}

impl WaitHost for LimiterInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.lock();
        let removed = state.queue.remove(id);
        if removed {
            self.drain(&mut state);
        }
        removed
    }

    // A slot handed to an abandoned waiter stays consumed until it ages out.
    fn give_back(&self) {}
}

impl Drop for LimiterInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

/// Admits at most `max_requests` operations in any trailing `window`.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Both `max_requests` and `window` must be positive.
    pub fn new(
        max_requests: usize,
        window: Duration,
        name: impl Into<String>,
    ) -> Result<Self, KernelError> {
        let name = name.into();
        if max_requests == 0 {
            return Err(KernelError::Configuration(format!(
                "rate limiter {name}: max_requests must be a positive integer"
            )));
        }
        if window.is_zero() {
            return Err(KernelError::Configuration(format!(
                "rate limiter {name}: window must be positive"
            )));
        }

        let inner = Arc::new_cyclic(|me| LimiterInner {
            me: me.clone(),
            name,
            max_requests,
            window,
            state: Mutex::new(LimiterState {
                grants: VecDeque::with_capacity(max_requests),
                queue: WaitQueue::default(),
                timer: None,
            }),
        });
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wait until a slot is free in the current window.
    pub async fn wait_turn(&self, opts: WaitOptions) -> Result<(), KernelError> {
        let pending = {
            let mut state = self.inner.lock();
            let now = Instant::now();
            state.prune(now, self.inner.window);

            if state.queue.is_empty() && state.grants.len() < self.inner.max_requests {
                state.grants.push_back(now);
                return Ok(());
            }
            if opts.is_cancelled() {
                return Err(KernelError::Cancelled {
                    name: self.inner.name.clone(),
                });
            }

            let (id, rx) = state.queue.enqueue();
            debug!(
                target: "dashkernel::sync",
                limiter = %self.inner.name,
                queued = state.queue.len(),
                "wait_turn queued"
            );
            self.inner.drain(&mut state);
            PendingWait::new(Arc::clone(&self.inner), id, rx)
        };

        pending.wait(&opts).await
    }

    /// `wait_turn`, then run `task` and return its result unchanged.
    pub async fn schedule<F, Fut, T, E>(&self, opts: WaitOptions, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KernelError>,
    {
        self.wait_turn(opts).await?;
        task().await
    }

    /// Point-in-time view; does not prune.
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let state = self.inner.lock();
        let now = Instant::now();
        let window = self.inner.window;
        RateLimiterSnapshot {
            name: self.inner.name.clone(),
            queued: state.queue.len(),
            recent_requests: state.grants.iter().filter(|&&ts| ts + window > now).count(),
            max_requests: self.inner.max_requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("max_requests", &self.inner.max_requests)
            .field("window", &self.inner.window)
            .finish_non_exhaustive()
    }
}
