//! Bounded-concurrency semaphore with strict FIFO fairness.
//!
//! - `acquire`: 空きがあり、かつ誰も待っていなければ即座に許可
//! - それ以外は待ち行列の末尾へ（タイムアウト / キャンセル可）
//! - `try_acquire`: 待ち行列が空でない限り、空きがあっても許可しない
//! - `Permit::release` は冪等。解放のたびに先頭から順に許可を配る

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::waiter::{PendingWait, WaitHost, WaitOptions, WaitQueue};
use crate::error::KernelError;
use crate::observability::SemaphoreSnapshot;

struct SemaphoreState {
    in_use: usize,
    queue: WaitQueue,
}

struct SemaphoreInner {
    name: String,
    capacity: usize,
    state: Mutex<SemaphoreState>,
}

impl SemaphoreInner {
    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand free capacity to queued waiters in arrival order.
    fn drain(&self, state: &mut SemaphoreState) {
        while state.in_use < self.capacity {
            let Some(waiter) = state.queue.pop_front() else {
                break;
            };
            if waiter.grant() {
                state.in_use += 1;
            }
        }
    }

    fn release_one(&self) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        self.drain(&mut state);
    }
}

impl WaitHost for SemaphoreInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn withdraw(&self, id: u64) -> bool {
        self.lock().queue.remove(id)
    }

    fn give_back(&self) {
        self.release_one();
    }
}

/// Counting semaphore. Cloning yields another handle to the same semaphore.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize, name: impl Into<String>) -> Result<Self, KernelError> {
        let name = name.into();
        if capacity == 0 {
            return Err(KernelError::Configuration(format!(
                "semaphore {name}: capacity must be a positive integer"
            )));
        }
        Ok(Self::build(capacity, name))
    }

    /// A capacity-1 semaphore.
    pub fn mutex(name: impl Into<String>) -> Self {
        Self::build(1, name.into())
    }

    fn build(capacity: usize, name: String) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                name,
                capacity,
                state: Mutex::new(SemaphoreState {
                    in_use: 0,
                    queue: WaitQueue::default(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wait for a permit.
    ///
    /// Settles exactly once: granted, `KernelError::Timeout`, or
    /// `KernelError::Cancelled`. Dropping the returned future before it
    /// settles removes the request from the queue.
    pub async fn acquire(&self, opts: WaitOptions) -> Result<Permit, KernelError> {
        let pending = {
            let mut state = self.inner.lock();
            if state.in_use < self.inner.capacity && state.queue.is_empty() {
                state.in_use += 1;
                return Ok(self.permit());
            }
            if opts.is_cancelled() {
                return Err(KernelError::Cancelled {
                    name: self.inner.name.clone(),
                });
            }
            let (id, rx) = state.queue.enqueue();
            debug!(
                target: "dashkernel::sync",
                semaphore = %self.inner.name,
                waiting = state.queue.len(),
                "acquire queued"
            );
            PendingWait::new(Arc::clone(&self.inner), id, rx)
        };

        pending.wait(&opts).await?;
        Ok(self.permit())
    }

    /// Grant a permit only if one is free and nobody is queued ahead.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.lock();
        if state.in_use < self.inner.capacity && state.queue.is_empty() {
            state.in_use += 1;
            Some(self.permit())
        } else {
            None
        }
    }

    /// Run `task` while holding a permit. The permit is released on every exit
    /// path and the task's own result is returned unchanged.
    pub async fn run_exclusive<F, Fut, T, E>(&self, opts: WaitOptions, task: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KernelError>,
    {
        let permit = self.acquire(opts).await?;
        let out = task().await;
        permit.release();
        out
    }

    pub fn snapshot(&self) -> SemaphoreSnapshot {
        let state = self.inner.lock();
        SemaphoreSnapshot {
            name: self.inner.name.clone(),
            capacity: self.inner.capacity,
            in_use: state.in_use,
            waiting: state.queue.len(),
        }
    }

    fn permit(&self) -> Permit {
        Permit {
            sem: Arc::clone(&self.inner),
            released: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

/// One unit of granted capacity. Released on drop if not released earlier.
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    sem: Arc<SemaphoreInner>,
    released: AtomicBool,
}

impl Permit {
    /// Give the capacity back. Only the first call has any effect.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.sem.release_one();
        }
    }

    pub fn semaphore_name(&self) -> &str {
        &self.sem.name
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("semaphore", &self.sem.name)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
