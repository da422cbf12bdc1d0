//! ConcurrencyKernel - key で引けるセマフォ / ミューテックス / レートリミッター / スケジューラ
//!
//! グローバルなシングルトンは持たず、起動時に一つ作って Arc で配ります。
//! インスタンスは初回アクセス時にプロファイルから作り、以後は同じものを返します。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::profiles::ConcurrencyProfiles;
use super::{CooperativeScheduler, Permit, RateLimiter, Semaphore, WaitOptions};
use crate::error::KernelError;
use crate::observability::KernelSnapshot;

#[derive(Default)]
struct Instances {
    semaphores: HashMap<String, Semaphore>,
    mutexes: HashMap<String, Semaphore>,
    limiters: HashMap<String, RateLimiter>,
    schedulers: HashMap<String, CooperativeScheduler>,
}

pub struct ConcurrencyKernel {
    profiles: ConcurrencyProfiles,
    instances: Mutex<Instances>,
}

impl ConcurrencyKernel {
    pub fn new(profiles: ConcurrencyProfiles) -> Result<Self, KernelError> {
        profiles.validate()?;
        Ok(Self {
            profiles,
            instances: Mutex::new(Instances::default()),
        })
    }

    /// Kernel over [`ConcurrencyProfiles::defaults`].
    pub fn with_defaults() -> Self {
        Self {
            profiles: ConcurrencyProfiles::defaults(),
            instances: Mutex::new(Instances::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Instances> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn semaphore(&self, key: &str) -> Result<Semaphore, KernelError> {
        let mut instances = self.lock();
        if let Some(sem) = instances.semaphores.get(key) {
            return Ok(sem.clone());
        }
        let profile = self
            .profiles
            .semaphore
            .get(key)
            .ok_or_else(|| KernelError::UnknownProfile {
                kind: "semaphore",
                key: key.to_string(),
            })?;
        let sem = Semaphore::new(profile.capacity, key)?;
        debug!(target: "dashkernel::kernel", key, capacity = profile.capacity, "semaphore created");
        instances.semaphores.insert(key.to_string(), sem.clone());
        Ok(sem)
    }

    /// Mutexes need no profile; any key works.
    pub fn mutex(&self, key: &str) -> Semaphore {
        self.lock()
            .mutexes
            .entry(key.to_string())
            .or_insert_with(|| Semaphore::mutex(key))
            .clone()
    }

    pub fn rate_limiter(&self, key: &str) -> Result<RateLimiter, KernelError> {
        let mut instances = self.lock();
        if let Some(limiter) = instances.limiters.get(key) {
            return Ok(limiter.clone());
        }
        let profile =
            self.profiles
                .rate_limiter
                .get(key)
                .ok_or_else(|| KernelError::UnknownProfile {
                    kind: "rate_limiter",
                    key: key.to_string(),
                })?;
        let limiter = RateLimiter::new(profile.max_requests, profile.window(), key)?;
        debug!(
            target: "dashkernel::kernel",
            key,
            max_requests = profile.max_requests,
            window_ms = profile.window_ms,
            "rate limiter created"
        );
        instances.limiters.insert(key.to_string(), limiter.clone());
        Ok(limiter)
    }

    /// Shared scheduler for `key`; [`DEFAULT_SCHEDULER`](super::DEFAULT_SCHEDULER) is always configured.
    pub fn scheduler(&self, key: &str) -> Result<CooperativeScheduler, KernelError> {
        let mut instances = self.lock();
        if let Some(sched) = instances.schedulers.get(key) {
            return Ok(sched.clone());
        }
        let profile = self
            .profiles
            .scheduler
            .get(key)
            .ok_or_else(|| KernelError::UnknownProfile {
                kind: "scheduler",
                key: key.to_string(),
            })?;
        let sched = CooperativeScheduler::new(profile.time_slice(), profile.yield_delay(), key)?;
        debug!(
            target: "dashkernel::kernel",
            key,
            time_slice_ms = profile.time_slice_ms,
            yield_delay_ms = profile.yield_delay_ms,
            "scheduler created"
        );
        instances.schedulers.insert(key.to_string(), sched.clone());
        Ok(sched)
    }

    pub async fn yield_if_needed(&self, key: &str) -> Result<(), KernelError> {
        self.scheduler(key)?.yield_if_needed().await;
        Ok(())
    }

    pub async fn acquire(&self, key: &str, opts: WaitOptions) -> Result<Permit, KernelError> {
        self.semaphore(key)?.acquire(opts).await
    }

    pub async fn with_semaphore<F, Fut, T, E>(
        &self,
        key: &str,
        opts: WaitOptions,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KernelError>,
    {
        self.semaphore(key)?.run_exclusive(opts, task).await
    }

    pub async fn with_mutex<F, Fut, T, E>(
        &self,
        key: &str,
        opts: WaitOptions,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KernelError>,
    {
        self.mutex(key).run_exclusive(opts, task).await
    }

    pub async fn wait_turn(&self, key: &str, opts: WaitOptions) -> Result<(), KernelError> {
        self.rate_limiter(key)?.wait_turn(opts).await
    }

    pub async fn with_rate_limit<F, Fut, T, E>(
        &self,
        key: &str,
        opts: WaitOptions,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KernelError>,
    {
        self.rate_limiter(key)?.schedule(opts, task).await
    }

    /// Every instance created so far, keyed and sorted by name.
    pub fn snapshot(&self) -> KernelSnapshot {
        let instances = self.lock();
        KernelSnapshot {
            semaphore: collect(&instances.semaphores, Semaphore::snapshot),
            mutex: collect(&instances.mutexes, Semaphore::snapshot),
            rate_limiter: collect(&instances.limiters, RateLimiter::snapshot),
            scheduler: collect(&instances.schedulers, CooperativeScheduler::snapshot),
        }
    }
}

fn collect<I, S>(map: &HashMap<String, I>, snap: impl Fn(&I) -> S) -> BTreeMap<String, S> {
    map.iter().map(|(key, item)| (key.clone(), snap(item))).collect()
}

impl std::fmt::Debug for ConcurrencyKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyKernel")
            .field("profiles", &self.profiles)
            .finish_non_exhaustive()
    }
}
