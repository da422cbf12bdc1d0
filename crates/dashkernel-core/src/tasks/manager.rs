//! TaskManager - 長時間ジョブのライフサイクル管理
//!
//! # 流れ
//! 1. `create()`: store で採番 → キャッシュに INIT を置く → 書き込み予約 → 通知
//! 2. worker が `process` / `finish` / `fail` で進捗を報告（キャッシュ + 未書き込みバッファ）
//! 3. flush ループが未書き込みバッファを store へ流す（write-behind）
//! 4. UI が `cancel(id)` → 登録済みハンドルを即座に中断
//! 5. worker が `check_cancel(id)` で CANCELLED を書き、`TaskCancelled` を返す
//!
//! # 状態遷移
//! 終端状態（DONE / FAILED / CANCELLED）の task への patch は捨てます。
//! 後から届いた進捗で結果が上書きされることはありません。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::cache::TaskCache;
use super::config::TaskManagerConfig;
use super::flusher::FlushLoop;
use super::notifier::Notifier;
use super::registry::CancellationRegistry;
use crate::domain::{Task, TaskId, TaskInfo, TaskPatch, TaskStatus};
use crate::error::KernelError;
use crate::ports::{Cancellable, Clock, NoopObserver, SystemClock, TaskDraft, TaskObserver, TaskStore};

/// A patch waiting for the next flush round.
///
/// `version` changes every time the patch absorbs a newer one, so a flush can
/// tell whether what it wrote is still the latest.
pub(crate) struct PendingWrite {
    pub(crate) patch: TaskPatch,
    pub(crate) version: u64,
}

pub(crate) struct ManagerState {
    cache: TaskCache,
    pub(crate) pending: HashMap<TaskId, PendingWrite>,
    next_version: u64,
}

impl ManagerState {
    fn stage(&mut self, id: TaskId, patch: TaskPatch) {
        self.next_version += 1;
        let version = self.next_version;
        match self.pending.entry(id) {
            Entry::Occupied(mut slot) => {
                let write = slot.get_mut();
                write.patch.merge(&patch);
                write.version = version;
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingWrite { patch, version });
            }
        }
    }

    /// Last status we know of without touching the store.
    fn known_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.cache
            .peek(id)
            .map(|task| task.status)
            .or_else(|| self.pending.get(&id).and_then(|write| write.patch.status))
    }
}

pub(crate) struct ManagerInner {
    pub(crate) store: Arc<dyn TaskStore>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    pub(crate) config: TaskManagerConfig,
    state: Mutex<ManagerState>,
    /// Held for a whole flush round; rounds never overlap.
    pub(crate) flush_gate: tokio::sync::Mutex<()>,
    cancellations: CancellationRegistry,
}

impl ManagerInner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to the task lifecycle manager. Cheap to clone.
#[derive(Clone)]
pub struct TaskManager {
    pub(crate) inner: Arc<ManagerInner>,
}

/// TaskManagerBuilder は TaskManager を構築
///
/// # 使用例
/// ```ignore
/// let manager = TaskManager::builder(store)
///     .observer(observer)
///     .config(config)
///     .build()?;
/// ```
///
/// build() 時に config を検証します（Fail-fast）。
pub struct TaskManagerBuilder {
    store: Arc<dyn TaskStore>,
    observer: Arc<dyn TaskObserver>,
    clock: Arc<dyn Clock>,
    config: TaskManagerConfig,
}

impl TaskManagerBuilder {
    pub fn observer(mut self, observer: Arc<dyn TaskObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: TaskManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<TaskManager, KernelError> {
        self.config.validate()?;
        let state = ManagerState {
            cache: TaskCache::new(self.config.cache_capacity),
            pending: HashMap::new(),
            next_version: 0,
        };
        Ok(TaskManager {
            inner: Arc::new(ManagerInner {
                store: self.store,
                notifier: Notifier::new(self.observer),
                clock: self.clock,
                config: self.config,
                state: Mutex::new(state),
                flush_gate: tokio::sync::Mutex::new(()),
                cancellations: CancellationRegistry::new(),
            }),
        })
    }
}

impl TaskManager {
    pub fn builder(store: Arc<dyn TaskStore>) -> TaskManagerBuilder {
        TaskManagerBuilder {
            store,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            config: TaskManagerConfig::default(),
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.inner.config
    }

    /// Allocate a task in `Init`. It is readable through `detail` right away.
    pub async fn create(&self) -> Result<TaskId, KernelError> {
        let draft = TaskDraft {
            progress: Some(self.inner.config.created_progress.clone()),
            created_at: self.inner.clock.now(),
        };
        let task = self.inner.store.insert(draft).await?;
        let id = task.id;

        {
            let mut state = self.inner.lock();
            state.cache.insert(task.clone());
            state.stage(id, TaskPatch::from(&task));
        }

        info!(target: "dashkernel::tasks", task_id = %id, "task created");
        self.inner.notifier.publish(&task);
        Ok(id)
    }

    /// Merge `patch` into the cache and the pending-write buffer, then notify.
    ///
    /// A patch without an id is ignored. A patch for a task already in a
    /// terminal status, or one that would move the status backwards, is
    /// dropped with a warning.
    pub fn update(&self, mut patch: TaskPatch) {
        let Some(id) = patch.id else {
            return;
        };
        patch.updated_at = Some(self.inner.clock.now());

        let cached = {
            let mut state = self.inner.lock();
            if let Some(from) = state.known_status(id) {
                let to = patch.status.unwrap_or(from);
                if !from.can_transition_to(to) {
                    warn!(
                        target: "dashkernel::tasks",
                        task_id = %id,
                        %from,
                        %to,
                        "patch dropped: illegal status transition"
                    );
                    return;
                }
            }

            let cached = state.cache.get_mut(id).map(|task| {
                task.apply(&patch);
                task.clone()
            });
            state.stage(id, patch.clone());
            cached
        };

        if let Some(status) = patch.status.filter(|s| s.is_terminal()) {
            self.inner.cancellations.forget(id);
            info!(target: "dashkernel::tasks", task_id = %id, %status, "task finished");
        }

        match cached {
            Some(task) => self.inner.notifier.publish(&task),
            None => {
                let manager = self.clone();
                self.inner
                    .notifier
                    .publish_detached(async move { manager.detail(id).await.ok().flatten() });
            }
        }
    }

    pub fn process(&self, id: TaskId, info: TaskInfo) {
        self.update(TaskPatch::new(id).with_status(TaskStatus::InProgress).with_info(info));
    }

    pub fn finish(&self, id: TaskId, info: TaskInfo) {
        self.update(TaskPatch::new(id).with_status(TaskStatus::Done).with_info(info));
    }

    pub fn fail(&self, id: TaskId, info: TaskInfo) {
        self.update(TaskPatch::new(id).with_status(TaskStatus::Failed).with_info(info));
    }

    /// Cached snapshot if present; otherwise the stored row with any
    /// not-yet-flushed patch laid over it.
    ///
    /// A pending patch the stored status does not allow (a late update for a
    /// task that finished and then left the cache) is discarded, not shown.
    pub async fn detail(&self, id: TaskId) -> Result<Option<Task>, KernelError> {
        {
            let mut state = self.inner.lock();
            if let Some(task) = state.cache.get(id) {
                return Ok(Some(task.clone()));
            }
        }

        let Some(mut task) = self.inner.store.get(id).await? else {
            return Ok(None);
        };
        let mut state = self.inner.lock();
        if let Some(write) = state.pending.get(&id) {
            let to = write.patch.status.unwrap_or(task.status);
            if task.status.can_transition_to(to) {
                task.apply(&write.patch);
            } else {
                // evicted while terminal: the store would refuse this patch too
                warn!(
                    target: "dashkernel::tasks",
                    task_id = %id,
                    from = %task.status,
                    %to,
                    "pending patch discarded: illegal status transition"
                );
                state.pending.remove(&id);
            }
        }
        Ok(Some(task))
    }

    /// `detail` for each id; misses are left out.
    pub async fn details(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, Task>, KernelError> {
        let mut lookups = JoinSet::new();
        for &id in ids {
            let manager = self.clone();
            lookups.spawn(async move { manager.detail(id).await });
        }

        let mut found = HashMap::with_capacity(ids.len());
        while let Some(joined) = lookups.join_next().await {
            let task = match joined {
                Ok(res) => res?,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => continue,
            };
            if let Some(task) = task {
                found.insert(task.id, task);
            }
        }
        Ok(found)
    }

    /// Request cooperative cancellation and interrupt every registered handle.
    ///
    /// Idempotent: handles are interrupted on the first request only.
    pub fn cancel(&self, id: TaskId) {
        if self.cached_terminal(id) {
            debug!(target: "dashkernel::tasks", task_id = %id, "cancel ignored: task already finished");
            return;
        }
        let Some(handles) = self.inner.cancellations.request(id) else {
            debug!(target: "dashkernel::tasks", task_id = %id, "cancel already requested");
            return;
        };

        info!(target: "dashkernel::tasks", task_id = %id, handles = handles.len(), "cancel requested");
        for handle in handles {
            handle.cancel();
        }
    }

    /// Cancellation checkpoint for worker code.
    ///
    /// If a cancel was requested, writes `Cancelled` (keeping the last progress
    /// text) and returns `KernelError::TaskCancelled`, which the worker should
    /// let propagate.
    pub fn check_cancel(&self, id: TaskId) -> Result<(), KernelError> {
        if !self.inner.cancellations.is_requested(id) {
            return Ok(());
        }
        self.update(TaskPatch::new(id).with_status(TaskStatus::Cancelled));
        Err(KernelError::TaskCancelled(id))
    }

    pub fn is_cancel_requested(&self, id: TaskId) -> bool {
        self.inner.cancellations.is_requested(id)
    }

    /// Attach an interruptible operation to `id`.
    ///
    /// If a cancel was already requested, `handle` is cancelled before this
    /// returns.
    pub fn register_task(&self, id: TaskId, handle: impl Cancellable + 'static) {
        let handle: Arc<dyn Cancellable> = Arc::new(handle);
        if self.cached_terminal(id) {
            return;
        }
        if self.inner.cancellations.register(id, Arc::clone(&handle)) {
            debug!(target: "dashkernel::tasks", task_id = %id, "registered after cancel; interrupting");
            handle.cancel();
        }
    }

    /// Startup sweep: every stored task still in `Init` or `InProgress` is
    /// moved to `Cancelled`. Returns the number of tasks swept.
    pub async fn cancel_all(&self) -> Result<u64, KernelError> {
        let swept = self
            .inner
            .store
            .cancel_unfinished(&self.inner.config.cancelled_progress, self.inner.clock.now())
            .await?;
        info!(target: "dashkernel::tasks", swept, "unfinished tasks cancelled");
        Ok(swept)
    }

    /// Start the periodic write-behind loop.
    pub fn spawn_flush_loop(&self) -> FlushLoop {
        FlushLoop::spawn(self.clone())
    }

    /// Ids with a patch not yet written to the store.
    pub fn pending_writes(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn cached_tasks(&self) -> usize {
        self.inner.lock().cache.len()
    }

    fn cached_terminal(&self, id: TaskId) -> bool {
        self.inner
            .lock()
            .cache
            .peek(id)
            .is_some_and(|task| task.status.is_terminal())
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{CancelFn, FixedClock};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Task>>);

    impl Recorder {
        fn statuses(&self) -> Vec<TaskStatus> {
            self.0.lock().unwrap().iter().map(|t| t.status).collect()
        }
    }

    impl TaskObserver for Recorder {
        fn on_task(&self, task: &Task) {
            self.0.lock().unwrap().push(task.clone());
        }
    }

    fn setup() -> (TaskManager, Arc<InMemoryTaskStore>, Arc<Recorder>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let manager = TaskManager::builder(store.clone())
            .observer(recorder.clone())
            .build()
            .unwrap();
        (manager, store, recorder)
    }

    #[tokio::test]
    async fn created_task_is_readable_before_any_flush() {
        let (manager, _store, recorder) = setup();
        let id = manager.create().await.unwrap();

        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Init);
        assert_eq!(task.progress.as_deref(), Some("task created"));
        assert_eq!(manager.pending_writes(), 1);
        assert_eq!(recorder.statuses(), vec![TaskStatus::Init]);
    }

    #[tokio::test]
    async fn update_without_id_is_ignored() {
        let (manager, _store, recorder) = setup();
        manager.create().await.unwrap();

        manager.update(TaskPatch::default().with_progress("lost"));
        assert_eq!(recorder.statuses().len(), 1);
    }

    #[tokio::test]
    async fn notification_carries_merged_state() {
        let (manager, _store, recorder) = setup();
        let id = manager.create().await.unwrap();

        manager.process(id, TaskInfo::progress("extracting audio"));
        manager.update(TaskPatch::new(id).with_result("{\"segments\":12}"));

        let last = recorder.0.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.status, TaskStatus::InProgress);
        assert_eq!(last.progress.as_deref(), Some("extracting audio"));
        assert_eq!(last.result.as_deref(), Some("{\"segments\":12}"));
    }

    #[tokio::test]
    async fn update_refreshes_updated_at() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let manager = TaskManager::builder(Arc::new(InMemoryTaskStore::new()))
            .clock(clock.clone())
            .build()
            .unwrap();
        let id = manager.create().await.unwrap();

        clock.advance(chrono::Duration::seconds(7));
        manager.process(id, TaskInfo::default());

        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.created_at, start);
        assert_eq!(task.updated_at, start + chrono::Duration::seconds(7));
    }

    #[tokio::test]
    async fn terminal_tasks_ignore_late_patches() {
        let (manager, _store, recorder) = setup();
        let id = manager.create().await.unwrap();

        manager.finish(id, TaskInfo::result("ok"));
        manager.process(id, TaskInfo::progress("99%"));
        manager.fail(id, TaskInfo::progress("late failure"));
        manager.update(TaskPatch::new(id).with_result("overwritten"));

        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result.as_deref(), Some("ok"));
        assert_eq!(recorder.statuses(), vec![TaskStatus::Init, TaskStatus::Done]);
    }

    #[tokio::test]
    async fn finished_task_stays_finished_after_eviction() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let config = TaskManagerConfig {
            cache_capacity: 1,
            ..TaskManagerConfig::default()
        };
        let manager = TaskManager::builder(store.clone())
            .observer(recorder.clone())
            .config(config)
            .build()
            .unwrap();

        let id = manager.create().await.unwrap();
        manager.finish(id, TaskInfo::result("ok"));
        manager.flush().await;
        manager.create().await.unwrap();
        assert_eq!(manager.cached_tasks(), 1);

        manager.process(id, TaskInfo::progress("late"));
        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result.as_deref(), Some("ok"));
        assert_eq!(manager.pending_writes(), 0);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let pushed: Vec<_> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.id == id)
            .map(|task| task.status)
            .collect();
        assert!(!pushed.contains(&TaskStatus::InProgress));
        assert_eq!(pushed.last(), Some(&TaskStatus::Done));

        manager.flush().await;
        assert_eq!(store.row(id).unwrap().status, "done");
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let (manager, _store, _recorder) = setup();
        let id = manager.create().await.unwrap();

        manager.process(id, TaskInfo::progress("10%"));
        manager.update(TaskPatch::new(id).with_status(TaskStatus::Init));

        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn failed_task_shows_error_as_progress() {
        let (manager, _store, _recorder) = setup();
        let id = manager.create().await.unwrap();

        manager.process(id, TaskInfo::progress("downloading"));
        manager.fail(id, TaskInfo::progress("HTTP 404"));

        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress.as_deref(), Some("HTTP 404"));
    }

    #[tokio::test]
    async fn cancel_then_checkpoint_marks_cancelled() {
        let (manager, _store, _recorder) = setup();
        let id = manager.create().await.unwrap();
        manager.process(id, TaskInfo::progress("transcribing 3/10"));

        manager.check_cancel(id).unwrap();
        manager.cancel(id);
        let err = manager.check_cancel(id).unwrap_err();

        assert!(matches!(err, KernelError::TaskCancelled(got) if got == id));
        let task = manager.detail(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.progress.as_deref(), Some("transcribing 3/10"));
    }

    #[tokio::test]
    async fn cancel_interrupts_registered_handles_once() {
        let (manager, _store, _recorder) = setup();
        let id = manager.create().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let token = CancellationToken::new();

        manager.register_task(id, token.clone());
        manager.register_task(
            id,
            CancelFn::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager.cancel(id);
        manager.cancel(id);

        assert!(token.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.is_cancel_requested(id));
    }

    #[tokio::test]
    async fn registering_after_cancel_interrupts_immediately() {
        let (manager, _store, _recorder) = setup();
        let id = manager.create().await.unwrap();
        manager.cancel(id);

        let token = CancellationToken::new();
        manager.register_task(id, token.clone());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn terminal_status_clears_cancellation_state() {
        let (manager, _store, _recorder) = setup();
        let id = manager.create().await.unwrap();
        manager.register_task(id, CancellationToken::new());
        manager.cancel(id);

        assert!(manager.check_cancel(id).is_err());
        assert!(!manager.is_cancel_requested(id));
        assert_eq!(manager.inner.cancellations.handle_count(id), 0);

        // a finished task cannot be cancelled again
        manager.cancel(id);
        assert!(!manager.is_cancel_requested(id));
    }

    #[tokio::test]
    async fn detail_misses_return_none() {
        let (manager, _store, _recorder) = setup();
        let ghost = TaskId::from_ulid(ulid::Ulid::new());
        assert!(manager.detail(ghost).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn details_skips_unknown_ids() {
        let (manager, _store, _recorder) = setup();
        let a = manager.create().await.unwrap();
        let b = manager.create().await.unwrap();
        let ghost = TaskId::from_ulid(ulid::Ulid::new());

        let found = manager.details(&[a, ghost, b]).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key(&a));
        assert!(found.contains_key(&b));
    }

    #[tokio::test]
    async fn evicted_task_is_read_back_with_pending_patch() {
        let store = Arc::new(InMemoryTaskStore::new());
        let config = TaskManagerConfig {
            cache_capacity: 1,
            ..TaskManagerConfig::default()
        };
        let manager = TaskManager::builder(store.clone())
            .config(config)
            .build()
            .unwrap();

        let first = manager.create().await.unwrap();
        manager.create().await.unwrap();
        assert_eq!(manager.cached_tasks(), 1);

        manager.process(first, TaskInfo::progress("still going"));
        let task = manager.detail(first).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.progress.as_deref(), Some("still going"));
    }

    #[tokio::test]
    async fn uncached_update_still_notifies() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let config = TaskManagerConfig {
            cache_capacity: 1,
            ..TaskManagerConfig::default()
        };
        let manager = TaskManager::builder(store)
            .observer(recorder.clone())
            .config(config)
            .build()
            .unwrap();

        let first = manager.create().await.unwrap();
        manager.create().await.unwrap();
        manager.process(first, TaskInfo::progress("background"));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let last = recorder.0.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.id, first);
        assert_eq!(last.progress.as_deref(), Some("background"));
    }

    #[tokio::test]
    async fn cancel_all_sweeps_unfinished_rows() {
        let (manager, store, _recorder) = setup();
        let running = manager.create().await.unwrap();
        let done = manager.create().await.unwrap();
        manager.process(running, TaskInfo::progress("half way"));
        manager.finish(done, TaskInfo::default());
        manager.flush().await;

        let swept = manager.cancel_all().await.unwrap();
        assert_eq!(swept, 1);

        let row = store.row(running).unwrap();
        assert_eq!(row.status, "cancelled");
        assert_eq!(row.progress.as_deref(), Some("task cancelled"));
        assert_eq!(store.row(done).unwrap().status, "done");
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let config = TaskManagerConfig {
            cache_capacity: 0,
            ..TaskManagerConfig::default()
        };
        let err = TaskManager::builder(Arc::new(InMemoryTaskStore::new()))
            .config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::Configuration(_)));
    }
}
