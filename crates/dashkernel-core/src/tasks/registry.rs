//! Cancellation registry.
//!
//! - `requested`: cancel 要求済みの task id（冪等）
//! - `handles`: worker が登録した中断ハンドル
//!
//! ハンドルの呼び出しはロックの外で行うため、ここでは一覧を返すだけです。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::TaskId;
use crate::ports::Cancellable;

type Handle = Arc<dyn Cancellable>;

#[derive(Default)]
struct RegistryState {
    requested: HashSet<TaskId>,
    handles: HashMap<TaskId, Vec<Handle>>,
}

#[derive(Default)]
pub struct CancellationRegistry {
    state: Mutex<RegistryState>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `id` as cancel-requested.
    ///
    /// Returns the handles to interrupt on the first request, `None` on a repeat.
    pub fn request(&self, id: TaskId) -> Option<Vec<Handle>> {
        let mut state = self.lock();
        if !state.requested.insert(id) {
            return None;
        }
        Some(state.handles.get(&id).cloned().unwrap_or_default())
    }

    pub fn is_requested(&self, id: TaskId) -> bool {
        self.lock().requested.contains(&id)
    }

    /// Record `handle` for `id`. Returns `true` if a cancel was already
    /// requested, in which case the caller must interrupt it right away.
    pub fn register(&self, id: TaskId, handle: Handle) -> bool {
        let mut state = self.lock();
        state.handles.entry(id).or_default().push(handle);
        state.requested.contains(&id)
    }

    /// Drop everything known about `id`.
    pub fn forget(&self, id: TaskId) {
        let mut state = self.lock();
        state.requested.remove(&id);
        state.handles.remove(&id);
    }

    pub fn handle_count(&self, id: TaskId) -> usize {
        self.lock().handles.get(&id).map_or(0, Vec::len)
    }
}
