//! Fire-and-forget push of task snapshots to the observer.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use crate::domain::Task;
use crate::ports::TaskObserver;

#[derive(Clone)]
pub struct Notifier {
    observer: Arc<dyn TaskObserver>,
}

impl Notifier {
    pub fn new(observer: Arc<dyn TaskObserver>) -> Self {
        Self { observer }
    }

    pub fn publish(&self, task: &Task) {
        self.observer.on_task(task);
    }

    /// Resolve the snapshot in the background, then publish it.
    ///
    /// Used when the merged state is not in memory and has to be read back.
    /// Nothing is sent if `lookup` yields `None` or no runtime is available.
    pub fn publish_detached<F>(&self, lookup: F)
    where
        F: Future<Output = Option<Task>> + Send + 'static,
    {
        let Ok(handle) = Handle::try_current() else {
            debug!(target: "dashkernel::tasks", "no runtime; notification skipped");
            return;
        };
        let observer = Arc::clone(&self.observer);
        handle.spawn(async move {
            if let Some(task) = lookup.await {
                observer.on_task(&task);
            }
        });
    }
}
