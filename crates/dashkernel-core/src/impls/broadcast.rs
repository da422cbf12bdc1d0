//! BroadcastObserver - tokio broadcast channel への push
//!
//! UI 層はこれを subscribe してスナップショットを受け取ります。
//! 受信側が遅れて溢れた分は捨てられます（通知は best-effort）。

use tokio::sync::broadcast;

use crate::domain::Task;
use crate::ports::TaskObserver;

pub struct BroadcastObserver {
    tx: broadcast::Sender<Task>,
}

impl BroadcastObserver {
    /// `capacity` snapshots are buffered per lagging receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Task> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TaskObserver for BroadcastObserver {
    fn on_task(&self, task: &Task) {
        // no subscriber is fine
        let _ = self.tx.send(task.clone());
    }
}
