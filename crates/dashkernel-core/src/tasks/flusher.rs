//! Write-behind flush.
//!
//! 未書き込みバッファの「その時点のスナップショット」を書き、
//! 書いた版（version）が変わっていない id だけを消します。
//! 書き込み中に届いた patch は次の tick に回ります。
//! round は `flush_gate` で直列化し、古い round が新しい書き込みを上書きしないようにします。

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::manager::TaskManager;
use crate::domain::TaskId;
use crate::observability::FlushReport;

impl TaskManager {
    /// Write every pending patch once.
    ///
    /// Transient store errors keep the patch for the next round; permanent
    /// ones (the store refused the write) discard it. Errors are logged and
    /// never returned.
    ///
    /// Concurrent callers (the loop and an on-demand flush) take turns; a round
    /// starts only after the previous one has finished writing.
    pub async fn flush(&self) -> FlushReport {
        let _round = self.inner.flush_gate.lock().await;
        let batch: Vec<_> = {
            let state = self.inner.lock();
            state
                .pending
                .iter()
                .map(|(id, write)| (*id, write.patch.clone(), write.version))
                .collect()
        };

        let mut report = FlushReport::default();
        for (id, patch, version) in batch {
            match self.inner.store.write(id, &patch).await {
                Ok(()) => {
                    report.written += 1;
                    self.clear_flushed(id, version);
                }
                Err(e) if e.is_retryable() => {
                    report.failed += 1;
                    warn!(target: "dashkernel::flush", task_id = %id, error = %e, "write failed; retrying next tick");
                }
                Err(e) => {
                    report.dropped += 1;
                    warn!(target: "dashkernel::flush", task_id = %id, error = %e, "write refused; patch discarded");
                    self.clear_flushed(id, version);
                }
            }
        }

        if report != FlushReport::default() {
            debug!(
                target: "dashkernel::flush",
                written = report.written,
                failed = report.failed,
                dropped = report.dropped,
                "flush round"
            );
        }
        report
    }

    /// Remove the pending entry unless a newer patch arrived meanwhile.
    fn clear_flushed(&self, id: TaskId, version: u64) {
        let mut state = self.inner.lock();
        if state.pending.get(&id).is_some_and(|write| write.version == version) {
            state.pending.remove(&id);
        }
    }
}

/// Handle to the periodic flush task.
/// - `request_shutdown()` で止まる（最後に一度 flush してから抜ける）
/// - `shutdown_and_join()` で終了を待てる
pub struct FlushLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FlushLoop {
    pub(crate) fn spawn(manager: TaskManager) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = manager.config().flush_interval();
        let join = tokio::spawn(flush_loop(manager, period, shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop after a final flush round and wait for it.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn flush_loop(manager: TaskManager, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // sender dropped
                    break;
                }
            }
            _ = ticker.tick() => {
                manager.flush().await;
            }
        }
    }

    let report = manager.flush().await;
    info!(
        target: "dashkernel::flush",
        written = report.written,
        left = manager.pending_writes(),
        "flush loop stopped"
    );
}
