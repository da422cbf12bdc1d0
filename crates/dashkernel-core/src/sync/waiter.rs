//! FIFO waiter queue shared by `Semaphore` and `RateLimiter`.
//!
//! 待ち行列は自前で持つ（tokio の内部の公平性には頼らない）。
//! 各 waiter は oneshot で「許可」を受け取り、タイムアウト・キャンセル・
//! future の drop のいずれでも、ちょうど一度だけ決着します。

use std::collections::VecDeque;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::KernelError;

/// Deadline and external cancel signal for a suspendable call.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    /// No deadline, no cancel signal: wait as long as it takes.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

pub(crate) struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

impl Waiter {
    /// Hand the slot over. `false` if the receiving side is already gone.
    pub(crate) fn grant(self) -> bool {
        self.grant.send(()).is_ok()
    }
}

#[derive(Default)]
pub(crate) struct WaitQueue {
    next_id: u64,
    waiters: VecDeque<Waiter>,
}

impl WaitQueue {
    pub(crate) fn enqueue(&mut self) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { id, grant: tx });
        (id, rx)
    }

    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    /// Remove a waiter wherever it sits. Safe to call for an id that is gone.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => self.waiters.remove(pos).is_some(),
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// The primitive that owns a [`WaitQueue`].
pub(crate) trait WaitHost: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Take waiter `id` out of the queue. `false` if it was already granted.
    fn withdraw(&self, id: u64) -> bool;

    /// Return a grant that reached a waiter nobody is listening to any more.
    fn give_back(&self);
}

enum Outcome {
    Granted,
    TimedOut,
    Cancelled,
}

/// A queued request that has not been settled yet.
///
/// Grants are sent while the host holds its lock, and `withdraw` takes the
/// same lock, so once `withdraw` reports `false` the grant is already sitting
/// in `rx`.
pub(crate) struct PendingWait<H: WaitHost> {
    host: Arc<H>,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl<H: WaitHost> PendingWait<H> {
    pub(crate) fn new(host: Arc<H>, id: u64, rx: oneshot::Receiver<()>) -> Self {
        Self {
            host,
            id,
            rx,
            settled: false,
        }
    }

    pub(crate) async fn wait(mut self, opts: &WaitOptions) -> Result<(), KernelError> {
        let deadline = async {
            match opts.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => future::pending().await,
            }
        };
        let cancelled = async {
            match &opts.cancel {
                Some(token) => token.cancelled().await,
                None => future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            res = &mut self.rx => match res {
                Ok(()) => Outcome::Granted,
                // sender dropped without a grant: treat like a cancel
                Err(_) => Outcome::Cancelled,
            },
            _ = deadline => Outcome::TimedOut,
            _ = cancelled => Outcome::Cancelled,
        };

        self.settled = true;
        match outcome {
            Outcome::Granted => Ok(()),
            lost => {
                if !self.host.withdraw(self.id) && self.rx.try_recv().is_ok() {
                    // the grant won the race after all
                    return Ok(());
                }
                let name = self.host.name().to_string();
                match lost {
                    Outcome::TimedOut => {
                        debug!(target: "dashkernel::sync", primitive = %name, "wait timed out");
                        Err(KernelError::Timeout { name })
                    }
                    _ => {
                        debug!(target: "dashkernel::sync", primitive = %name, "wait cancelled");
                        Err(KernelError::Cancelled { name })
                    }
                }
            }
        }
    }
}

impl<H: WaitHost> Drop for PendingWait<H> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if !self.host.withdraw(self.id) && self.rx.try_recv().is_ok() {
            self.host.give_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_fifo_and_removal_keeps_order() {
        let mut queue = WaitQueue::default();
        let (a, _ra) = queue.enqueue();
        let (b, _rb) = queue.enqueue();
        let (c, _rc) = queue.enqueue();

        assert!(queue.remove(b));
        assert!(!queue.remove(b));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop_front().map(|w| w.id), Some(a));
        assert_eq!(queue.pop_front().map(|w| w.id), Some(c));
        assert!(queue.is_empty());
    }

    #[test]
    fn grant_reports_dropped_receiver() {
        let mut queue = WaitQueue::default();
        let (_, rx) = queue.enqueue();
        drop(rx);

        let waiter = queue.pop_front().unwrap();
        assert!(!waiter.grant());
    }

    #[test]
    fn options_report_fired_token() {
        let token = CancellationToken::new();
        let opts = WaitOptions::unbounded().with_cancel(token.clone());
        assert!(!opts.is_cancelled());

        token.cancel();
        assert!(opts.is_cancelled());
    }
}
