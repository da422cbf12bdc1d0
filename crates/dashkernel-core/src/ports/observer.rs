//! TaskObserver port - UI への push 通道
//!
//! 作成・更新のたびに、マージ後の完全なスナップショットが渡されます。
//! 配送は best-effort で、store への書き込みより先に届くこともあります。

use crate::domain::Task;

/// TaskObserver は task のスナップショットを受け取る
///
/// 呼び出しは manager のロックの外で行われますが、呼び出し元をブロックしないよう
/// 実装側で素早く返すこと（channel に積むだけ、など）。
pub trait TaskObserver: Send + Sync {
    fn on_task(&self, task: &Task);
}

/// Discards every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TaskObserver for NoopObserver {
    fn on_task(&self, _task: &Task) {}
}
