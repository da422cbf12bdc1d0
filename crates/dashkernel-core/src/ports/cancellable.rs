//! Cancellable port - 外部から中断できる操作
//!
//! worker は subprocess や HTTP 呼び出しなどの中断ハンドルを
//! `TaskManager::register_task` で登録し、`cancel` 要求時に呼び出してもらいます。

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Anything that can be asked to stop.
///
/// `cancel` must be cheap and must not block; it may be called more than once.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

impl Cancellable for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }
}

impl<T: Cancellable + ?Sized> Cancellable for Arc<T> {
    fn cancel(&self) {
        (**self).cancel();
    }
}

/// Adapts a closure into a [`Cancellable`].
pub struct CancelFn<F>(F);

impl<F> CancelFn<F>
where
    F: Fn() + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Cancellable for CancelFn<F>
where
    F: Fn() + Send + Sync,
{
    fn cancel(&self) {
        (self.0)();
    }
}

impl<F> fmt::Debug for CancelFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CancelFn")
    }
}
