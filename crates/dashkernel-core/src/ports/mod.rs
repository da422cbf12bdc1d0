//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! kernel は外部のもの（DB、UI への push、subprocess）を直接知らず、
//! ここにある trait 越しにだけ触ります。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）。ただし書き込みは write-behind
//! - TaskObserver への通知は best-effort
//! - Clock / IdGenerator はテストで差し替えるためのもの

pub mod cancellable;
pub mod clock;
pub mod id_generator;
pub mod observer;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::cancellable::{CancelFn, Cancellable};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::observer::{NoopObserver, TaskObserver};
pub use self::task_store::{TaskDraft, TaskRow, TaskStore};
