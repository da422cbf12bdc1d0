//! dashkernel-core
//!
//! Concurrency control and background-task orchestration for the desktop app's
//! media and AI jobs.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（TaskId, TaskStatus, Task, TaskPatch）
//! - **ports**: 抽象化レイヤー（TaskStore, TaskObserver, Cancellable, Clock, IdGenerator）
//! - **sync**: 並行制御（Semaphore, RateLimiter, ConcurrencyKernel）
//! - **tasks**: task ライフサイクル（TaskManager, キャッシュ, flush, 通知, キャンセル）
//! - **impls**: 実装（InMemoryTaskStore, BroadcastObserver）
//! - **observability**: スナップショット型
//! - **error**: エラー型

pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod sync;
pub mod tasks;

pub use domain::{Task, TaskId, TaskInfo, TaskPatch, TaskStatus};
pub use error::{ErrorKind, KernelError, StoreError};
pub use sync::{
    ConcurrencyKernel, ConcurrencyProfiles, CooperativeScheduler, Permit, RateLimiter, Semaphore,
    WaitOptions,
};
pub use tasks::{FlushLoop, TaskManager, TaskManagerConfig};
