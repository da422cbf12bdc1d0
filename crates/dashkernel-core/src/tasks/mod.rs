//! Task lifecycle: cache, write-behind flush, notifications and cooperative
//! cancellation around a [`TaskStore`](crate::ports::TaskStore).

pub mod cache;
pub mod config;
pub mod flusher;
pub mod manager;
pub mod notifier;
pub mod registry;

pub use cache::TaskCache;
pub use config::TaskManagerConfig;
pub use flusher::FlushLoop;
pub use manager::{TaskManager, TaskManagerBuilder};
pub use notifier::Notifier;
pub use registry::CancellationRegistry;
