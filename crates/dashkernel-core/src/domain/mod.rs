//! Domain model (ids, status state machine, task snapshots and patches).

pub mod ids;
pub mod status;
pub mod task;

pub use ids::{ParseTaskIdError, TaskId};
pub use status::{ParseStatusError, TaskStatus};
pub use task::{Task, TaskInfo, TaskPatch};
