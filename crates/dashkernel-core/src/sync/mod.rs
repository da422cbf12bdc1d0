//! Concurrency primitives and the keyed kernel around them.

pub mod kernel;
pub mod profiles;
pub mod rate_limiter;
pub mod scheduler;
pub mod semaphore;
mod waiter;

pub use kernel::ConcurrencyKernel;
pub use profiles::{
    ConcurrencyProfiles, DEFAULT_SCHEDULER, RateLimiterProfile, SchedulerProfile, SemaphoreProfile,
};
pub use rate_limiter::RateLimiter;
pub use scheduler::CooperativeScheduler;
pub use semaphore::{Permit, Semaphore};
pub use waiter::WaitOptions;
