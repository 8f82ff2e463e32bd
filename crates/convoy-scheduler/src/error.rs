//! Scheduler error types.

use thiserror::Error;

use crate::lock::LockError;

/// Errors that can occur during queueing and dependency resolution.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queueing would close a dependency cycle; the path starts and ends
    /// at the instance being queued.
    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("state store error: {0}")]
    State(#[from] convoy_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
