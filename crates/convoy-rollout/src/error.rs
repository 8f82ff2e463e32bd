//! Rollout error types.

use thiserror::Error;

use convoy_scheduler::SchedulerError;
use convoy_state::StateError;

use crate::outcome::CommitOutcome;

#[derive(Debug, Error)]
pub enum RolloutError {
    /// The proposal was rejected by validation.
    #[error("invalid proposal: {0}")]
    Invalid(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl RolloutError {
    /// The request itself was refused, as opposed to failing internally.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RolloutError::Invalid(_) | RolloutError::Scheduler(SchedulerError::DependencyCycle(_))
        )
    }

    /// Caller-facing outcome: 400 for rejected input, 500 for the rest.
    pub fn into_outcome(self) -> CommitOutcome {
        match self {
            RolloutError::Invalid(message) => CommitOutcome::Invalid(message),
            RolloutError::Scheduler(e @ SchedulerError::DependencyCycle(_)) => {
                CommitOutcome::Invalid(e.to_string())
            }
            other => CommitOutcome::Internal(other.to_string()),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
