//! convoy-rollout — applying committed proposals to the fleet.
//!
//! A commit becomes an active role; the difference between the previous
//! and the new role is turned into run-list changes and into waves of
//! configuration passes run on the affected nodes.
//!
//! # Components
//!
//! - **`plan`** — pure diff of old vs. new deployment into batches
//! - **`controller`** — commit, apply, deactivate; implements the queue's
//!   `CommitHandler`
//! - **`executor`** — remote configuration passes (ssh) and batch fan-out
//! - **`service`** — per-service hooks and the registry that resolves them
//! - **`events`** — broadcast of finished rollouts
//! - **`outcome`** — commit results and their status codes

pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod outcome;
pub mod plan;
pub mod service;

pub use controller::RolloutController;
pub use error::{RolloutError, RolloutResult};
pub use events::{EventBus, RolloutEvent};
pub use executor::{ConfigurePass, ExecError, RemoteExecutor, SshExecutor, run_passes};
pub use outcome::CommitOutcome;
pub use plan::{NodeDelta, RolloutPlan};
pub use service::{CatalogHandler, DefaultHandler, ServiceHandler, ServiceRegistry};
