//! convoy-scheduler — admission control for proposal commits.
//!
//! Decides whether a committed proposal may start rolling out now or has
//! to wait, and brings waiting proposals back once they can run:
//!
//! - Named cross-process locks serialize every read-modify-write of node
//!   state and of the queue
//! - Node readiness decides whether all target nodes are free
//! - Pending annotations record what a waiting instance will add to a node
//! - The proposal queue holds deferred commits with their dependencies
//! - The queue processor commits ready entries, in passes, until stable
//!
//! # Lock order
//!
//! ```text
//! queue              (ProposalQueue, QueueProcessor pass)
//!   └── node-assignment   (NodeAssignments, readiness checks)
//! ```
//!
//! Never take `queue` while holding `node-assignment`.

pub mod error;
pub mod lock;
pub mod pending;
pub mod processor;
pub mod queue;
pub mod readiness;

pub use error::{SchedulerError, SchedulerResult};
pub use lock::{LockError, LockGuard, LockManager, NODE_ASSIGNMENT_LOCK, QUEUE_LOCK};
pub use pending::{Admission, NodeAssignments};
pub use processor::{CommitFuture, CommitHandler, ProcessReport, QueueProcessor, QueuedCommit};
pub use queue::ProposalQueue;
pub use readiness::{NodeCache, not_ready};
