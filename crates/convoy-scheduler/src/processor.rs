//! Queue processor — re-evaluates queued proposals and commits ready ones.
//!
//! One pass, under the queue lock: drop entries whose proposal vanished,
//! skip entries whose dependencies are still unsatisfied, and take the
//! entries whose nodes are all ready out of the queue. Then, outside the
//! lock, commit each taken entry through the [`CommitHandler`]. Passes
//! repeat while they commit something, since a finished commit can unblock
//! its dependents and a commit deferred again is re-evaluated next pass.
//!
//! Termination relies on the dependency graph being acyclic; cycles are
//! refused at enqueue time.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use convoy_core::{ConvoyConfig, InstanceRef};

use crate::error::SchedulerResult;
use crate::lock::QUEUE_LOCK;
use crate::queue::ProposalQueue;

/// What happened to a queued proposal handed back for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedCommit {
    Applied,
    /// Queued again (a dependency or node became busy in between).
    Deferred,
    Failed(String),
}

pub type CommitFuture<'a> = Pin<Box<dyn Future<Output = QueuedCommit> + Send + 'a>>;

/// Runs the commit of a proposal taken out of the queue.
///
/// Implementations must not start another queue processor run from inside
/// this call.
pub trait CommitHandler: Send + Sync {
    fn commit_queued<'a>(&'a self, instance: &'a InstanceRef) -> CommitFuture<'a>;
}

/// Summary of one `process` call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub passes: u32,
    pub committed: Vec<InstanceRef>,
    pub deferred: Vec<InstanceRef>,
    pub failed: Vec<InstanceRef>,
    /// Entries dropped because their proposal no longer exists.
    pub removed: Vec<InstanceRef>,
}

#[derive(Clone)]
pub struct QueueProcessor {
    queue: ProposalQueue,
    config: Arc<ConvoyConfig>,
}

impl QueueProcessor {
    pub fn new(queue: ProposalQueue, config: Arc<ConvoyConfig>) -> Self {
        Self { queue, config }
    }

    /// Run passes until one commits nothing.
    pub async fn process(&self, handler: &dyn CommitHandler) -> SchedulerResult<ProcessReport> {
        debug!("process queue: enter");
        let mut report = ProcessReport::default();

        loop {
            report.passes += 1;
            let ready = self.take_ready(&mut report).await?;
            if ready.is_empty() {
                break;
            }
            debug!(pass = report.passes, ready = ?ready, "process queue: committing");

            for instance in ready {
                match handler.commit_queued(&instance).await {
                    QueuedCommit::Applied => report.committed.push(instance),
                    QueuedCommit::Deferred => report.deferred.push(instance),
                    QueuedCommit::Failed(message) => {
                        warn!(%instance, %message, "queued proposal failed to apply");
                        report.failed.push(instance);
                    }
                }
            }
        }

        info!(
            passes = report.passes,
            committed = report.committed.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "process queue: exit"
        );
        Ok(report)
    }

    /// One locked pass: returns the entries to commit, in run order.
    async fn take_ready(&self, report: &mut ProcessReport) -> SchedulerResult<Vec<InstanceRef>> {
        let store = self.queue.store();
        let _lock = self.queue.locks().acquire(QUEUE_LOCK).await?;

        let Some(mut queue) = store.get_queue()? else {
            debug!("process queue: queue gone");
            return Ok(Vec::new());
        };
        if queue.is_empty() {
            debug!("process queue: empty queue");
            return Ok(Vec::new());
        }

        let mut remove = Vec::new();
        let mut ready = Vec::new();
        for entry in &queue {
            let owner = entry.reference();
            let Some(inst) = store.get_instance(&entry.service, &entry.instance)? else {
                debug!(%owner, "queued proposal vanished");
                remove.push(owner);
                continue;
            };
            if self.queue.dependencies_blocked(&entry.deps)? {
                continue;
            }
            // Current elements, not the queued snapshot.
            let nodes = inst.deployment.all_nodes();
            let delayed = self.queue.assignments().delayed_nodes(&nodes).await?;
            if delayed.is_empty() {
                ready.push(owner);
            } else {
                debug!(%owner, delayed = ?delayed, "queued proposal still waiting on nodes");
            }
        }

        let mut changed = false;
        for owner in remove.iter().chain(ready.iter()) {
            changed |= self.queue.dequeue_locked(&mut queue, owner).await?;
        }
        if changed {
            store.put_queue(&queue)?;
        }

        report.removed.extend(remove);
        ready.sort_by_key(|r| self.config.run_order(&r.service));
        Ok(ready)
    }
}
