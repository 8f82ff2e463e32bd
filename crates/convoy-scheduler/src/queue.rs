//! Proposal queue — persisted list of deferred commits.
//!
//! An instance is queued when one of its dependencies has not succeeded
//! yet or one of its target nodes is busy. The queue holds at most one
//! entry per instance; queueing an already-queued instance is a no-op that
//! reports every node the instance targets.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use convoy_core::{ElementMap, InstanceRef, all_nodes};
use convoy_state::{QueueEntry, StateStore};

use crate::error::{SchedulerError, SchedulerResult};
use crate::lock::{LockManager, QUEUE_LOCK};
use crate::pending::{Admission, NodeAssignments};

#[derive(Clone)]
pub struct ProposalQueue {
    store: StateStore,
    locks: LockManager,
    assignments: NodeAssignments,
}

impl ProposalQueue {
    pub fn new(store: StateStore, locks: LockManager) -> Self {
        let assignments = NodeAssignments::new(store.clone(), locks.clone());
        Self {
            store,
            locks,
            assignments,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn assignments(&self) -> &NodeAssignments {
        &self.assignments
    }

    /// Admit an instance now or queue it.
    ///
    /// An empty `delayed` set in the result means the instance's nodes are
    /// now `applying` and the caller must run the rollout.
    pub async fn enqueue(
        &self,
        owner: &InstanceRef,
        elements: &ElementMap,
        deps: &[InstanceRef],
    ) -> SchedulerResult<Admission> {
        debug!(%owner, "queue proposal: enter");
        let _lock = self.locks.acquire(QUEUE_LOCK).await?;

        let mut queue = self.store.get_queue()?.unwrap_or_default();

        if queue.iter().any(|e| e.is_for(&owner.service, &owner.instance)) {
            debug!(%owner, "queue proposal: already queued");
            return Ok(Admission {
                delayed: all_nodes(elements).into_iter().collect(),
            });
        }

        let force_queue = self.dependencies_blocked(deps)?;
        if force_queue {
            if let Some(path) = find_cycle(&queue, owner, deps) {
                warn!(%owner, cycle = ?path, "refusing to queue a dependency cycle");
                return Err(SchedulerError::DependencyCycle(path));
            }
        }

        let admission = self.assignments.annotate(owner, elements, force_queue).await?;
        if !admission.is_delayed() {
            debug!(%owner, "queue proposal: nodes ready, not queued");
            return Ok(admission);
        }

        queue.push(QueueEntry {
            service: owner.service.clone(),
            instance: owner.instance.clone(),
            elements: elements.clone(),
            deps: deps.to_vec(),
        });
        self.store.put_queue(&queue)?;

        match self.store.get_instance(&owner.service, &owner.instance)? {
            Some(mut inst) => {
                inst.queued = true;
                self.store.put_instance(&inst)?;
            }
            None => warn!(%owner, "queued an instance that has no proposal"),
        }

        info!(%owner, delayed = ?admission.delayed, force_queue, "proposal queued");
        Ok(admission)
    }

    /// Remove `owner`'s entry from an already loaded queue.
    ///
    /// The caller holds the queue lock and persists `queue` afterwards.
    /// Returns true if an entry was removed.
    pub async fn dequeue_locked(
        &self,
        queue: &mut Vec<QueueEntry>,
        owner: &InstanceRef,
    ) -> SchedulerResult<bool> {
        let position = queue
            .iter()
            .position(|e| e.is_for(&owner.service, &owner.instance));
        let removed = position.map(|i| queue.remove(i));

        if let Some(entry) = &removed {
            self.assignments.remove_pending(owner, &entry.elements).await?;
        }

        if let Some(mut inst) = self.store.get_instance(&owner.service, &owner.instance)? {
            if inst.queued {
                inst.queued = false;
                self.store.put_instance(&inst)?;
            }
        }

        debug!(%owner, removed = removed.is_some(), "dequeue proposal");
        Ok(removed.is_some())
    }

    /// Remove `owner` from the queue.
    ///
    /// Returns true once the instance is no longer queued, whether or not
    /// it had an entry.
    pub async fn dequeue(&self, owner: &InstanceRef) -> SchedulerResult<bool> {
        let _lock = self.locks.acquire(QUEUE_LOCK).await?;
        let Some(mut queue) = self.store.get_queue()? else {
            debug!(%owner, "dequeue proposal: no queue");
            return Ok(true);
        };
        if self.dequeue_locked(&mut queue, owner).await? {
            self.store.put_queue(&queue)?;
        }
        Ok(true)
    }

    /// Snapshot of the queue, in queueing order.
    pub async fn entries(&self) -> SchedulerResult<Vec<QueueEntry>> {
        let _lock = self.locks.acquire(QUEUE_LOCK).await?;
        Ok(self.store.get_queue()?.unwrap_or_default())
    }

    /// True if any dependency is missing, queued, or has not succeeded.
    pub fn dependencies_blocked(&self, deps: &[InstanceRef]) -> SchedulerResult<bool> {
        for dep in deps {
            match self.store.get_instance(&dep.service, &dep.instance)? {
                None => {
                    debug!(%dep, "dependency missing");
                    return Ok(true);
                }
                Some(inst) if inst.queued || !inst.succeeded() => {
                    debug!(
                        %dep,
                        queued = inst.queued,
                        status = ?inst.status,
                        "dependency not satisfied"
                    );
                    return Ok(true);
                }
                Some(_) => {}
            }
        }
        Ok(false)
    }
}

/// Follow `deps` through the queued entries; if the walk comes back to
/// `owner`, return the path as `service/instance` strings.
fn find_cycle(
    queue: &[QueueEntry],
    owner: &InstanceRef,
    deps: &[InstanceRef],
) -> Option<Vec<String>> {
    fn walk(
        queue: &[QueueEntry],
        owner: &InstanceRef,
        deps: &[InstanceRef],
        path: &mut Vec<InstanceRef>,
        visited: &mut HashSet<InstanceRef>,
    ) -> bool {
        for dep in deps {
            path.push(dep.clone());
            if dep == owner {
                return true;
            }
            if visited.insert(dep.clone()) {
                if let Some(entry) = queue.iter().find(|e| e.is_for(&dep.service, &dep.instance)) {
                    if walk(queue, owner, &entry.deps, path, visited) {
                        return true;
                    }
                }
            }
            path.pop();
        }
        false
    }

    let mut path = vec![owner.clone()];
    let mut visited = HashSet::new();
    walk(queue, owner, deps, &mut path, &mut visited)
        .then(|| path.iter().map(ToString::to_string).collect())
}
