//! Node assignment — readiness transitions and pending annotations.
//!
//! Every method here takes the node-assignment lock for its whole body.
//! Either all target nodes of an instance flip to `applying` together, or
//! none of them change state and each records what the instance intends to
//! add under `pending[{service}-{instance}]`.

use std::collections::BTreeSet;

use tracing::{debug, info};

use convoy_core::{ElementMap, InstanceRef, invert_elements};
use convoy_state::{NodeState, StateStore};

use crate::error::SchedulerResult;
use crate::lock::{LockManager, NODE_ASSIGNMENT_LOCK};
use crate::readiness::{NodeCache, not_ready};

/// Result of asking whether an instance may start now.
#[derive(Debug, Default)]
pub struct Admission {
    /// Nodes that caused a delay. Empty means the caller may proceed and
    /// every target node is now `applying` for it.
    pub delayed: BTreeSet<String>,
}

impl Admission {
    pub fn is_delayed(&self) -> bool {
        !self.delayed.is_empty()
    }
}

#[derive(Clone)]
pub struct NodeAssignments {
    store: StateStore,
    locks: LockManager,
}

impl NodeAssignments {
    pub fn new(store: StateStore, locks: LockManager) -> Self {
        Self { store, locks }
    }

    /// Flip all target nodes to `applying`, or annotate them as pending.
    ///
    /// With `force_queue` every target counts as delayed whatever its state.
    pub async fn annotate(
        &self,
        owner: &InstanceRef,
        elements: &ElementMap,
        force_queue: bool,
    ) -> SchedulerResult<Admission> {
        let by_node = invert_elements(elements);
        let targets: Vec<String> = by_node.keys().cloned().collect();
        let owner_key = owner.owner_key();

        let _lock = self.locks.acquire(NODE_ASSIGNMENT_LOCK).await?;

        let mut cache = NodeCache::new();
        let delayed = if force_queue {
            targets.iter().cloned().collect()
        } else {
            not_ready(&self.store, &targets, &mut cache)?
        };

        if delayed.is_empty() {
            for node in cache.values_mut() {
                node.state = NodeState::Applying;
                node.state_owner = owner_key.clone();
                node.pending.remove(&owner_key);
                self.store.put_node(node)?;
            }
            info!(%owner, nodes = cache.len(), "nodes marked applying");
        } else {
            for (name, wanted) in &by_node {
                if !cache.contains_key(name) {
                    match self.store.get_node(name)? {
                        Some(node) => {
                            cache.insert(name.clone(), node);
                        }
                        None => continue,
                    }
                }
                if let Some(node) = cache.get_mut(name) {
                    node.allocated = true;
                    node.pending.insert(owner_key.clone(), wanted.clone());
                    self.store.put_node(node)?;
                }
            }
            info!(%owner, delayed = ?delayed, force_queue, "nodes annotated pending");
        }

        Ok(Admission { delayed })
    }

    /// Clear the pending annotation `owner` left on the nodes of `elements`.
    pub async fn remove_pending(
        &self,
        owner: &InstanceRef,
        elements: &ElementMap,
    ) -> SchedulerResult<()> {
        let owner_key = owner.owner_key();
        let by_node = invert_elements(elements);

        let _lock = self.locks.acquire(NODE_ASSIGNMENT_LOCK).await?;
        for name in by_node.keys() {
            let Some(mut node) = self.store.get_node(name)? else {
                continue;
            };
            if node.pending.remove(&owner_key).is_some() {
                self.store.put_node(&node)?;
                debug!(%owner, node = %name, "pending annotation removed");
            }
        }
        Ok(())
    }

    /// Return nodes to `ready` with no owner.
    pub async fn restore_to_ready(&self, nodes: &[String]) -> SchedulerResult<()> {
        let _lock = self.locks.acquire(NODE_ASSIGNMENT_LOCK).await?;
        for name in nodes {
            let Some(mut node) = self.store.get_node(name)? else {
                continue;
            };
            node.state = NodeState::Ready;
            node.state_owner.clear();
            self.store.put_node(&node)?;
        }
        debug!(count = nodes.len(), "nodes restored to ready");
        Ok(())
    }

    /// Nodes among `nodes` that are not ready, checked under the lock.
    pub async fn delayed_nodes(&self, nodes: &[String]) -> SchedulerResult<BTreeSet<String>> {
        let _lock = self.locks.acquire(NODE_ASSIGNMENT_LOCK).await?;
        let mut cache = NodeCache::new();
        Ok(not_ready(&self.store, nodes, &mut cache)?)
    }
}
