//! Rollout planning — diff old vs. new deployment into ordered batches.
//!
//! The plan is pure: it reads two deployments and a teardown lookup and
//! says which roles each node gains or loses, and in which waves nodes are
//! configured. Nothing is persisted here.

use std::collections::BTreeMap;

use convoy_core::Deployment;

/// Role changes for one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDelta {
    pub remove: Vec<String>,
    pub add: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutPlan {
    /// Waves of nodes; wave N runs after wave N-1 finished everywhere.
    pub batches: Vec<Vec<String>>,
    /// Nodes with at least one role change.
    pub deltas: BTreeMap<String, NodeDelta>,
    /// Every node of a new element, first-seen order.
    pub targets: Vec<String>,
}

impl RolloutPlan {
    /// Build the plan for moving from `old` to `new`.
    ///
    /// `teardown` returns the teardown role registered for an element, if
    /// any; it is added to nodes leaving that element.
    ///
    /// Phases come from `new.element_order`, or from the old deployment
    /// when the new one has none. With neither, all elements of both
    /// deployments form a single phase.
    pub fn build<F>(old: Option<&Deployment>, new: &Deployment, teardown: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let empty = Deployment::default();
        let old = old.unwrap_or(&empty);
        let order = phase_order(old, new);

        let mut plan = RolloutPlan::default();
        for phase in &order {
            let mut batch: Vec<String> = Vec::new();
            for element in phase {
                let old_nodes = old.elements.get(element);
                let new_nodes = new.elements.get(element);

                if let Some(old_nodes) = old_nodes {
                    let teardown_role = teardown(element);
                    for node in old_nodes {
                        if new_nodes.is_some_and(|n| n.contains(node)) {
                            continue;
                        }
                        let delta = plan.deltas.entry(node.clone()).or_default();
                        delta.remove.push(element.clone());
                        if let Some(role) = &teardown_role {
                            delta.add.push(role.clone());
                        }
                        push_unique(&mut batch, node);
                    }
                }

                if let Some(new_nodes) = new_nodes {
                    for node in new_nodes {
                        push_unique(&mut plan.targets, node);
                        if !old_nodes.is_some_and(|n| n.contains(node)) {
                            plan.deltas.entry(node.clone()).or_default().add.push(element.clone());
                        }
                        push_unique(&mut batch, node);
                    }
                }
            }
            if !batch.is_empty() {
                plan.batches.push(batch);
            }
        }
        plan
    }

    pub fn is_target(&self, node: &str) -> bool {
        self.targets.iter().any(|t| t == node)
    }
}

fn phase_order(old: &Deployment, new: &Deployment) -> Vec<Vec<String>> {
    if !new.element_order.is_empty() {
        return new.element_order.clone();
    }
    if !old.element_order.is_empty() {
        return old.element_order.clone();
    }
    let mut all: Vec<String> = old.elements.keys().cloned().collect();
    for element in new.elements.keys() {
        push_unique(&mut all, element);
    }
    all.sort();
    vec![all]
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|i| i == item) {
        list.push(item.to_string());
    }
}
