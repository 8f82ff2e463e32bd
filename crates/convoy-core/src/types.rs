//! Shared types used across Convoy crates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Element (role) name → ordered list of node names.
pub type ElementMap = BTreeMap<String, Vec<String>>;

/// Reference to one instance of a service, e.g. `database/default`.
///
/// Also the shape of a dependency: an instance depends on zero or more
/// other `InstanceRef`s having been applied successfully.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub service: String,
    pub instance: String,
}

impl InstanceRef {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
        }
    }

    /// Key used for node ownership and pending annotations: `{service}-{instance}`.
    pub fn owner_key(&self) -> String {
        format!("{}-{}", self.service, self.instance)
    }

    /// Name of the umbrella config role applied to every target node.
    pub fn config_role(&self) -> String {
        config_role_name(&self.service, &self.instance)
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.instance)
    }
}

/// `{service}-config-{instance}`
pub fn config_role_name(service: &str, instance: &str) -> String {
    format!("{service}-config-{instance}")
}

/// Name of the teardown role paired with an element, if one is registered.
pub fn teardown_role_name(element: &str) -> String {
    format!("{element}_remove")
}

/// Desired role assignment for one service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Element → nodes that should carry it.
    #[serde(default)]
    pub elements: ElementMap,
    /// Rollout phases. Elements in one phase are applied together; phase N
    /// starts only after phase N-1 has completed on every node.
    #[serde(default)]
    pub element_order: Vec<Vec<String>>,
    /// Optional per-role state hint copied into node run lists.
    #[serde(default)]
    pub element_states: BTreeMap<String, String>,
}

impl Deployment {
    /// Every node referenced by any element, de-duplicated, first-seen order.
    pub fn all_nodes(&self) -> Vec<String> {
        all_nodes(&self.elements)
    }
}

/// Every node referenced by `elements`, de-duplicated in first-seen order.
pub fn all_nodes(elements: &ElementMap) -> Vec<String> {
    let mut nodes: Vec<String> = Vec::new();
    for members in elements.values() {
        for node in members {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
    }
    nodes
}

/// Invert element → nodes into node → elements.
pub fn invert_elements(elements: &ElementMap) -> BTreeMap<String, Vec<String>> {
    let mut by_node: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (element, nodes) in elements {
        for node in nodes {
            let wanted = by_node.entry(node.clone()).or_default();
            if !wanted.contains(element) {
                wanted.push(element.clone());
            }
        }
    }
    by_node
}
