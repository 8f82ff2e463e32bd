//! Domain types for the Convoy object store.
//!
//! These types represent the persisted state of proposals (service
//! instances), nodes, roles and the proposal queue. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use convoy_core::{Deployment, ElementMap, InstanceRef, config_role_name};

// ── Service instance ──────────────────────────────────────────────

/// Outcome of the last rollout of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Success,
    Failed,
}

/// A proposal: the desired state of one instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: String,
    pub instance: String,
    #[serde(default)]
    pub description: String,
    pub deployment: Deployment,
    /// Service-specific configuration, opaque to the core.
    #[serde(default)]
    pub attributes: serde_json::Value,
    /// Waiting in the proposal queue.
    #[serde(default)]
    pub queued: bool,
    /// A commit is currently running.
    #[serde(default)]
    pub committing: bool,
    /// `None` until the first rollout finishes.
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub last_error: String,
}

impl ServiceInstance {
    pub fn new(service: &str, instance: &str, deployment: Deployment) -> Self {
        Self {
            service: service.to_string(),
            instance: instance.to_string(),
            description: String::new(),
            deployment,
            attributes: serde_json::Value::Null,
            queued: false,
            committing: false,
            status: None,
            last_error: String::new(),
        }
    }

    /// Composite key `{service}/{instance}`.
    pub fn table_key(&self) -> String {
        instance_key(&self.service, &self.instance)
    }

    pub fn reference(&self) -> InstanceRef {
        InstanceRef::new(&self.service, &self.instance)
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(InstanceStatus::Success)
    }

    /// The active role this proposal becomes when committed.
    pub fn to_role(&self) -> Role {
        Role {
            name: config_role_name(&self.service, &self.instance),
            description: self.description.clone(),
            service: self.service.clone(),
            instance: Some(self.instance.clone()),
            deployment: self.deployment.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Composite key for an instance.
pub fn instance_key(service: &str, instance: &str) -> String {
    format!("{service}/{instance}")
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Ready,
    Applying,
}

/// One applied role on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunListEntry {
    pub role: String,
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_hint: Option<String>,
}

/// A managed machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub state: NodeState,
    /// Owner key (`{service}-{instance}`) while `applying`, empty otherwise.
    #[serde(default)]
    pub state_owner: String,
    /// Owner key → elements that owner will add once the node is ready.
    #[serde(default)]
    pub pending: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub allocated: bool,
    /// Applied roles, ascending priority.
    #[serde(default)]
    pub run_list: Vec<RunListEntry>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: NodeState::Ready,
            state_owner: String::new(),
            pending: BTreeMap::new(),
            admin: false,
            allocated: false,
            run_list: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.run_list.iter().any(|e| e.role == role)
    }

    /// Insert a role after every entry of lower or equal priority.
    /// Returns false if the role was already present.
    pub fn add_to_run_list(
        &mut self,
        role: &str,
        priority: u32,
        state_hint: Option<String>,
    ) -> bool {
        if self.has_role(role) {
            return false;
        }
        let at = self
            .run_list
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(self.run_list.len());
        self.run_list.insert(
            at,
            RunListEntry {
                role: role.to_string(),
                priority,
                state_hint,
            },
        );
        true
    }

    /// Returns false if the role was not present.
    pub fn remove_from_run_list(&mut self, role: &str) -> bool {
        let before = self.run_list.len();
        self.run_list.retain(|e| e.role != role);
        before != self.run_list.len()
    }

    pub fn roles(&self) -> Vec<&str> {
        self.run_list.iter().map(|e| e.role.as_str()).collect()
    }
}

// ── Role ──────────────────────────────────────────────────────────

/// A named configuration role.
///
/// Config roles (`{service}-config-{instance}`) carry the committed
/// deployment of an instance. Element roles and teardown roles
/// (`{element}_remove`) only need to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub service: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub deployment: Deployment,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl Role {
    /// A plain role with no deployment (element or teardown role).
    pub fn element(name: &str, service: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            service: service.to_string(),
            instance: None,
            deployment: Deployment::default(),
            attributes: serde_json::Value::Null,
        }
    }
}

// ── Proposal queue ────────────────────────────────────────────────

/// A deferred commit waiting for dependencies and nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub service: String,
    pub instance: String,
    /// Elements as they were when the entry was queued.
    pub elements: ElementMap,
    #[serde(default)]
    pub deps: Vec<InstanceRef>,
}

impl QueueEntry {
    pub fn is_for(&self, service: &str, instance: &str) -> bool {
        self.service == service && self.instance == instance
    }

    pub fn reference(&self) -> InstanceRef {
        InstanceRef::new(&self.service, &self.instance)
    }
}
