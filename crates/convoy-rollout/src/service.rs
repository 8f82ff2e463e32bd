//! Per-service extension points and the registry that resolves them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use convoy_core::{ConvoyConfig, Deployment, InstanceRef};
use convoy_state::{Role, StateStore};

use crate::error::{RolloutError, RolloutResult};

pub type HookFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Behaviour a service can customise. Every method has a default.
pub trait ServiceHandler: Send + Sync {
    /// Instances that must have been applied before `role` can roll out.
    fn dependencies(&self, _role: &Role) -> Vec<InstanceRef> {
        Vec::new()
    }

    /// Reject a proposal before anything is touched.
    fn validate(&self, store: &StateStore, deployment: &Deployment) -> RolloutResult<()> {
        validate_elements(store, deployment)
    }

    /// Runs after run lists are updated and before the first batch. An
    /// error fails the rollout.
    fn before_rollout<'a>(
        &'a self,
        _old: Option<&'a Role>,
        _new: &'a Role,
        _targets: &'a [String],
    ) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Rejects elements that list a node twice or name an unknown node.
pub fn validate_elements(store: &StateStore, deployment: &Deployment) -> RolloutResult<()> {
    for (element, nodes) in &deployment.elements {
        let mut seen: Vec<&String> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if seen.contains(&node) {
                return Err(RolloutError::Invalid(format!(
                    "duplicate node {node} in element {element}"
                )));
            }
            seen.push(node);
            if store.get_node(node)?.is_none() {
                return Err(RolloutError::Invalid(format!("unknown node {node}")));
            }
        }
    }
    Ok(())
}

/// Handler with no customisation.
#[derive(Debug, Default, Clone)]
pub struct DefaultHandler;

impl ServiceHandler for DefaultHandler {}

/// Handler driven by the service catalog.
///
/// Depends on one instance of each service in `depends_on`; the instance
/// name comes from the proposal attribute `{service}_instance` and is
/// `default` when absent.
#[derive(Debug, Default, Clone)]
pub struct CatalogHandler {
    depends_on: Vec<String>,
}

impl CatalogHandler {
    pub fn new(depends_on: Vec<String>) -> Self {
        Self { depends_on }
    }
}

impl ServiceHandler for CatalogHandler {
    fn dependencies(&self, role: &Role) -> Vec<InstanceRef> {
        self.depends_on
            .iter()
            .map(|service| {
                let instance = role
                    .attributes
                    .get(format!("{service}_instance"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("default");
                InstanceRef::new(service, instance)
            })
            .collect()
    }
}

/// Service name → handler, fixed at startup.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CatalogHandler`] per service in the catalog.
    pub fn from_config(config: &ConvoyConfig) -> Self {
        let mut registry = Self::new();
        for service in config.catalog_services() {
            let handler = CatalogHandler::new(config.depends_on(&service));
            registry.register(&service, Arc::new(handler));
        }
        registry
    }

    /// Register (or replace) the handler for a service.
    pub fn register(&mut self, service: &str, handler: Arc<dyn ServiceHandler>) {
        debug!(service, "service handler registered");
        self.handlers.insert(service.to_string(), handler);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.get(service).cloned()
    }

    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
