//! convoy.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ordering value used when a service has no catalog entry.
pub const DEFAULT_ORDER: u32 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyConfig {
    pub paths: Option<PathsConfig>,
    pub locks: Option<LocksConfig>,
    pub executor: Option<ExecutorConfig>,
    /// Service catalog: service name → ordering values.
    pub services: Option<HashMap<String, ServiceCatalogEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub data_dir: Option<PathBuf>,
    pub lock_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Remote shell program (default `ssh`).
    pub program: Option<String>,
    /// Remote login user (default `root`).
    pub user: Option<String>,
    /// Wrap the remote shell in `sudo -i -u root --`.
    pub sudo: Option<bool>,
    /// Configuration pass command for ordinary nodes.
    pub command: Option<String>,
    /// Single-purpose configuration command for admin nodes.
    pub admin_command: Option<String>,
    /// Admin node refreshed after a rollout that touched no admin node.
    pub local_admin_node: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCatalogEntry {
    pub order: Option<u32>,
    pub run_order: Option<u32>,
    pub chef_order: Option<u32>,
    /// Services an instance of this service depends on. The instance of
    /// each is read from the proposal attribute `{service}_instance`.
    pub depends_on: Option<Vec<String>>,
}

impl ConvoyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConvoyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.paths
            .as_ref()
            .and_then(|p| p.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/lib/convoy"))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.paths
            .as_ref()
            .and_then(|p| p.lock_dir.clone())
            .unwrap_or_else(|| self.data_dir().join("locks"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths
            .as_ref()
            .and_then(|p| p.log_dir.clone())
            .unwrap_or_else(|| self.data_dir().join("log"))
    }

    pub fn lock_poll_interval(&self) -> Duration {
        let ms = self
            .locks
            .as_ref()
            .and_then(|l| l.poll_interval_ms)
            .unwrap_or(1000);
        Duration::from_millis(ms)
    }

    pub fn executor(&self) -> ExecutorConfig {
        self.executor.clone().unwrap_or_default()
    }

    fn catalog(&self, service: &str) -> Option<&ServiceCatalogEntry> {
        self.services.as_ref()?.get(service)
    }

    /// Rollout order of a service relative to other services.
    pub fn run_order(&self, service: &str) -> u32 {
        match self.catalog(service) {
            Some(entry) => entry.run_order.or(entry.order).unwrap_or(DEFAULT_ORDER),
            None => DEFAULT_ORDER,
        }
    }

    /// Run-list priority given to roles of a service.
    pub fn chef_order(&self, service: &str) -> u32 {
        match self.catalog(service) {
            Some(entry) => entry.chef_order.or(entry.order).unwrap_or(DEFAULT_ORDER),
            None => DEFAULT_ORDER,
        }
    }

    /// Services whose instances must be applied before this one.
    pub fn depends_on(&self, service: &str) -> Vec<String> {
        self.catalog(service)
            .and_then(|entry| entry.depends_on.clone())
            .unwrap_or_default()
    }

    /// Names of every service in the catalog.
    pub fn catalog_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Scaffold a config rooted at `data_dir`.
    pub fn scaffold(data_dir: &Path) -> Self {
        ConvoyConfig {
            paths: Some(PathsConfig {
                data_dir: Some(data_dir.to_path_buf()),
                lock_dir: None,
                log_dir: None,
            }),
            locks: Some(LocksConfig {
                poll_interval_ms: Some(1000),
            }),
            executor: Some(ExecutorConfig::default()),
            services: None,
        }
    }
}

impl ExecutorConfig {
    /// Command for ordinary nodes, falling back to the default.
    pub fn pass_command(&self) -> String {
        self.command
            .clone()
            .or(Self::default().command)
            .unwrap_or_default()
    }

    /// Command for admin nodes, falling back to the default.
    pub fn admin_pass_command(&self) -> String {
        self.admin_command
            .clone()
            .or(Self::default().admin_command)
            .unwrap_or_default()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: Some("ssh".to_string()),
            user: Some("root".to_string()),
            sudo: Some(true),
            command: Some("chef-client".to_string()),
            admin_command: Some("/opt/convoy/bin/single_chef_client.sh".to_string()),
            local_admin_node: None,
        }
    }
}
