use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, bail};
use serde_json::json;
use tracing::{debug, info};

use convoy_core::ConvoyConfig;
use convoy_core::config::PathsConfig;
use convoy_rollout::{
    CommitOutcome, RemoteExecutor, RolloutController, ServiceRegistry, SshExecutor,
};
use convoy_scheduler::LockManager;
use convoy_state::{Node, ServiceInstance, StateError, StateStore};

/// File name of the state database inside the data directory.
pub const STORE_FILE: &str = "convoy.redb";

pub struct Context {
    store: StateStore,
    controller: RolloutController,
}

impl Context {
    /// Load the config and open the store, waiting while another convoyd
    /// process holds it.
    pub async fn open(config_path: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match config_path {
            Some(path) => ConvoyConfig::from_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => ConvoyConfig::default(),
        };
        if let Some(dir) = data_dir {
            let paths = config.paths.get_or_insert(PathsConfig {
                data_dir: None,
                lock_dir: None,
                log_dir: None,
            });
            paths.data_dir = Some(dir.to_path_buf());
        }

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        let db_path = data_dir.join(STORE_FILE);
        let store = loop {
            match StateStore::open(&db_path) {
                Ok(store) => break store,
                Err(StateError::Busy) => {
                    debug!(path = ?db_path, "state store busy, waiting");
                    tokio::time::sleep(config.lock_poll_interval()).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!(path = ?db_path, "state store opened");

        let locks = LockManager::new(config.lock_dir(), config.lock_poll_interval());
        let registry = ServiceRegistry::from_config(&config);
        debug!(services = ?registry.services(), "service handlers registered");
        let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(&config.executor()));
        let controller =
            RolloutController::new(store.clone(), locks, Arc::new(config), registry, executor);

        Ok(Self { store, controller })
    }
}

pub fn init(data_dir: Option<&Path>) -> anyhow::Result<()> {
    let data_dir = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => ConvoyConfig::default().data_dir(),
    };
    print!("{}", ConvoyConfig::scaffold(&data_dir).to_toml_string()?);
    Ok(())
}

fn print(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an outcome; outcomes of 400 and up fail the command.
fn report(outcome: CommitOutcome) -> anyhow::Result<()> {
    print(&json!({
        "status": outcome.status_code(),
        "body": outcome.payload(),
    }))?;
    if outcome.status_code() >= 400 {
        bail!("{outcome}");
    }
    Ok(())
}

pub async fn commit(ctx: &Context, service: &str, instance: &str) -> anyhow::Result<()> {
    report(ctx.controller.commit(service, instance, false).await)
}

pub async fn deactivate(ctx: &Context, service: &str, instance: &str) -> anyhow::Result<()> {
    report(ctx.controller.deactivate(service, instance).await)
}

pub async fn dequeue(ctx: &Context, service: &str, instance: &str) -> anyhow::Result<()> {
    let dequeued = ctx.controller.dequeue(service, instance).await?;
    print(&json!({ "dequeued": dequeued }))
}

pub async fn process_queue(ctx: &Context) -> anyhow::Result<()> {
    let report = ctx.controller.process_queue().await?;
    print(&serde_json::to_value(report)?)
}

pub async fn queue(ctx: &Context) -> anyhow::Result<()> {
    let entries = ctx.controller.queue().entries().await?;
    print(&serde_json::to_value(entries)?)
}

pub fn nodes(ctx: &Context) -> anyhow::Result<()> {
    print(&serde_json::to_value(ctx.store.list_nodes()?)?)
}

pub fn active(ctx: &Context, service: &str, instance: Option<&str>) -> anyhow::Result<()> {
    match instance {
        None => print(&json!(ctx.controller.list_active(service)?)),
        Some(instance) => match ctx.controller.show_active(service, instance)? {
            Some(role) => print(&serde_json::to_value(role)?),
            None => bail!("active instance not found: {service}.{instance}"),
        },
    }
}

pub fn propose(ctx: &Context, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut proposal: ServiceInstance = serde_json::from_str(&content)
        .with_context(|| format!("invalid proposal in {}", file.display()))?;
    // Runtime flags belong to the store, not to the file.
    proposal.queued = false;
    proposal.committing = false;

    if let Some(existing) = ctx.store.get_instance(&proposal.service, &proposal.instance)? {
        proposal.queued = existing.queued;
        proposal.committing = existing.committing;
        proposal.status = existing.status;
        proposal.last_error = existing.last_error;
    }
    ctx.store.put_instance(&proposal)?;
    info!(service = %proposal.service, instance = %proposal.instance, "proposal stored");
    print(&json!({ "stored": proposal.table_key() }))
}

pub fn add_node(ctx: &Context, name: &str, admin: bool) -> anyhow::Result<()> {
    let mut node = ctx.store.get_node(name)?.unwrap_or_else(|| Node::new(name));
    node.admin = admin;
    ctx.store.put_node(&node)?;
    print(&serde_json::to_value(node)?)
}
