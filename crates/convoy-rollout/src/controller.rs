//! Rollout controller — commits proposals and drives their rollouts.
//!
//! A commit asks the proposal queue for admission. Deferred commits return
//! 202 and are picked up later by the queue processor. Admitted commits
//! persist the active role, update node run lists, and configure nodes
//! batch by batch. Each batch runs ordinary nodes first, then admin nodes,
//! and a failing subset is retried once before the rollout fails. Whatever
//! the outcome, every admitted node returns to `ready` and, unless the
//! commit came from the queue processor itself, the processor runs
//! afterwards.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use convoy_core::{ConvoyConfig, Deployment, InstanceRef, config_role_name, teardown_role_name};
use convoy_scheduler::{
    CommitFuture, CommitHandler, LockManager, NODE_ASSIGNMENT_LOCK, ProcessReport, ProposalQueue,
    QueueProcessor, QueuedCommit, SchedulerError,
};
use convoy_state::{InstanceStatus, Role, StateStore};

use crate::error::RolloutResult;
use crate::events::{EventBus, RolloutEvent};
use crate::executor::{ConfigurePass, RemoteExecutor, pass_log_path, run_passes};
use crate::outcome::CommitOutcome;
use crate::plan::RolloutPlan;
use crate::service::{ServiceHandler, ServiceRegistry};

/// Attempts to return nodes to `ready` after a rollout errors out.
const RELEASE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct RolloutController {
    store: StateStore,
    queue: ProposalQueue,
    processor: QueueProcessor,
    registry: Arc<ServiceRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    config: Arc<ConvoyConfig>,
    events: EventBus,
}

impl RolloutController {
    pub fn new(
        store: StateStore,
        locks: LockManager,
        config: Arc<ConvoyConfig>,
        registry: ServiceRegistry,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Self {
        let queue = ProposalQueue::new(store.clone(), locks);
        let processor = QueueProcessor::new(queue.clone(), Arc::clone(&config));
        Self {
            store,
            queue,
            processor,
            registry: Arc::new(registry),
            executor,
            config,
            events: EventBus::new(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn queue(&self) -> &ProposalQueue {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Commit the proposal `service/instance`.
    ///
    /// `in_queue` is set when the queue processor is the caller; the
    /// processor is then not started again when the rollout ends.
    pub async fn commit(&self, service: &str, instance: &str, in_queue: bool) -> CommitOutcome {
        match self.try_commit(service, instance, in_queue).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(service, instance, error = %e, "commit failed");
                e.into_outcome()
            }
        }
    }

    async fn try_commit(
        &self,
        service: &str,
        instance: &str,
        in_queue: bool,
    ) -> RolloutResult<CommitOutcome> {
        let Some(handler) = self.registry.get(service) else {
            return Ok(CommitOutcome::NotFound(format!("no such service: {service}")));
        };
        let Some(mut proposal) = self.store.get_instance(service, instance)? else {
            return Ok(CommitOutcome::NotFound(format!(
                "cannot find proposal: {service}.{instance}"
            )));
        };
        if proposal.committing {
            return Ok(CommitOutcome::AlreadyCommitting(format!(
                "already committing: {service}.{instance}"
            )));
        }

        proposal.committing = true;
        self.store.put_instance(&proposal)?;
        info!(service, instance, in_queue, "commit: enter");

        let owner = proposal.reference();
        let result = match handler.validate(&self.store, &proposal.deployment) {
            Ok(()) => {
                self.apply_role(handler.as_ref(), &owner, proposal.to_role(), in_queue)
                    .await
            }
            Err(e) => Err(e),
        };

        // The rollout rewrote status fields; clear the flag on a fresh copy.
        match self.store.get_instance(service, instance) {
            Ok(Some(mut latest)) => {
                latest.committing = false;
                if let Err(e) = self.store.put_instance(&latest) {
                    error!(%owner, error = %e, "failed to clear committing flag");
                }
            }
            Ok(None) => warn!(%owner, "proposal vanished during commit"),
            Err(e) => error!(%owner, error = %e, "failed to clear committing flag"),
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_rejection() => {
                info!(%owner, error = %e, "proposal rejected");
                e.into_outcome()
            }
            Err(e) => return Err(e),
        };
        info!(%owner, code = outcome.status_code(), "commit: exit");
        Ok(outcome)
    }

    /// Make `role` the active configuration of `owner` and roll it out.
    pub async fn apply_role(
        &self,
        handler: &dyn ServiceHandler,
        owner: &InstanceRef,
        role: Role,
        in_queue: bool,
    ) -> RolloutResult<CommitOutcome> {
        let old_role = self.store.get_role(&role.name)?;

        let deps = handler.dependencies(&role);
        let admission = self
            .queue
            .enqueue(owner, &role.deployment.elements, &deps)
            .await?;
        if admission.is_delayed() {
            info!(%owner, delayed = ?admission.delayed, "rollout deferred");
            return Ok(CommitOutcome::Deferred(admission.delayed));
        }

        // Every node of the new deployment is now `applying` for `owner`,
        // including nodes of elements the phase order leaves out.
        let admitted = role.deployment.all_nodes();
        let result = self
            .roll_out(handler, owner, &role, old_role.as_ref(), &admitted, in_queue)
            .await;
        if result.is_err() {
            self.release_after_error(owner, &admitted).await;
        }
        result
    }

    async fn roll_out(
        &self,
        handler: &dyn ServiceHandler,
        owner: &InstanceRef,
        role: &Role,
        old_role: Option<&Role>,
        admitted: &[String],
        in_queue: bool,
    ) -> RolloutResult<CommitOutcome> {
        self.store.put_role(role)?;

        let old_deployment = old_role.map(|r| &r.deployment);
        let teardowns = self.registered_teardowns(old_deployment)?;
        let plan = RolloutPlan::build(old_deployment, &role.deployment, |element| {
            let name = teardown_role_name(element);
            teardowns.contains(&name).then_some(name)
        });
        debug!(%owner, batches = ?plan.batches, targets = ?plan.targets, "rollout planned");

        let admin_nodes = self.update_run_lists(owner, role, &plan).await?;

        if let Err(e) = handler.before_rollout(old_role, role, &plan.targets).await {
            let outcome = CommitOutcome::Failed {
                message: format!("Failed to prepare the proposal: {e:#}"),
                nodes: Vec::new(),
            };
            return self.finish_failed(owner, admitted, outcome, in_queue).await;
        }

        let executor = self.config.executor();
        let command = executor.pass_command();
        let admin_command = executor.admin_pass_command();

        let mut ran_admin = false;
        for (index, batch) in plan.batches.iter().enumerate() {
            let (admin, regular): (Vec<String>, Vec<String>) =
                batch.iter().cloned().partition(|n| admin_nodes.contains(n));
            debug!(%owner, batch = index, regular = ?regular, admin = ?admin, "running batch");
            ran_admin |= !admin.is_empty();

            for (nodes, pass_command) in [(regular, &command), (admin, &admin_command)] {
                if nodes.is_empty() {
                    continue;
                }
                let failed = self.configure_with_retry(owner, &nodes, pass_command).await;
                if !failed.is_empty() {
                    let outcome = CommitOutcome::failed_on(failed);
                    return self.finish_failed(owner, admitted, outcome, in_queue).await;
                }
            }
        }

        if !ran_admin {
            if let Some(node) = executor.local_admin_node.clone() {
                let passes = vec![self.pass(&node, &admin_command)];
                let results = run_passes(&self.executor, passes).await;
                if results.values().any(|ok| !ok) {
                    warn!(%owner, node = %node, "local admin refresh failed");
                }
            }
        }

        self.set_status(owner, InstanceStatus::Success, "")?;
        self.queue.assignments().restore_to_ready(admitted).await?;
        self.events.emit(RolloutEvent::Committed(owner.clone()));
        info!(%owner, nodes = plan.targets.len(), "rollout applied");

        if !in_queue {
            self.run_processor().await;
        }
        Ok(CommitOutcome::Applied)
    }

    /// Remove every element of the active role from its nodes, then delete
    /// the role.
    pub async fn deactivate(&self, service: &str, instance: &str) -> CommitOutcome {
        let owner = InstanceRef::new(service, instance);
        self.try_deactivate(&owner).await.unwrap_or_else(|e| {
            error!(%owner, error = %e, "deactivate failed");
            e.into_outcome()
        })
    }

    async fn try_deactivate(&self, owner: &InstanceRef) -> RolloutResult<CommitOutcome> {
        let Some(mut role) = self.store.get_role(&owner.config_role())? else {
            return Ok(CommitOutcome::NotFound("active instance not found".to_string()));
        };
        let Some(handler) = self.registry.get(&owner.service) else {
            return Ok(CommitOutcome::NotFound(format!("no such service: {}", owner.service)));
        };
        info!(%owner, "deactivating");
        role.deployment.elements.clear();
        let outcome = self.apply_role(handler.as_ref(), owner, role, false).await?;
        self.store.delete_role(&owner.config_role())?;
        Ok(outcome)
    }

    /// Put `node` into `element` of both the proposal and the active role
    /// and onto the node's run list, without a rollout.
    ///
    /// Returns false if the node does not exist.
    pub async fn assign_node(
        &self,
        service: &str,
        instance: &str,
        element: &str,
        node: &str,
    ) -> RolloutResult<bool> {
        let owner = InstanceRef::new(service, instance);
        let _lock = self
            .queue
            .locks()
            .acquire(NODE_ASSIGNMENT_LOCK)
            .await
            .map_err(SchedulerError::from)?;

        let Some(mut record) = self.store.get_node(node)? else {
            debug!(%owner, node, "assign node: no such node");
            return Ok(false);
        };

        let mut hints = BTreeMap::new();
        if let Some(mut proposal) = self.store.get_instance(service, instance)? {
            hints = proposal.deployment.element_states.clone();
            let members = proposal.deployment.elements.entry(element.to_string()).or_default();
            if !members.iter().any(|n| n == node) {
                members.push(node.to_string());
                self.store.put_instance(&proposal)?;
                debug!(%owner, node, element, "proposal updated");
            }
        }
        if let Some(mut role) = self.store.get_role(&owner.config_role())? {
            let members = role.deployment.elements.entry(element.to_string()).or_default();
            if !members.iter().any(|n| n == node) {
                members.push(node.to_string());
                self.store.put_role(&role)?;
                debug!(%owner, node, element, "active role updated");
            }
        }

        let priority = self.config.chef_order(service);
        let mut changed = record.add_to_run_list(element, priority, hints.get(element).cloned());
        changed |= record.add_to_run_list(&owner.config_role(), priority, None);
        if changed {
            self.store.put_node(&record)?;
        }
        Ok(true)
    }

    /// Instance names with an active role for `service`.
    pub fn list_active(&self, service: &str) -> RolloutResult<Vec<String>> {
        let prefix = config_role_name(service, "");
        let roles = self.store.list_roles(&prefix)?;
        Ok(roles
            .into_iter()
            .filter_map(|r| r.name.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub fn show_active(&self, service: &str, instance: &str) -> RolloutResult<Option<Role>> {
        Ok(self.store.get_role(&config_role_name(service, instance))?)
    }

    /// Take `service/instance` out of the queue.
    pub async fn dequeue(&self, service: &str, instance: &str) -> RolloutResult<bool> {
        Ok(self.queue.dequeue(&InstanceRef::new(service, instance)).await?)
    }

    /// Run the queue processor now.
    pub async fn process_queue(&self) -> RolloutResult<ProcessReport> {
        Ok(self.processor.process(self).await?)
    }

    /// Best-effort return of `nodes` to `ready` after a rollout errored
    /// out, so a store or lock failure does not leave them `applying`.
    async fn release_after_error(&self, owner: &InstanceRef, nodes: &[String]) {
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.queue.assignments().restore_to_ready(nodes).await {
                Ok(()) => {
                    warn!(%owner, nodes = ?nodes, "nodes released after rollout error");
                    return;
                }
                Err(e) => {
                    warn!(%owner, attempt, error = %e, "failed to release nodes");
                    tokio::time::sleep(self.config.lock_poll_interval()).await;
                }
            }
        }
        error!(%owner, nodes = ?nodes, "nodes left applying after rollout error");
    }

    async fn run_processor(&self) {
        if let Err(e) = self.process_queue().await {
            error!(error = %e, "queue processing failed");
        }
    }

    /// Teardown roles that exist for elements of the old deployment.
    fn registered_teardowns(&self, old: Option<&Deployment>) -> RolloutResult<HashSet<String>> {
        let mut found = HashSet::new();
        for element in old.into_iter().flat_map(|d| d.elements.keys()) {
            let name = teardown_role_name(element);
            if self.store.get_role(&name)?.is_some() {
                found.insert(name);
            }
        }
        Ok(found)
    }

    /// Apply the plan's role deltas to node run lists. Returns the admin
    /// nodes among the nodes the plan configures.
    async fn update_run_lists(
        &self,
        owner: &InstanceRef,
        role: &Role,
        plan: &RolloutPlan,
    ) -> RolloutResult<BTreeSet<String>> {
        let priority = self.config.chef_order(&owner.service);
        let hints = &role.deployment.element_states;

        let _lock = self
            .queue
            .locks()
            .acquire(NODE_ASSIGNMENT_LOCK)
            .await
            .map_err(SchedulerError::from)?;

        for (name, delta) in &plan.deltas {
            let Some(mut node) = self.store.get_node(name)? else {
                debug!(%owner, node = %name, "node vanished, skipping run list update");
                continue;
            };

            let mut changed = false;
            for r in &delta.remove {
                changed |= node.remove_from_run_list(r);
            }
            for a in &delta.add {
                changed |= node.add_to_run_list(a, priority, hints.get(a).cloned());
            }
            if plan.is_target(name) {
                let hint = hints.get(&role.name).cloned();
                changed |= node.add_to_run_list(&role.name, priority, hint);
            } else {
                changed |= node.remove_from_run_list(&role.name);
            }

            if changed {
                debug!(%owner, node = %name, run_list = ?node.roles(), "saving run list");
                self.store.put_node(&node)?;
            }
        }

        let mut admin = BTreeSet::new();
        for name in plan.batches.iter().flatten() {
            if admin.contains(name) {
                continue;
            }
            if self.store.get_node(name)?.is_some_and(|n| n.admin) {
                admin.insert(name.clone());
            }
        }
        Ok(admin)
    }

    /// Run the pass on `nodes`, re-run it once on the ones that failed, and
    /// return the nodes that failed twice.
    async fn configure_with_retry(
        &self,
        owner: &InstanceRef,
        nodes: &[String],
        command: &str,
    ) -> Vec<String> {
        let passes = nodes.iter().map(|n| self.pass(n, command)).collect();
        let failed = failed_nodes(run_passes(&self.executor, passes).await);
        if failed.is_empty() {
            return failed;
        }

        warn!(%owner, nodes = ?failed, "re-running configuration pass after failure");
        let passes = failed.iter().map(|n| self.pass(n, command)).collect();
        failed_nodes(run_passes(&self.executor, passes).await)
    }

    fn pass(&self, node: &str, command: &str) -> ConfigurePass {
        ConfigurePass {
            node: node.to_string(),
            command: command.to_string(),
            log_path: Some(pass_log_path(&self.config.log_dir(), node)),
        }
    }

    async fn finish_failed(
        &self,
        owner: &InstanceRef,
        admitted: &[String],
        outcome: CommitOutcome,
        in_queue: bool,
    ) -> RolloutResult<CommitOutcome> {
        let message = match &outcome {
            CommitOutcome::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        warn!(%owner, %message, "rollout failed");

        self.set_status(owner, InstanceStatus::Failed, &message)?;
        self.queue.assignments().restore_to_ready(admitted).await?;
        if !in_queue {
            self.run_processor().await;
        }
        Ok(outcome)
    }

    fn set_status(
        &self,
        owner: &InstanceRef,
        status: InstanceStatus,
        message: &str,
    ) -> RolloutResult<()> {
        let Some(mut proposal) = self.store.get_instance(&owner.service, &owner.instance)? else {
            warn!(%owner, "no proposal to record status on");
            return Ok(());
        };
        proposal.status = Some(status);
        proposal.last_error = message.to_string();
        self.store.put_instance(&proposal)?;
        Ok(())
    }
}

impl CommitHandler for RolloutController {
    fn commit_queued<'a>(&'a self, instance: &'a InstanceRef) -> CommitFuture<'a> {
        Box::pin(async move {
            match self.commit(&instance.service, &instance.instance, true).await {
                CommitOutcome::Applied => QueuedCommit::Applied,
                CommitOutcome::Deferred(_) => QueuedCommit::Deferred,
                other => QueuedCommit::Failed(other.to_string()),
            }
        })
    }
}

fn failed_nodes(results: BTreeMap<String, bool>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|(node, ok)| (!ok).then_some(node))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use convoy_core::config::{ExecutorConfig, LocksConfig, PathsConfig};
    use convoy_core::ElementMap;
    use convoy_state::{Node, NodeState, ServiceInstance};

    use crate::executor::{ExecError, ExecFuture};
    use crate::service::{CatalogHandler, DefaultHandler, HookFuture};

    /// Records every pass; nodes fail a set number of times, or always.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<(String, String)>>,
        fail_times: Mutex<HashMap<String, u32>>,
        always_fail: Vec<String>,
    }

    impl Scripted {
        fn failing_always(nodes: &[&str]) -> Self {
            Self {
                always_fail: nodes.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }

        fn failing_once(nodes: &[&str]) -> Self {
            let scripted = Self::default();
            for n in nodes {
                scripted.fail_times.lock().unwrap().insert(n.to_string(), 1);
            }
            scripted
        }

        fn nodes(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    impl RemoteExecutor for Scripted {
        fn run<'a>(&'a self, pass: &'a ConfigurePass) -> ExecFuture<'a> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((pass.node.clone(), pass.command.clone()));
                if self.always_fail.contains(&pass.node) {
                    return Ok(1);
                }
                let mut remaining = self.fail_times.lock().unwrap();
                match remaining.get_mut(&pass.node) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        Ok(1)
                    }
                    _ => Ok::<i32, ExecError>(0),
                }
            })
        }
    }

    struct FailingHook;

    impl ServiceHandler for FailingHook {
        fn before_rollout<'a>(
            &'a self,
            _old: Option<&'a Role>,
            _new: &'a Role,
            _targets: &'a [String],
        ) -> HookFuture<'a> {
            Box::pin(async { Err(anyhow::anyhow!("database not reachable")) })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: StateStore,
        scripted: Arc<Scripted>,
        controller: RolloutController,
    }

    fn harness(scripted: Scripted) -> Harness {
        harness_with(scripted, ExecutorConfig::default(), |_| {})
    }

    fn harness_with(
        scripted: Scripted,
        executor: ExecutorConfig,
        extra: impl FnOnce(&mut ServiceRegistry),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let config = ConvoyConfig {
            paths: Some(PathsConfig {
                data_dir: Some(dir.path().to_path_buf()),
                lock_dir: None,
                log_dir: None,
            }),
            locks: Some(LocksConfig {
                poll_interval_ms: Some(10),
            }),
            executor: Some(executor),
            services: None,
        };
        let locks = LockManager::new(config.lock_dir(), config.lock_poll_interval());

        let mut registry = ServiceRegistry::new();
        registry.register("database", Arc::new(DefaultHandler));
        registry.register("keystone", Arc::new(CatalogHandler::new(vec!["database".into()])));
        extra(&mut registry);

        let scripted = Arc::new(scripted);
        let executor: Arc<dyn RemoteExecutor> = scripted.clone();
        let controller =
            RolloutController::new(store.clone(), locks, Arc::new(config), registry, executor);
        Harness {
            _dir: dir,
            store,
            scripted,
            controller,
        }
    }

    fn elements(pairs: &[(&str, &[&str])]) -> ElementMap {
        pairs
            .iter()
            .map(|(e, nodes)| (e.to_string(), nodes.iter().map(|n| n.to_string()).collect()))
            .collect()
    }

    fn propose(
        store: &StateStore,
        service: &str,
        instance: &str,
        pairs: &[(&str, &[&str])],
        order: &[&[&str]],
    ) -> ServiceInstance {
        let deployment = Deployment {
            elements: elements(pairs),
            element_order: order
                .iter()
                .map(|phase| phase.iter().map(|e| e.to_string()).collect())
                .collect(),
            ..Default::default()
        };
        let proposal = ServiceInstance::new(service, instance, deployment);
        store.put_instance(&proposal).unwrap();
        proposal
    }

    fn add_nodes(store: &StateStore, names: &[&str]) {
        for n in names {
            store.put_node(&Node::new(n)).unwrap();
        }
    }

    fn node(store: &StateStore, name: &str) -> Node {
        store.get_node(name).unwrap().unwrap()
    }

    #[tokio::test]
    async fn fresh_commit_runs_batches_in_order() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "n2", "n3"]);
        propose(
            &h.store,
            "database",
            "default",
            &[("A", &["n1"]), ("B", &["n2"]), ("C", &["n1", "n3"])],
            &[&["A", "B"], &["C"]],
        );
        let mut events = h.controller.events().subscribe();

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome, CommitOutcome::Applied);

        let ran = h.scripted.nodes();
        assert_eq!(ran.len(), 4);
        let first: BTreeSet<_> = ran[..2].iter().cloned().collect();
        let second: BTreeSet<_> = ran[2..].iter().cloned().collect();
        assert_eq!(first, ["n1".to_string(), "n2".to_string()].into());
        assert_eq!(second, ["n1".to_string(), "n3".to_string()].into());

        for name in ["n1", "n2", "n3"] {
            let n = node(&h.store, name);
            assert!(n.is_ready());
            assert!(n.state_owner.is_empty());
            assert!(n.has_role("database-config-default"));
        }
        assert_eq!(node(&h.store, "n1").roles(), vec!["A", "C", "database-config-default"]);

        let proposal = h.store.get_instance("database", "default").unwrap().unwrap();
        assert!(proposal.succeeded());
        assert!(!proposal.committing);
        assert!(h.controller.show_active("database", "default").unwrap().is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            RolloutEvent::Committed(InstanceRef::new("database", "default"))
        );
    }

    #[tokio::test]
    async fn persistent_failure_fails_and_restores_targets() {
        let h = harness(Scripted::failing_always(&["n3"]));
        add_nodes(&h.store, &["n1", "n2", "n3"]);
        propose(
            &h.store,
            "database",
            "default",
            &[("A", &["n1"]), ("B", &["n2"]), ("C", &["n1", "n3"])],
            &[&["A", "B"], &["C"]],
        );

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome.status_code(), 405);
        assert_eq!(
            outcome.payload(),
            serde_json::json!("Failed to apply the proposal to: n3")
        );

        // n3 ran, failed, and was retried once.
        assert_eq!(h.scripted.nodes().iter().filter(|n| *n == "n3").count(), 2);
        for name in ["n1", "n2", "n3"] {
            assert!(node(&h.store, name).is_ready());
        }
        let proposal = h.store.get_instance("database", "default").unwrap().unwrap();
        assert_eq!(proposal.status, Some(InstanceStatus::Failed));
        assert_eq!(proposal.last_error, "Failed to apply the proposal to: n3");
    }

    #[tokio::test]
    async fn failed_batch_stops_later_batches() {
        let h = harness(Scripted::failing_always(&["n1"]));
        add_nodes(&h.store, &["n1", "n2"]);
        propose(
            &h.store,
            "database",
            "default",
            &[("A", &["n1"]), ("B", &["n2"])],
            &[&["A"], &["B"]],
        );

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome.status_code(), 405);

        assert_eq!(h.scripted.nodes(), vec!["n1", "n1"]);
        assert!(node(&h.store, "n1").is_ready());
        let n2 = node(&h.store, "n2");
        assert!(n2.is_ready());
        assert!(n2.state_owner.is_empty());
    }

    #[tokio::test]
    async fn nodes_of_unordered_elements_are_released() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "n2"]);
        propose(
            &h.store,
            "database",
            "default",
            &[("A", &["n1"]), ("B", &["n2"])],
            &[&["A"]],
        );

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome, CommitOutcome::Applied);
        assert_eq!(h.scripted.nodes(), vec!["n1"]);
        for name in ["n1", "n2"] {
            let n = node(&h.store, name);
            assert!(n.is_ready(), "{name} left applying");
            assert!(n.state_owner.is_empty());
        }

        // Another instance can now take n2.
        propose(&h.store, "keystone", "default", &[("ks", &["n2"])], &[&["ks"]]);
        let outcome = h.controller.commit("keystone", "default", false).await;
        assert_eq!(outcome, CommitOutcome::Applied);
    }

    #[tokio::test]
    async fn unordered_element_nodes_are_released_on_failure() {
        let h = harness(Scripted::failing_always(&["n1"]));
        add_nodes(&h.store, &["n1", "n2"]);
        propose(
            &h.store,
            "database",
            "default",
            &[("A", &["n1"]), ("B", &["n2"])],
            &[&["A"]],
        );

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome.status_code(), 405);
        assert!(node(&h.store, "n1").is_ready());
        assert!(node(&h.store, "n2").is_ready());
    }

    /// Turns the node-assignment lock file into a directory while a pass
    /// runs, and puts it back once the rollout has recorded its status.
    struct LockBreaker {
        lock_file: std::path::PathBuf,
        store: StateStore,
    }

    impl RemoteExecutor for LockBreaker {
        fn run<'a>(&'a self, _pass: &'a ConfigurePass) -> ExecFuture<'a> {
            Box::pin(async move {
                let _ = std::fs::remove_file(&self.lock_file);
                std::fs::create_dir(&self.lock_file).unwrap();

                let lock_file = self.lock_file.clone();
                let store = self.store.clone();
                std::thread::spawn(move || {
                    for _ in 0..5000 {
                        let status = store
                            .get_instance("database", "default")
                            .ok()
                            .flatten()
                            .and_then(|p| p.status);
                        if status.is_some() {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    let _ = std::fs::remove_dir(&lock_file);
                });
                Ok::<i32, ExecError>(0)
            })
        }
    }

    #[tokio::test]
    async fn lock_error_after_admission_releases_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let config = ConvoyConfig {
            paths: Some(PathsConfig {
                data_dir: Some(dir.path().to_path_buf()),
                lock_dir: None,
                log_dir: None,
            }),
            locks: Some(LocksConfig {
                poll_interval_ms: Some(20),
            }),
            ..Default::default()
        };
        let locks = LockManager::new(config.lock_dir(), config.lock_poll_interval());
        let executor: Arc<dyn RemoteExecutor> = Arc::new(LockBreaker {
            lock_file: config.lock_dir().join(format!("{NODE_ASSIGNMENT_LOCK}.lock")),
            store: store.clone(),
        });
        let mut registry = ServiceRegistry::new();
        registry.register("database", Arc::new(DefaultHandler));
        let controller =
            RolloutController::new(store.clone(), locks, Arc::new(config), registry, executor);

        add_nodes(&store, &["n1"]);
        propose(&store, "database", "default", &[("db", &["n1"])], &[&["db"]]);

        // The first release fails on the broken lock; a later attempt
        // succeeds once the lock file is back.
        let outcome = controller.commit("database", "default", false).await;
        assert!(matches!(outcome.status_code(), 200 | 500), "{outcome}");

        let n1 = node(&store, "n1");
        assert!(n1.is_ready());
        assert!(n1.state_owner.is_empty());
        assert!(!store.get_instance("database", "default").unwrap().unwrap().committing);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let h = harness(Scripted::failing_once(&["n2"]));
        add_nodes(&h.store, &["n1", "n2"]);
        propose(&h.store, "database", "default", &[("db", &["n1", "n2"])], &[&["db"]]);

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome, CommitOutcome::Applied);
        assert_eq!(h.scripted.nodes().len(), 3);
    }

    #[tokio::test]
    async fn dependent_commit_is_deferred_then_applied() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "n2"]);
        propose(
            &h.store,
            "database",
            "I1",
            &[("database-server", &["n1"])],
            &[&["database-server"]],
        );
        let mut keystone = propose(
            &h.store,
            "keystone",
            "I2",
            &[("keystone-server", &["n2"])],
            &[&["keystone-server"]],
        );
        keystone.attributes = serde_json::json!({ "database_instance": "I1" });
        h.store.put_instance(&keystone).unwrap();

        let outcome = h.controller.commit("keystone", "I2", false).await;
        assert_eq!(outcome, CommitOutcome::Deferred(["n2".to_string()].into()));
        assert!(h.scripted.nodes().is_empty());
        assert!(node(&h.store, "n2").pending.contains_key("keystone-I2"));
        assert!(h.store.get_instance("keystone", "I2").unwrap().unwrap().queued);

        // Applying the dependency drains the queue.
        let outcome = h.controller.commit("database", "I1", false).await;
        assert_eq!(outcome, CommitOutcome::Applied);

        let keystone = h.store.get_instance("keystone", "I2").unwrap().unwrap();
        assert!(keystone.succeeded());
        assert!(!keystone.queued);
        assert!(h.controller.queue().entries().await.unwrap().is_empty());
        assert_eq!(h.scripted.nodes(), vec!["n1", "n2"]);
        let n2 = node(&h.store, "n2");
        assert!(n2.is_ready());
        assert!(n2.pending.is_empty());
    }

    #[tokio::test]
    async fn busy_node_defers_until_processed() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1"]);
        let mut busy = node(&h.store, "n1");
        busy.state = NodeState::Applying;
        busy.state_owner = "other-x".into();
        h.store.put_node(&busy).unwrap();
        propose(&h.store, "database", "default", &[("db", &["n1"])], &[&["db"]]);

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome.status_code(), 202);
        assert!(!h.store.get_instance("database", "default").unwrap().unwrap().committing);

        h.store.put_node(&Node::new("n1")).unwrap();
        let report = h.controller.process_queue().await.unwrap();
        assert_eq!(report.committed, vec![InstanceRef::new("database", "default")]);
        assert!(node(&h.store, "n1").has_role("db"));
    }

    #[tokio::test]
    async fn commit_guards() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1"]);

        assert_eq!(h.controller.commit("database", "nope", false).await.status_code(), 404);
        assert_eq!(h.controller.commit("unknown", "default", false).await.status_code(), 404);

        let mut proposal = propose(&h.store, "database", "default", &[("db", &["n1"])], &[&["db"]]);
        proposal.committing = true;
        h.store.put_instance(&proposal).unwrap();
        assert_eq!(h.controller.commit("database", "default", false).await.status_code(), 402);
        assert!(h.scripted.nodes().is_empty());
    }

    #[tokio::test]
    async fn invalid_proposal_is_rejected() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1"]);
        propose(&h.store, "database", "default", &[("db", &["n1", "ghost"])], &[&["db"]]);

        let outcome = h.controller.commit("database", "default", false).await;
        assert_eq!(outcome, CommitOutcome::Invalid("unknown node ghost".into()));
        let proposal = h.store.get_instance("database", "default").unwrap().unwrap();
        assert!(!proposal.committing);
        assert!(node(&h.store, "n1").is_ready());
    }

    #[tokio::test]
    async fn admin_nodes_use_admin_command_after_others() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "admin"]);
        let mut admin = node(&h.store, "admin");
        admin.admin = true;
        h.store.put_node(&admin).unwrap();
        propose(&h.store, "database", "default", &[("db", &["admin", "n1"])], &[&["db"]]);

        assert_eq!(h.controller.commit("database", "default", false).await, CommitOutcome::Applied);
        let calls = h.scripted.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("n1".to_string(), "chef-client".to_string()),
                ("admin".to_string(), "/opt/convoy/bin/single_chef_client.sh".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn local_admin_refreshed_when_no_admin_ran() {
        let executor = ExecutorConfig {
            local_admin_node: Some("admin".into()),
            ..Default::default()
        };
        let h = harness_with(Scripted::failing_always(&["admin"]), executor, |_| {});
        add_nodes(&h.store, &["n1"]);
        propose(&h.store, "database", "default", &[("db", &["n1"])], &[&["db"]]);

        // The refresh failing does not fail the rollout.
        assert_eq!(h.controller.commit("database", "default", false).await, CommitOutcome::Applied);
        assert_eq!(h.scripted.nodes(), vec!["n1", "admin"]);
    }

    #[tokio::test]
    async fn before_rollout_error_fails_rollout() {
        let h = harness_with(Scripted::default(), ExecutorConfig::default(), |r| {
            r.register("glance", Arc::new(FailingHook));
        });
        add_nodes(&h.store, &["n1"]);
        propose(
            &h.store,
            "glance",
            "default",
            &[("glance-server", &["n1"])],
            &[&["glance-server"]],
        );

        let outcome = h.controller.commit("glance", "default", false).await;
        assert_eq!(outcome.status_code(), 405);
        assert!(outcome.to_string().contains("database not reachable"));
        assert!(h.scripted.nodes().is_empty());
        assert!(node(&h.store, "n1").is_ready());
    }

    #[tokio::test]
    async fn deactivate_removes_elements_and_adds_teardown() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "n2"]);
        h.store.put_role(&Role::element("db_remove", "database")).unwrap();
        propose(
            &h.store,
            "database",
            "default",
            &[("db", &["n1"]), ("web", &["n2"])],
            &[&["db"], &["web"]],
        );
        assert_eq!(h.controller.commit("database", "default", false).await, CommitOutcome::Applied);
        assert_eq!(h.controller.list_active("database").unwrap(), vec!["default"]);

        let outcome = h.controller.deactivate("database", "default").await;
        assert_eq!(outcome, CommitOutcome::Applied);

        assert_eq!(node(&h.store, "n1").roles(), vec!["db_remove"]);
        assert!(node(&h.store, "n2").roles().is_empty());
        assert!(h.controller.show_active("database", "default").unwrap().is_none());
        assert!(h.controller.list_active("database").unwrap().is_empty());

        assert_eq!(h.controller.deactivate("database", "default").await.status_code(), 404);
    }

    #[tokio::test]
    async fn element_move_reconfigures_leaving_node() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "n2"]);
        let mut proposal = propose(&h.store, "database", "default", &[("db", &["n1"])], &[&["db"]]);
        assert_eq!(h.controller.commit("database", "default", false).await, CommitOutcome::Applied);

        proposal.deployment.elements = elements(&[("db", &["n2"])]);
        h.store.put_instance(&proposal).unwrap();
        h.scripted.calls.lock().unwrap().clear();
        assert_eq!(h.controller.commit("database", "default", false).await, CommitOutcome::Applied);

        let ran: BTreeSet<String> = h.scripted.nodes().into_iter().collect();
        assert_eq!(ran, ["n1".to_string(), "n2".to_string()].into());
        assert!(node(&h.store, "n1").roles().is_empty());
        assert_eq!(node(&h.store, "n2").roles(), vec!["db", "database-config-default"]);
    }

    #[tokio::test]
    async fn assign_node_updates_proposal_role_and_run_list() {
        let h = harness(Scripted::default());
        add_nodes(&h.store, &["n1", "n2"]);
        propose(&h.store, "database", "default", &[("db", &["n1"])], &[&["db"]]);
        assert_eq!(h.controller.commit("database", "default", false).await, CommitOutcome::Applied);
        let runs = h.scripted.nodes().len();

        assert!(h.controller.assign_node("database", "default", "db", "n2").await.unwrap());
        assert!(!h.controller.assign_node("database", "default", "db", "n9").await.unwrap());

        let proposal = h.store.get_instance("database", "default").unwrap().unwrap();
        assert_eq!(proposal.deployment.elements["db"], vec!["n1", "n2"]);
        let role = h.controller.show_active("database", "default").unwrap().unwrap();
        assert_eq!(role.deployment.elements["db"], vec!["n1", "n2"]);
        assert_eq!(node(&h.store, "n2").roles(), vec!["db", "database-config-default"]);
        assert_eq!(h.scripted.nodes().len(), runs, "assigning must not run a rollout");
    }
}
