//! Remote executor — runs one configuration pass on a node.
//!
//! The core only depends on [`RemoteExecutor`]; [`SshExecutor`] is the
//! production implementation that shells out to ssh. [`run_passes`] fans a
//! batch of passes out concurrently and waits for all of them.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use convoy_core::config::ExecutorConfig;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn configuration pass on {node}: {source}")]
    Spawn { node: String, source: io::Error },

    #[error("failed to wait for configuration pass on {node}: {source}")]
    Wait { node: String, source: io::Error },
}

/// One configuration pass to run on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurePass {
    pub node: String,
    pub command: String,
    /// Output of the pass is appended here when set.
    pub log_path: Option<PathBuf>,
}

pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = Result<i32, ExecError>> + Send + 'a>>;

/// Runs a configuration pass and reports its exit code.
pub trait RemoteExecutor: Send + Sync {
    fn run<'a>(&'a self, pass: &'a ConfigurePass) -> ExecFuture<'a>;
}

/// Run every pass concurrently and wait for all of them.
///
/// Returns node → success. A nonzero exit, an executor error, or a task
/// that did not finish all count as failure.
pub async fn run_passes(
    executor: &Arc<dyn RemoteExecutor>,
    passes: Vec<ConfigurePass>,
) -> BTreeMap<String, bool> {
    let mut results: BTreeMap<String, bool> =
        passes.iter().map(|p| (p.node.clone(), false)).collect();

    let mut tasks = JoinSet::new();
    for pass in passes {
        let executor = Arc::clone(executor);
        tasks.spawn(async move {
            let ok = match executor.run(&pass).await {
                Ok(0) => true,
                Ok(code) => {
                    warn!(node = %pass.node, code, "configuration pass exited nonzero");
                    false
                }
                Err(e) => {
                    warn!(node = %pass.node, error = %e, "configuration pass did not run");
                    false
                }
            };
            (pass.node, ok)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((node, ok)) => {
                results.insert(node, ok);
            }
            Err(e) => error!(error = %e, "configuration pass task failed"),
        }
    }
    results
}

/// Runs passes over ssh, optionally wrapped in `sudo -i -u root --`.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    user: String,
    sudo: bool,
}

impl SshExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            program: config.program.clone().or(defaults.program).unwrap_or_default(),
            user: config.user.clone().or(defaults.user).unwrap_or_default(),
            sudo: config.sudo.or(defaults.sudo).unwrap_or(false),
        }
    }

    /// Program and arguments for a pass.
    pub fn command_line(&self, pass: &ConfigurePass) -> Vec<String> {
        let mut argv = Vec::new();
        if self.sudo {
            argv.extend(["sudo", "-i", "-u", "root", "--"].map(String::from));
        }
        argv.push(self.program.clone());
        argv.push(format!("{}@{}", self.user, pass.node));
        argv.push(pass.command.clone());
        argv
    }
}

impl RemoteExecutor for SshExecutor {
    fn run<'a>(&'a self, pass: &'a ConfigurePass) -> ExecFuture<'a> {
        Box::pin(async move {
            let argv = self.command_line(pass);
            debug!(node = %pass.node, command = ?argv, "starting configuration pass");

            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]).stdin(Stdio::null());
            match pass.log_path.as_deref().map(open_log) {
                Some(Ok((stdout, stderr))) => {
                    cmd.stdout(stdout).stderr(stderr);
                }
                Some(Err(e)) => {
                    warn!(node = %pass.node, error = %e, "cannot open pass log, discarding output");
                    cmd.stdout(Stdio::null()).stderr(Stdio::null());
                }
                None => {
                    cmd.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }

            let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
                node: pass.node.clone(),
                source,
            })?;
            let status = child.wait().await.map_err(|source| ExecError::Wait {
                node: pass.node.clone(),
                source,
            })?;

            // Killed by a signal: no exit code.
            let code = status.code().unwrap_or(-1);
            debug!(node = %pass.node, code, "configuration pass finished");
            Ok(code)
        })
    }
}

/// Open `path` for appending, once for stdout and once for stderr.
fn open_log(path: &Path) -> io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let err = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(err)))
}

/// `{log_dir}/{node}.convoy.log`
pub fn pass_log_path(log_dir: &Path, node: &str) -> PathBuf {
    log_dir.join(format!("{node}.convoy.log"))
}
