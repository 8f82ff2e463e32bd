//! convoyd — the Convoy operator binary.
//!
//! Opens the state store under the data directory and runs one operation
//! against it: commit or deactivate a proposal, work the proposal queue,
//! or inspect queue, nodes, and active roles. Output is JSON on stdout;
//! logs go to stderr.
//!
//! The state database admits one process at a time and `convoyd` keeps it
//! open for its whole run. A second invocation, even a read-only `queue`,
//! waits until the first one exits, so a commit issued during a running
//! rollout starts after that rollout instead of being deferred with 202.
//! The queue and node-assignment locks only contend between tasks of one
//! process.
//!
//! # Usage
//!
//! ```text
//! convoyd --config /etc/convoy/convoy.toml commit database default
//! convoyd --data-dir /var/lib/convoy queue
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "convoyd",
    about = "Convoy — dependency-aware cluster rollouts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to convoy.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory; overrides `paths.data_dir` from the config.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Commit a proposal: roll it out now or queue it.
    Commit { service: String, instance: String },
    /// Remove an active instance from all of its nodes.
    Deactivate { service: String, instance: String },
    /// Take a proposal out of the queue.
    Dequeue { service: String, instance: String },
    /// Commit every queued proposal that can run now.
    ProcessQueue,
    /// Show the proposal queue.
    Queue,
    /// Show all nodes.
    Nodes,
    /// List active instances of a service, or show one.
    Active {
        service: String,
        instance: Option<String>,
    },
    /// Store a proposal read from a JSON file.
    Propose { file: PathBuf },
    /// Print a starter convoy.toml rooted at the data directory.
    Init,
    /// Register a node.
    AddNode {
        name: String,
        /// Configure this node with the admin command.
        #[arg(long)]
        admin: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    if let Command::Init = cli.command {
        return commands::init(cli.data_dir.as_deref());
    }

    let ctx = commands::Context::open(cli.config.as_deref(), cli.data_dir.as_deref()).await?;

    match cli.command {
        Command::Commit { service, instance } => commands::commit(&ctx, &service, &instance).await,
        Command::Deactivate { service, instance } => {
            commands::deactivate(&ctx, &service, &instance).await
        }
        Command::Dequeue { service, instance } => {
            commands::dequeue(&ctx, &service, &instance).await
        }
        Command::ProcessQueue => commands::process_queue(&ctx).await,
        Command::Queue => commands::queue(&ctx).await,
        Command::Nodes => commands::nodes(&ctx),
        Command::Active { service, instance } => {
            commands::active(&ctx, &service, instance.as_deref())
        }
        Command::Propose { file } => commands::propose(&ctx, &file),
        Command::AddNode { name, admin } => commands::add_node(&ctx, &name, admin),
        Command::Init => Ok(()),
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => "info,convoy=debug".parse()?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
