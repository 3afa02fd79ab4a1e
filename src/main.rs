//! Flowstate - durable workflow state from the command line.
//!
//! Every command prints a JSON [`CommandOutcome`] on stdout and exits
//! non-zero when the command was rejected.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flowstate::core::Config;
use flowstate::events::{handler_fn, Event};
use flowstate::workflow::{CommandOutcome, WorkflowEngine, WorkflowResult};

/// How long to wait for subscribers before exiting
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable workflow state shared between processes
#[derive(Parser)]
#[command(name = "flowstate")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workflow store path (overrides the configured path)
    #[arg(long, global = true, env = "FLOWSTATE_STORE")]
    store: Option<PathBuf>,

    /// Configuration file to use
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage flows
    Flow {
        #[command(subcommand)]
        operation: FlowOperation,
    },

    /// Manage plans
    Plan {
        #[command(subcommand)]
        operation: PlanOperation,
    },

    /// Manage tasks
    Task {
        #[command(subcommand)]
        operation: TaskOperation,
    },

    /// Show progress of all flows, or of one flow
    Status {
        /// Flow id
        flow: Option<String>,
    },

    /// Manage store backups
    Backup {
        #[command(subcommand)]
        operation: BackupOperation,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Flow operations.
#[derive(Subcommand)]
enum FlowOperation {
    /// Create a flow
    Create {
        /// Flow name
        name: String,

        /// Metadata entries (key=value)
        #[arg(short, long)]
        meta: Vec<String>,
    },

    /// Show a flow
    Show {
        /// Flow id
        id: String,
    },
}

/// Plan operations.
#[derive(Subcommand)]
enum PlanOperation {
    /// Create a plan in a flow
    Create {
        /// Flow id
        flow: String,

        /// Plan name
        name: String,

        /// Plan description
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Show a plan
    Show {
        /// Plan id
        id: String,
    },

    /// Archive a plan
    Archive {
        /// Plan id
        id: String,
    },

    /// Delete a plan and its tasks
    Delete {
        /// Plan id
        id: String,
    },
}

/// Task operations.
#[derive(Subcommand)]
enum TaskOperation {
    /// Add a task to a plan
    Add {
        /// Plan id
        plan: String,

        /// Task title
        title: String,

        /// Task description
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Show a task
    Show {
        /// Task id
        id: String,
    },

    /// Start a task
    Start {
        /// Task id
        id: String,
    },

    /// Complete the task in progress
    Complete {
        /// Task id
        id: String,

        /// Completion notes
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Cancel a task
    Cancel {
        /// Task id
        id: String,

        /// Cancellation reason
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Fail the task in progress
    Fail {
        /// Task id
        id: String,

        /// Failure description
        #[arg(short, long)]
        error: Option<String>,
    },

    /// Block a task
    Block {
        /// Task id
        id: String,

        /// What the task is waiting on
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Set a context value on a task
    Context {
        /// Task id
        id: String,

        /// Context key
        key: String,

        /// Value, parsed as JSON when possible
        value: String,
    },
}

/// Backup operations.
#[derive(Subcommand)]
enum BackupOperation {
    /// Take a manual backup
    Create,

    /// List backups, oldest first
    List,

    /// Replace the store with a backup
    Restore {
        /// Backup file name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Config { path } => {
            cmd_config(cli.config.as_ref(), path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let config = load_config(cli.config.as_ref(), cli.store)?;
            run_workflow_command(&config, command).await
        }
    }
}

fn load_config(config_path: Option<&PathBuf>, store: Option<PathBuf>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load()?,
    };
    if let Some(store) = store {
        config.store.path = store.to_string_lossy().into_owned();
    }
    Ok(config)
}

async fn run_workflow_command(config: &Config, command: Commands) -> Result<ExitCode> {
    let engine = match WorkflowEngine::from_config(config) {
        Ok(engine) => Arc::new(engine),
        Err(err) => return Ok(print_outcome(&CommandOutcome::failure(err.code(), err.to_string()))),
    };

    let bus = engine.bus().clone();
    bus.subscribe_all(handler_fn("log", |event: Event| async move {
        tracing::debug!(
            event = %event.event_type,
            priority = ?event.priority,
            payload = %event.payload,
            "Delivered event"
        );
        Ok(())
    }));
    bus.start();

    // Lock polling blocks; keep it off the runtime workers that drive the bus.
    let worker = Arc::clone(&engine);
    let outcome = tokio::task::spawn_blocking(move || dispatch(&worker, command))
        .await
        .unwrap_or_else(|err| CommandOutcome::failure("STORE", format!("command aborted: {err}")));

    if !bus.wait_idle(DRAIN_TIMEOUT).await {
        tracing::warn!(queued = bus.queue_depth(), "Exiting with undelivered events");
    }
    bus.shutdown().await;

    Ok(print_outcome(&outcome))
}

fn dispatch(engine: &WorkflowEngine, command: Commands) -> CommandOutcome {
    match command {
        Commands::Flow { operation } => match operation {
            FlowOperation::Create { name, meta } => match parse_metadata(&meta) {
                Ok(metadata) => outcome(engine.create_flow(&name, metadata), "Flow created"),
                Err(message) => CommandOutcome::failure("VALIDATION", message),
            },
            FlowOperation::Show { id } => outcome(engine.get_flow(&id), "Flow found"),
        },
        Commands::Plan { operation } => match operation {
            PlanOperation::Create { flow, name, description } => {
                outcome(engine.create_plan(&flow, &name, &description), "Plan created")
            }
            PlanOperation::Show { id } => outcome(engine.get_plan(&id), "Plan found"),
            PlanOperation::Archive { id } => outcome(engine.archive_plan(&id), "Plan archived"),
            PlanOperation::Delete { id } => outcome(engine.delete_plan(&id), "Plan deleted"),
        },
        Commands::Task { operation } => match operation {
            TaskOperation::Add { plan, title, description } => {
                outcome(engine.add_task(&plan, &title, &description), "Task added")
            }
            TaskOperation::Show { id } => outcome(engine.get_task(&id), "Task found"),
            TaskOperation::Start { id } => outcome(engine.start_task(&id), "Task started"),
            TaskOperation::Complete { id, notes } => {
                outcome(engine.complete_task(&id, notes.as_deref()), "Task completed")
            }
            TaskOperation::Cancel { id, reason } => {
                outcome(engine.cancel_task(&id, reason.as_deref()), "Task cancelled")
            }
            TaskOperation::Fail { id, error } => {
                outcome(engine.fail_task(&id, error.as_deref()), "Task failed")
            }
            TaskOperation::Block { id, reason } => {
                outcome(engine.block_task(&id, reason.as_deref()), "Task blocked")
            }
            TaskOperation::Context { id, key, value } => {
                outcome(engine.set_task_context(&id, &key, parse_value(&value)), "Task updated")
            }
        },
        Commands::Status { flow } => outcome(engine.get_status(flow.as_deref()), "Status"),
        Commands::Backup { operation } => match operation {
            BackupOperation::Create => outcome(engine.create_backup(), "Backup created"),
            BackupOperation::List => outcome(engine.list_backups(), "Backups listed"),
            BackupOperation::Restore { name } => {
                outcome(engine.restore_from_backup(&name), "Backup restored")
            }
        },
        Commands::Config { .. } | Commands::Completions { .. } => {
            CommandOutcome::failure("VALIDATION", "not a workflow command")
        }
    }
}

fn outcome<T: Serialize>(result: WorkflowResult<T>, message: &str) -> CommandOutcome {
    CommandOutcome::from_result(result, message)
}

fn print_outcome(outcome: &CommandOutcome) -> ExitCode {
    match serde_json::to_string_pretty(outcome) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to encode result: {e}"),
    }
    if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Parse `key=value` pairs, reading each value as JSON when it parses.
fn parse_metadata(entries: &[String]) -> Result<BTreeMap<String, Value>, String> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.trim().to_string(), parse_value(value)))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| format!("Invalid metadata entry '{entry}', expected key=value"))
        })
        .collect()
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Show configuration.
fn cmd_config(config_path: Option<&PathBuf>, show_path: bool) -> Result<()> {
    if show_path {
        let path = config_path.cloned().or_else(Config::find_config_file);
        match path {
            Some(path) => println!("{}", path.display()),
            None => {
                if let Some(dir) = Config::config_dir() {
                    println!("{}", dir.join("config.toml").display());
                }
            }
        }
        return Ok(());
    }

    let config = load_config(config_path, None)?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "flowstate", &mut io::stdout());
}
