//! Administrative CLI over a persisted conductor state directory.
//!
//! Workflows are authored in Rust against the library; this binary only
//! inspects and steers what they left in the store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{Value, json};

use conductor::core::cleanup::RetentionRules;
use conductor::errors::{ConductorError, StateError};
use conductor::exit_codes;
use conductor::io::config::{ExecutionConfig, write_config};
use conductor::io::store::{ExecutionRecord, PhaseRecord, StepRecord, Store};
use conductor::io::vcs::{VcsKind, open_store};
use conductor::logging;
use conductor::scheduler::{keys, request_stop};
use conductor::transaction::{CleanupOptions, ToolWrapper};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Inspect and steer persisted agent workflow executions"
)]
struct Cli {
    /// State directory holding `state.db` and `blobs/`.
    #[arg(long, global = true, default_value = ".conductor")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show an execution with its phases, steps and pending human waits.
    Status(ExecutionArg),
    /// Ask a running execution to stop before its next activation.
    Stop(ExecutionArg),
    /// List executions, or the transitions, reports and reviews of one.
    History {
        #[arg(long)]
        execution: Option<String>,
        /// Maximum rows per section.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Answer a human-wait node.
    Respond(RespondArgs),
    /// Snapshot maintenance.
    Snapshots {
        #[command(subcommand)]
        command: SnapshotsCommand,
    },
    /// Execution config files.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args)]
struct ExecutionArg {
    /// Execution id (defaults to the running execution).
    #[arg(long)]
    execution: Option<String>,
}

#[derive(Args)]
struct RespondArgs {
    #[arg(long)]
    execution: Option<String>,
    /// Node id of the waiting human node.
    #[arg(long)]
    node: String,
    /// Raw JSON response.
    #[arg(long, conflicts_with_all = ["approve", "reject"])]
    json: Option<String>,
    #[arg(long, conflicts_with = "reject")]
    approve: bool,
    /// Reject with the given reason.
    #[arg(long, value_name = "REASON")]
    reject: Option<String>,
}

#[derive(Subcommand)]
enum SnapshotsCommand {
    /// Abandon tool snapshots selected by the retention rules.
    Cleanup(CleanupArgs),
}

#[derive(Args)]
struct CleanupArgs {
    /// Working copy whose snapshots are cleaned.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,
    #[arg(long, value_enum, default_value_t = VcsArg::Git)]
    vcs: VcsArg,
    /// Keep at most this many snapshots.
    #[arg(long)]
    max_count: Option<usize>,
    /// Drop snapshots older than this many seconds.
    #[arg(long)]
    max_age_secs: Option<u64>,
    /// Drop snapshots that recorded no changes.
    #[arg(long)]
    empty_only: bool,
    /// Report the selection without abandoning anything.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VcsArg {
    Git,
    Jj,
}

impl From<VcsArg> for VcsKind {
    fn from(arg: VcsArg) -> Self {
        match arg {
            VcsArg::Git => VcsKind::Git,
            VcsArg::Jj => VcsKind::Jj,
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default config file.
    Init {
        #[arg(long, default_value = "conductor.toml")]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match ConductorError::find(err) {
        Some(ConductorError::State(StateError::NotFound { .. })) => exit_codes::NOT_FOUND,
        _ => exit_codes::INVALID,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Status(arg) => cmd_status(&open(&cli.state_dir)?, arg.execution.as_deref()),
        Command::Stop(arg) => cmd_stop(&open(&cli.state_dir)?, arg.execution.as_deref()),
        Command::History { execution, limit } => {
            cmd_history(&open(&cli.state_dir)?, execution.as_deref(), limit)
        }
        Command::Respond(args) => cmd_respond(&open(&cli.state_dir)?, &args),
        Command::Snapshots {
            command: SnapshotsCommand::Cleanup(args),
        } => cmd_cleanup(&cli.state_dir, &args),
        Command::Config {
            command: ConfigCommand::Init { path, force },
        } => cmd_config_init(&path, force),
    }
}

fn open(state_dir: &Path) -> Result<Store> {
    if !state_dir.join("state.db").exists() {
        bail!("no state database in {}", state_dir.display());
    }
    Store::open(state_dir)
}

/// The named execution, or the one still running.
fn resolve_execution(store: &Store, id: Option<&str>) -> Result<ExecutionRecord> {
    let record = match id {
        Some(id) => store.get_execution(id)?,
        None => store.find_incomplete_execution()?,
    };
    record.ok_or_else(|| {
        ConductorError::from(StateError::NotFound {
            kind: "execution",
            id: id.unwrap_or("(running)").to_string(),
        })
        .into()
    })
}

#[derive(Serialize)]
struct StatusReport {
    execution: ExecutionRecord,
    waiting: Vec<Value>,
    phases: Vec<PhaseRecord>,
    steps: Vec<StepRecord>,
}

fn cmd_status(store: &Store, id: Option<&str>) -> Result<()> {
    let execution = resolve_execution(store, id)?;
    let waiting = store
        .state_with_prefix(&keys::waiting_prefix(&execution.id))?
        .into_values()
        .collect();
    let report = StatusReport {
        phases: store.list_phases(&execution.id)?,
        steps: store.list_steps(&execution.id)?,
        waiting,
        execution,
    };
    print_json(&report)
}

fn cmd_stop(store: &Store, id: Option<&str>) -> Result<()> {
    let execution = resolve_execution(store, id)?;
    request_stop(store, &execution.id)?;
    println!("stop requested for {}", execution.id);
    Ok(())
}

fn cmd_history(store: &Store, id: Option<&str>, limit: usize) -> Result<()> {
    let Some(id) = id else {
        return print_json(&store.list_executions(limit)?);
    };
    let execution = resolve_execution(store, Some(id))?;
    let prefix = format!("{}/", execution.id);
    let transitions: Vec<_> = store
        .transitions(None, usize::MAX)?
        .into_iter()
        .filter(|t| t.key.starts_with(&prefix))
        .take(limit)
        .collect();
    let mut reports = store.list_reports(&execution.id)?;
    reports.truncate(limit);
    let mut reviews = store.list_reviews(&execution.id)?;
    reviews.truncate(limit);
    print_json(&json!({
        "execution": execution,
        "transitions": transitions,
        "reports": reports,
        "reviews": reviews,
    }))
}

fn cmd_respond(store: &Store, args: &RespondArgs) -> Result<()> {
    let execution = resolve_execution(store, args.execution.as_deref())?;
    let response = match (&args.json, args.approve, &args.reject) {
        (Some(raw), _, _) => serde_json::from_str(raw).context("parse --json response")?,
        (None, true, _) => json!({"approved": true}),
        (None, false, Some(reason)) => json!({"approved": false, "comment": reason}),
        (None, false, None) => bail!("one of --json, --approve or --reject is required"),
    };
    let waiting_key = keys::waiting(&execution.id, &args.node);
    if store.get_state(&waiting_key)?.is_none() {
        return Err(ConductorError::from(StateError::NotFound {
            kind: "human wait",
            id: args.node.clone(),
        })
        .into());
    }
    store.set_state(
        &keys::human(&execution.id, &args.node),
        &response,
        "human_response",
    )?;
    println!("response recorded for {}", args.node);
    Ok(())
}

fn cmd_cleanup(state_dir: &Path, args: &CleanupArgs) -> Result<()> {
    let rules = RetentionRules {
        max_count: args.max_count,
        max_age: args.max_age_secs.map(Duration::from_secs),
        empty_only: args.empty_only,
    };
    if rules.is_noop() {
        bail!("no retention rule given (use --max-count, --max-age-secs or --empty-only)");
    }
    let changesets = open_store(args.vcs.into(), &args.workdir);
    let mut wrapper = ToolWrapper::new(changesets);
    if state_dir.join("state.db").exists() {
        wrapper = wrapper.with_store(Store::open(state_dir)?);
    }
    let report = wrapper.cleanup(&CleanupOptions {
        rules,
        dry_run: args.dry_run,
        scan_limit: None,
    })?;
    print_json(&report)
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ExecutionConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
