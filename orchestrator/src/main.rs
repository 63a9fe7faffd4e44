//! ai-dev-orchestrator CLI.
//!
//! Drives the library's request surface from a terminal: generate plans,
//! run them with interactive dependency approval, loop with autobuild, and
//! inspect recorded runs. Events stream to stdout as JSON lines, one per
//! event, in emission order.

use std::fs;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use orchestrator::autobuild::{AutobuildRequest, DEFAULT_MAX_ITERATIONS};
use orchestrator::core::plan::{Plan, parse_plan, to_canonical_json};
use orchestrator::io::config::{OrchestratorConfig, load_config};
use orchestrator::io::decision::DecisionResult;
use orchestrator::io::events::{ChannelSink, Event};
use orchestrator::io::run_store::{list_run_dirs, load_record};
use orchestrator::service::Orchestrator;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Plan, execute, and evaluate requirement-driven runs against a git workspace"
)]
struct Cli {
    /// Optional TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a plan from a requirement and print it as JSON.
    Plan {
        #[arg(short, long)]
        requirement: String,
    },
    /// Run a plan against a workspace. Dependency-file changes prompt for
    /// approval on the terminal.
    Run {
        #[arg(long)]
        workspace: PathBuf,
        /// Plan JSON file; when omitted, a plan is generated from the
        /// requirement.
        #[arg(long)]
        plan_file: Option<PathBuf>,
        #[arg(short, long)]
        requirement: Option<String>,
    },
    /// Plan and run in a bounded loop until a stop condition fires.
    Autobuild {
        #[arg(long)]
        workspace: PathBuf,
        #[arg(short, long)]
        requirement: String,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// List recorded runs, newest first.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the runs root path, creating it if missing.
    RunsRoot,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

/// Diagnostics for the orchestrator itself, controlled by `RUST_LOG` and
/// quiet by default so they never mix with the JSON event lines on stdout.
/// Run output is a product artifact and goes to each run's `output.log`
/// and the event channel, not through tracing.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orchestrator=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => OrchestratorConfig::default(),
    };
    match cli.command {
        Command::Plan { requirement } => cmd_plan(config, &requirement),
        Command::Run {
            workspace,
            plan_file,
            requirement,
        } => cmd_run(config, workspace, plan_file, requirement),
        Command::Autobuild {
            workspace,
            requirement,
            max_iterations,
        } => cmd_autobuild(config, workspace, &requirement, max_iterations),
        Command::Runs { limit } => cmd_runs(config, limit),
        Command::RunsRoot => cmd_runs_root(config),
    }
}

fn cmd_plan(config: OrchestratorConfig, requirement: &str) -> Result<()> {
    let (tx, _rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(config, Arc::new(ChannelSink::new(tx)))?;
    let plan = orchestrator.generate_plan(requirement)?;
    print!("{}", to_canonical_json(&plan));
    Ok(())
}

fn cmd_run(
    config: OrchestratorConfig,
    workspace: PathBuf,
    plan_file: Option<PathBuf>,
    requirement: Option<String>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(ChannelSink::new(tx)))?;

    let plan = match (plan_file, &requirement) {
        (Some(path), _) => read_plan_file(&config, &path)?,
        (None, Some(requirement)) => orchestrator.generate_plan(requirement)?,
        (None, None) => bail!("provide --plan-file or --requirement"),
    };

    let _run_id = orchestrator.run_plan(&workspace, plan, requirement)?;
    for event in rx {
        print_event(&event)?;
        match &event {
            Event::RunDecision { run_id: id, files } => {
                let approved = prompt_approval(files)?;
                let result = if approved {
                    DecisionResult::Approved
                } else {
                    DecisionResult::Rejected
                };
                orchestrator.submit_decision(id, result);
            }
            Event::RunDone { .. } => break,
            _ => {}
        }
    }
    Ok(())
}

fn cmd_autobuild(
    config: OrchestratorConfig,
    workspace: PathBuf,
    requirement: &str,
    max_iterations: Option<u32>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(config, Arc::new(ChannelSink::new(tx)))?;
    orchestrator.start_autobuild(AutobuildRequest {
        workspace,
        requirement: requirement.to_string(),
        max_iterations: max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
    })?;
    for event in rx {
        print_event(&event)?;
        if matches!(event, Event::AutobuildDone { .. }) {
            break;
        }
    }
    Ok(())
}

fn cmd_runs(config: OrchestratorConfig, limit: usize) -> Result<()> {
    let (tx, _rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(config, Arc::new(ChannelSink::new(tx)))?;
    let root = orchestrator.runs_root()?;
    for dir in list_run_dirs(&root)?.into_iter().take(limit) {
        let record = match load_record(&dir) {
            Ok(record) => record,
            Err(_) => continue,
        };
        let mut flags = Vec::new();
        if record.blocked_by_policy {
            flags.push("blocked");
        }
        if record.timeout {
            flags.push("timeout");
        }
        if record.cancelled {
            flags.push("cancelled");
        }
        if record.decision_pending {
            flags.push("decision-pending");
        }
        println!(
            "{}  {}  exit={}  {}",
            record.run_id,
            record.start_time,
            record
                .exit_code
                .map_or_else(|| "?".to_string(), |code| code.to_string()),
            flags.join(",")
        );
    }
    Ok(())
}

fn cmd_runs_root(config: OrchestratorConfig) -> Result<()> {
    let (tx, _rx) = mpsc::channel();
    let orchestrator = Orchestrator::new(config, Arc::new(ChannelSink::new(tx)))?;
    println!("{}", orchestrator.runs_root()?.display());
    Ok(())
}

fn read_plan_file(config: &OrchestratorConfig, path: &PathBuf) -> Result<Plan> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let plan = parse_plan(&raw, config)?;
    Ok(plan)
}

fn print_event(event: &Event) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

fn prompt_approval(files: &[String]) -> Result<bool> {
    eprint!(
        "Dependency files changed ({}). Approve? [y/N] ",
        files.join(", ")
    );
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read decision")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
