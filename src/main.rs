//! CLI entry point for the CursorFlow orchestration engine.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use cursorflow::cancel::CancelFlag;
use cursorflow::dag::{self, RunOutcome};
use cursorflow::exit_codes;
use cursorflow::io::config::load_config;
use cursorflow::io::flow_config::load_flow;
use cursorflow::io::git::Git;
use cursorflow::io::intervention::{write_intervention, write_timeout_override};
use cursorflow::io::run_layout::{generate_run_id, RepoLayout};
use cursorflow::io::state_store::load_run_meta;
use cursorflow::resume;
use cursorflow::run_service::{self, DeleteOptions, StopSignal};

#[derive(Parser)]
#[command(name = "cursorflow", version, about = "DAG-based multi-agent orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a Run from a Flow directory name under `_cursorflow/flows/`.
    Run {
        flow: String,
    },
    /// Resume a paused, failed, or crashed Run.
    Resume {
        run_id: String,
        /// Skip the Git-level preflight check.
        #[arg(long)]
        skip_doctor: bool,
    },
    /// Inspect and manage past and in-progress runs.
    #[command(subcommand)]
    Runs(RunsCommand),
    /// Queue a message for delivery to a lane before its next turn.
    Send {
        run_id: String,
        lane: String,
        message: String,
    },
    /// Override a lane's default task timeout, in milliseconds.
    Timeout {
        run_id: String,
        lane: String,
        ms: u64,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List known run ids.
    List,
    /// Show a run's lanes and their status.
    Show {
        run_id: String,
    },
    /// Send a signal to a lane's agent process.
    Stop {
        run_id: String,
        lane: String,
        #[arg(long, default_value = "term")]
        signal: String,
    },
    /// Delete a run's logs, optionally its worktrees and branches too.
    Delete {
        run_id: String,
        #[arg(long)]
        remove_branches: bool,
        #[arg(long)]
        remove_worktrees: bool,
    },
}

fn main() {
    cursorflow::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let repo_root = std::env::current_dir().context("resolve current directory")?;
    let repo_layout = RepoLayout::new(&repo_root);
    let cancel = CancelFlag::new();
    cancel.install();

    match cli.command {
        Command::Run { flow } => cmd_run(&repo_root, &repo_layout, &flow, &cancel),
        Command::Resume { run_id, skip_doctor } => cmd_resume(&repo_root, &repo_layout, &run_id, skip_doctor, &cancel),
        Command::Runs(action) => cmd_runs(&repo_root, &repo_layout, action),
        Command::Send { run_id, lane, message } => cmd_send(&repo_layout, &run_id, &lane, &message),
        Command::Timeout { run_id, lane, ms } => cmd_timeout(&repo_layout, &run_id, &lane, ms),
    }
}

/// Start a Run against `flow`, unless an earlier Run over the same Flow is
/// still incomplete — in that case delegate to resume instead of starting a
/// second, duplicate Run over it (§4.5: auto-resume is automatic, not
/// something the caller has to notice and request by hand).
fn cmd_run(repo_root: &std::path::Path, repo_layout: &RepoLayout, flow: &str, cancel: &CancelFlag) -> Result<i32> {
    let flow_dir = repo_layout.flow_dir(flow);

    if let Some(run_id) = run_service::find_resumable_run(repo_layout, &flow_dir)? {
        info!(run_id, flow, "found incomplete run for this flow, resuming instead of starting a new one");
        println!("{run_id}");
        return run_resume(repo_root, repo_layout, &run_id, false, cancel);
    }

    let config = load_config(&repo_layout.config_path())?;
    let run_id = generate_run_id(now_unix_millis());

    println!("{run_id}");
    let outcome = dag::run_flow(repo_root, &flow_dir, &run_id, &config, cancel)?;
    Ok(outcome_to_exit_code(outcome))
}

fn cmd_resume(
    repo_root: &std::path::Path,
    repo_layout: &RepoLayout,
    run_id: &str,
    skip_doctor: bool,
    cancel: &CancelFlag,
) -> Result<i32> {
    run_resume(repo_root, repo_layout, run_id, skip_doctor, cancel)
}

fn run_resume(
    repo_root: &std::path::Path,
    repo_layout: &RepoLayout,
    run_id: &str,
    skip_doctor: bool,
    cancel: &CancelFlag,
) -> Result<i32> {
    let run_layout = repo_layout.run(run_id);
    let meta = load_run_meta(run_layout.root())?
        .with_context(|| format!("run {run_id} has no run.meta.json"))?;
    let flow = load_flow(&PathBuf::from(&meta.flow_ref)).context("load flow for resume")?;
    let config = load_config(&repo_layout.config_path())?;
    let git = Git::new(repo_root);
    let agent_runner = cursorflow::io::agent_runner::CursorAgentRunner::default();

    let outcome = resume::resume_run(&git, &run_layout, &flow, run_id, &config, &agent_runner, skip_doctor, cancel)?;
    Ok(outcome_to_exit_code(outcome))
}

fn cmd_runs(repo_root: &std::path::Path, repo_layout: &RepoLayout, action: RunsCommand) -> Result<i32> {
    match action {
        RunsCommand::List => {
            for run_id in run_service::list_runs(repo_layout)? {
                println!("{run_id}");
            }
            Ok(exit_codes::OK)
        }
        RunsCommand::Show { run_id } => {
            let summary = run_service::describe_run(repo_layout, &run_id)?;
            for lane in &summary.lanes {
                println!(
                    "{}\t{:?}\t{}/{}",
                    lane.lane_name, lane.status, lane.current_task_index, lane.total_tasks
                );
            }
            Ok(exit_codes::OK)
        }
        RunsCommand::Stop { run_id, lane, signal } => {
            let signal = match signal.as_str() {
                "term" => StopSignal::Term,
                "kill" => StopSignal::Kill,
                other => bail!("unknown signal '{other}', expected 'term' or 'kill'"),
            };
            run_service::stop_lane(repo_layout, &run_id, &lane, signal)?;
            Ok(exit_codes::OK)
        }
        RunsCommand::Delete {
            run_id,
            remove_branches,
            remove_worktrees,
        } => {
            let git = Git::new(repo_root);
            run_service::delete_run(
                &git,
                repo_layout,
                &run_id,
                DeleteOptions {
                    remove_branches,
                    remove_worktrees,
                },
            )?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_send(repo_layout: &RepoLayout, run_id: &str, lane: &str, message: &str) -> Result<i32> {
    let lane_path = repo_layout.run(run_id).lane(lane);
    write_intervention(&lane_path, message)?;
    Ok(exit_codes::OK)
}

fn cmd_timeout(repo_layout: &RepoLayout, run_id: &str, lane: &str, ms: u64) -> Result<i32> {
    let lane_path = repo_layout.run(run_id).lane(lane);
    write_timeout_override(&lane_path, ms)?;
    Ok(exit_codes::OK)
}

fn outcome_to_exit_code(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::AllCompleted => exit_codes::OK,
        RunOutcome::SomePaused => exit_codes::PAUSED,
        RunOutcome::SomeFailed => exit_codes::FAILED,
        RunOutcome::Cancelled => exit_codes::CANCELLED,
    }
}

fn now_unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
