//! C4: the Lane Executor. Owns exactly one `LaneState` from creation to a
//! terminal state: creates the worktree, runs its task sequence in order via
//! the Agent Runner, commits/pushes after each task, and handles retries,
//! dependency-change requests, and termination.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::budget::effective_timeout;
use crate::core::invariants::{validate_lane_state, validate_worktree_presence};
use crate::core::types::{AgentOutcome, LaneConfig, LaneState, LaneStatus, TaskNode};
use crate::io::agent_runner::{AgentRequest, AgentRunner};
use crate::io::config::EngineConfig;
use crate::io::git::Git;
use crate::io::run_layout::RunLayout;
use crate::io::state_store::{self, LogRecord};

/// Final disposition of a lane after `run_lane` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneOutcome {
    Completed,
    Paused,
    Failed,
}

/// Cold-start initialization (§4.4): resolve the branch name, choose a
/// worktree directory, create it against `base_branch`, and persist the
/// initial `LaneState`.
#[instrument(skip_all, fields(lane = %lane.lane_name, run_id))]
pub fn start_lane(
    repo_git: &Git,
    layout: &RunLayout,
    lane: &LaneConfig,
    tasks_file: &str,
    base_branch: &str,
    run_id: &str,
    depends_on: Vec<TaskNode>,
) -> Result<LaneState> {
    let branch = pipeline_branch(lane, run_id);
    let lane_path = layout.lane(&lane.lane_name);
    let worktree_dir = lane_path.join("worktree");

    repo_git
        .create_worktree(base_branch, &branch, &worktree_dir)
        .with_context(|| format!("create worktree for lane {}", lane.lane_name))?;

    let mut state = LaneState::new_pending(
        &lane.lane_name,
        tasks_file,
        lane.tasks.len() as u32,
        depends_on,
    );
    state.worktree_dir = Some(worktree_dir.to_string_lossy().to_string());
    state.pipeline_branch = Some(branch);
    state.status = LaneStatus::Running;
    state.start_time = Some(now_unix_string());
    state_store::save(&lane_path, &state)?;

    info!(branch = %state.pipeline_branch.clone().unwrap(), "lane started");
    Ok(state)
}

/// Branch naming: `<branchPrefix><runId>`, defaulting the prefix to
/// `lanes/<laneName>/` so branches stay unique across lanes of a Run
/// (Invariant 4) even when the Flow author supplies none.
fn pipeline_branch(lane: &LaneConfig, run_id: &str) -> String {
    let prefix = lane
        .branch_prefix
        .clone()
        .unwrap_or_else(|| format!("lanes/{}/", lane.lane_name));
    format!("{prefix}{run_id}")
}

/// Run a lane's task loop starting at `state.current_task_index`.
///
/// Commit/push ordering is load-bearing (§4.4): each task is committed, then
/// pushed, before `current_task_index` is incremented in persisted state.
#[instrument(skip_all, fields(lane = %state.lane_name))]
pub fn run_lane_tasks<R: AgentRunner>(
    lane_git: &Git,
    layout: &RunLayout,
    lane: &LaneConfig,
    state: &mut LaneState,
    agent_runner: &R,
    config: &EngineConfig,
) -> Result<LaneOutcome> {
    let lane_path = layout.lane(&lane.lane_name);

    while (state.current_task_index as usize) < lane.tasks.len() {
        let task = &lane.tasks[state.current_task_index as usize];
        state.status = LaneStatus::Running;
        persist(&lane_path, state)?;

        let timeout = effective_timeout(
            task.timeout,
            Duration::from_secs(config.default_task_timeout_secs),
        );
        let request = AgentRequest {
            working_dir: PathBuf::from(
                state.worktree_dir.clone().context("lane missing worktree_dir")?,
            ),
            prompt: task.prompt.clone(),
            model: task.model.clone(),
            timeout,
            task_id: task.name.clone(),
            lane_path: lane_path.clone(),
            idle_thresholds: crate::core::budget::IdleThresholds {
                warn: Duration::from_secs(config.idle_warn_secs),
                escalate: Duration::from_secs(config.idle_escalate_secs),
                kill: Duration::from_secs(config.idle_kill_secs),
            },
            heartbeat_interval: Duration::from_secs(config.heartbeat_secs),
            output_limit_bytes: config.output_limit_bytes,
        };

        let mut pid_cell = state.pid;
        let result = agent_runner.run(&request, &mut |pid| {
            pid_cell = Some(pid);
        })?;
        state.pid = pid_cell;
        persist(&lane_path, state)?;

        match result.outcome {
            AgentOutcome::Completed => {
                commit_and_push_task(lane_git, &lane.lane_name, &task.name)?;
                state.current_task_index += 1;
                state.pid = None;
                persist(&lane_path, state)?;
                append_event(&lane_path, "task_completed", &task.name)?;
            }
            AgentOutcome::BlockedOnDependency => {
                state.dependency_request = result.dependency_request;
                state.status = LaneStatus::Paused;
                state.pid = None;
                persist(&lane_path, state)?;
                return Ok(LaneOutcome::Paused);
            }
            AgentOutcome::Timeout | AgentOutcome::Crashed => {
                state.error = Some(format!(
                    "task '{}' {:?} (exit_code={:?})",
                    task.name, result.outcome, result.exit_code
                ));
                state.status = LaneStatus::Failed;
                state.pid = None;
                persist(&lane_path, state)?;
                return Ok(LaneOutcome::Failed);
            }
            AgentOutcome::Cancelled => {
                state.status = LaneStatus::Paused;
                state.pid = None;
                persist(&lane_path, state)?;
                return Ok(LaneOutcome::Paused);
            }
        }
    }

    let branch = state.pipeline_branch.clone().context("lane missing pipeline_branch")?;
    push_with_retry(lane_git, &branch)?;
    state.status = LaneStatus::Completed;
    state.end_time = Some(now_unix_string());
    persist(&lane_path, state)?;
    Ok(LaneOutcome::Completed)
}

/// Save a lane's state, logging (not failing) if a durable invariant from
/// §3 is violated — a violation here is a bug in this module, not a reason
/// to stop a lane mid-flight, so it is reported rather than propagated.
fn persist(lane_path: &Path, state: &LaneState) -> Result<()> {
    for violation in validate_lane_state(state)
        .into_iter()
        .chain(validate_worktree_presence(state))
    {
        warn!(lane = %state.lane_name, violation, "lane state invariant violated");
    }
    state_store::save(lane_path, state)
}

fn commit_and_push_task(lane_git: &Git, lane_name: &str, task_name: &str) -> Result<()> {
    if lane_git.has_uncommitted_changes()? {
        lane_git.add_all()?;
        lane_git.commit_staged(&format!("chore(lane): complete {task_name}"))?;
    }
    let branch = lane_git.current_branch()?;
    push_with_retry(lane_git, &branch).with_context(|| format!("push lane {lane_name} after {task_name}"))
}

/// Push failures are retried once, then the lane fails (§7, §9 Open Questions:
/// "retry once, then fail").
fn push_with_retry(lane_git: &Git, branch: &str) -> Result<()> {
    match lane_git.push(branch, true) {
        Ok(()) => Ok(()),
        Err(first_err) => {
            warn!(branch, err = %first_err, "push failed, retrying once");
            lane_git
                .push(branch, true)
                .with_context(|| format!("push {branch} failed twice (first error: {first_err})"))
        }
    }
}

fn append_event(lane_path: &Path, kind: &str, content: &str) -> Result<()> {
    state_store::append_log(
        lane_path,
        &LogRecord {
            timestamp: now_unix_string(),
            kind: kind.to_string(),
            content: content.to_string(),
            task_id: None,
        },
    )
}

fn now_unix_string() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("unix:{secs}")
}
