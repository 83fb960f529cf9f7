//! C5: the DAG Scheduler. Reads a Flow, validates its graph, and launches
//! Lane Executors as lanes become ready, respecting `max_concurrent_lanes`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::cancel::CancelFlag;
use crate::core::graph::{ready_lanes, resolve_task_dependency};
use crate::core::types::{LaneConfig, LaneState, LaneStatus, TaskNode};
use crate::io::agent_runner::{AgentRunner, CursorAgentRunner};
use crate::io::config::EngineConfig;
use crate::io::flow_config::{load_flow, Flow};
use crate::io::git::Git;
use crate::io::process_probe::{send_signal, SIGKILL, SIGTERM};
use crate::io::run_layout::{RepoLayout, RunLayout};
use crate::io::state_store;
use crate::lane::{run_lane_tasks, start_lane, LaneOutcome};

/// One message a Lane Executor thread reports back to the scheduler loop.
#[derive(Debug)]
pub struct LaneEvent {
    pub lane_name: String,
    pub outcome: Result<LaneOutcome, String>,
}

/// Terminal disposition of an entire Run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    AllCompleted,
    SomePaused,
    SomeFailed,
    /// The user cancelled the run (Ctrl-C) before every lane reached a
    /// terminal state on its own (§5, §6 exit code 130).
    Cancelled,
}

/// Drive a Flow to completion (or to the point every lane is blocked/failed),
/// launching ready lanes up to the concurrency cap and waiting on a single
/// `mpsc` channel for executor progress (one-way: executors report, the
/// scheduler never blocks waiting on any single lane thread directly).
#[instrument(skip_all, fields(run_id))]
pub fn run_flow(
    repo_root: &Path,
    flow_dir: &Path,
    run_id: &str,
    config: &EngineConfig,
    cancel: &CancelFlag,
) -> Result<RunOutcome> {
    let flow = load_flow(flow_dir).context("load flow")?;
    let repo_layout = RepoLayout::new(repo_root);
    let run_layout = repo_layout.run(run_id);
    let git = Git::new(repo_root);
    let agent_runner = CursorAgentRunner::default();

    state_store::save_run_meta(
        run_layout.root(),
        &crate::core::types::RunMeta {
            id: run_id.to_string(),
            start_time: now_unix_string(),
            path: run_layout.root().to_string_lossy().to_string(),
            flow_ref: flow_dir.to_string_lossy().to_string(),
        },
    )?;

    run_flow_with(&git, &run_layout, &flow, run_id, config, &agent_runner, cancel)
}

fn now_unix_string() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("unix:{secs}")
}

/// Testable core of [`run_flow`], generic over the Agent Runner backend.
pub fn run_flow_with<R>(
    git: &Git,
    run_layout: &RunLayout,
    flow: &Flow,
    run_id: &str,
    config: &EngineConfig,
    agent_runner: &R,
    cancel: &CancelFlag,
) -> Result<RunOutcome>
where
    R: AgentRunner + Sync,
{
    let mut states: HashMap<String, LaneState> = flow
        .lanes
        .iter()
        .map(|lane| {
            let depends_on = direct_lane_deps(lane, &flow.lanes);
            (
                lane.lane_name.clone(),
                LaneState::new_pending(&lane.lane_name, &lane.lane_name, lane.tasks.len() as u32, depends_on),
            )
        })
        .collect();
    for (name, state) in &states {
        state_store::save(&run_layout.lane(name), state)?;
    }

    let (tx, rx) = mpsc::channel::<LaneEvent>();
    let mut running: usize = 0;
    let mut any_failed = false;
    let mut any_paused = false;
    let mut pending_lanes = flow.lanes.len();
    let mut in_flight: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut cancelled = false;

    // One scope for the whole run: lane threads are spawned as lanes become
    // ready and joined implicitly when the scope exits, after the loop below
    // has already drained every completion event from `rx`.
    thread::scope(|scope| -> Result<()> {
        loop {
            if cancel.term_requested() {
                cancelled = true;
                signal_in_flight_lanes(run_layout, &in_flight, cancel.kill_requested());
            } else {
                let ready = ready_lanes(&flow.lanes, &states);
                for lane_name in ready {
                    if running >= config.max_concurrent_lanes as usize {
                        break;
                    }
                    let lane = flow.lanes.iter().find(|l| l.lane_name == lane_name).expect("ready lane exists");
                    states.get_mut(&lane_name).unwrap().status = LaneStatus::Waiting;
                    let tx = tx.clone();
                    let base_branch = flow.meta.base_branch.clone();
                    let all_lanes = &flow.lanes;
                    in_flight.insert(lane_name.clone());
                    scope.spawn(move || {
                        let outcome = run_one_lane(
                            git, run_layout, lane, all_lanes, run_id, &base_branch, agent_runner, config,
                        )
                        .map_err(|e| format!("{e:#}"));
                        let _ = tx.send(LaneEvent {
                            lane_name: lane.lane_name.clone(),
                            outcome,
                        });
                    });
                    running += 1;
                }
            }

            if running == 0 {
                break;
            }

            match rx.recv_timeout(SCHEDULER_POLL_INTERVAL) {
                Ok(event) => {
                    running -= 1;
                    pending_lanes -= 1;
                    in_flight.remove(&event.lane_name);
                    match &event.outcome {
                        Ok(LaneOutcome::Completed) => {
                            info!(lane = %event.lane_name, "lane completed");
                        }
                        Ok(LaneOutcome::Paused) => {
                            any_paused = true;
                            warn!(lane = %event.lane_name, "lane paused");
                        }
                        Ok(LaneOutcome::Failed) => {
                            any_failed = true;
                            warn!(lane = %event.lane_name, "lane failed");
                        }
                        Err(err) => {
                            any_failed = true;
                            warn!(lane = %event.lane_name, err = %err, "lane executor errored");
                        }
                    }
                    if let Some(latest) = state_store::load(&run_layout.lane(&event.lane_name))? {
                        states.insert(event.lane_name.clone(), latest);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if pending_lanes == 0 && running == 0 {
                break;
            }
        }
        Ok(())
    })?;

    if cancelled {
        Ok(RunOutcome::Cancelled)
    } else if any_failed {
        Ok(RunOutcome::SomeFailed)
    } else if any_paused {
        Ok(RunOutcome::SomePaused)
    } else {
        Ok(RunOutcome::AllCompleted)
    }
}

/// Signal every currently in-flight lane's agent process: SIGTERM on the
/// first Ctrl-C, escalating to SIGKILL on the second (§5 Cancellation).
/// Reads each lane's `pid` fresh from disk since the scheduler's in-memory
/// `states` map is only updated when a lane reports back.
fn signal_in_flight_lanes(run_layout: &RunLayout, in_flight: &std::collections::HashSet<String>, kill: bool) {
    let sig = if kill { SIGKILL } else { SIGTERM };
    for lane_name in in_flight {
        if let Ok(Some(state)) = state_store::load(&run_layout.lane(lane_name))
            && let Some(pid) = state.pid
        {
            send_signal(pid, sig);
        }
    }
}

fn run_one_lane<R>(
    git: &Git,
    run_layout: &RunLayout,
    lane: &LaneConfig,
    lanes: &[LaneConfig],
    run_id: &str,
    base_branch: &str,
    agent_runner: &R,
    config: &EngineConfig,
) -> Result<LaneOutcome>
where
    R: AgentRunner,
{
    let depends_on = direct_lane_deps(lane, lanes);
    let mut state = start_lane(git, run_layout, lane, &lane.lane_name, base_branch, run_id, depends_on)?;
    let worktree = PathBuf::from(state.worktree_dir.clone().context("lane missing worktree_dir")?);
    let lane_git = Git::new(&worktree);
    run_lane_tasks(&lane_git, run_layout, lane, &mut state, agent_runner, config)
}

/// Every task-level `dependsOn` target outside `lane`, resolved to its exact
/// task (§3: `laneId` expands to that lane's last task). Kept at task
/// granularity rather than collapsed to a lane name, so readiness/resume
/// checks downstream can unblock on a specific task instead of waiting for
/// the whole dependency lane to finish (§4.5).
fn direct_lane_deps(lane: &LaneConfig, lanes: &[LaneConfig]) -> Vec<TaskNode> {
    let mut deps: Vec<TaskNode> = lane
        .tasks
        .iter()
        .flat_map(|t| t.depends_on.iter())
        .map(|d| resolve_task_dependency(d, lanes))
        .filter(|dep| dep.lane != lane.lane_name)
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

/// Idle-heartbeat cadence used by the scheduler while waiting for the next
/// Lane Executor event, kept here so callers that poll (e.g. a CLI progress
/// bar) share the same cadence as the Agent Runner's own heartbeat.
pub const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FlowMeta, FlowStatus, TaskConfig};
    use crate::test_support::{init_bare_repo_with_commit, ScriptedAgentRunner};

    fn lane(name: &str, depends_on: Vec<&str>) -> LaneConfig {
        LaneConfig {
            lane_name: name.to_string(),
            branch_prefix: None,
            tasks: vec![TaskConfig {
                name: "only".to_string(),
                model: "gpt".to_string(),
                prompt: "do it".to_string(),
                depends_on: depends_on.into_iter().map(str::to_string).collect(),
                timeout: None,
            }],
        }
    }

    #[test]
    fn single_lane_flow_completes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo_root = temp.path().join("repo");
        init_bare_repo_with_commit(&repo_root);
        let git = Git::new(&repo_root);
        let run_layout = RepoLayout::new(temp.path().join("workspace")).run("run-1");

        let flow = Flow {
            meta: FlowMeta {
                id: "f1".to_string(),
                name: "demo".to_string(),
                created_at: "now".to_string(),
                base_branch: "main".to_string(),
                status: FlowStatus::Active,
                lanes: vec!["solo".to_string()],
            },
            lanes: vec![lane("solo", vec![])],
        };
        let config = EngineConfig::default();
        let runner = ScriptedAgentRunner::completed();

        let outcome =
            run_flow_with(&git, &run_layout, &flow, "run-1", &config, &runner, &CancelFlag::new()).expect("run flow");
        assert_eq!(outcome, RunOutcome::AllCompleted);
    }

    #[test]
    fn two_independent_lanes_both_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo_root = temp.path().join("repo");
        init_bare_repo_with_commit(&repo_root);
        let git = Git::new(&repo_root);
        let run_layout = RepoLayout::new(temp.path().join("workspace")).run("run-1");

        let flow = Flow {
            meta: FlowMeta {
                id: "f1".to_string(),
                name: "demo".to_string(),
                created_at: "now".to_string(),
                base_branch: "main".to_string(),
                status: FlowStatus::Active,
                lanes: vec!["a".to_string(), "b".to_string()],
            },
            lanes: vec![lane("a", vec![]), lane("b", vec![])],
        };
        let mut config = EngineConfig::default();
        config.max_concurrent_lanes = 2;
        let runner = ScriptedAgentRunner::completed_n(2);

        let outcome =
            run_flow_with(&git, &run_layout, &flow, "run-1", &config, &runner, &CancelFlag::new()).expect("run flow");
        assert_eq!(outcome, RunOutcome::AllCompleted);

        let lanes = state_store::list_lanes(run_layout.root()).expect("list lanes");
        assert_eq!(lanes.len(), 2);
        assert!(lanes.iter().all(|l| l.status == LaneStatus::Completed));
    }

    #[test]
    fn cancel_flag_set_before_any_lane_reports_yields_cancelled_outcome() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo_root = temp.path().join("repo");
        init_bare_repo_with_commit(&repo_root);
        let git = Git::new(&repo_root);
        let run_layout = RepoLayout::new(temp.path().join("workspace")).run("run-1");

        let flow = Flow {
            meta: FlowMeta {
                id: "f1".to_string(),
                name: "demo".to_string(),
                created_at: "now".to_string(),
                base_branch: "main".to_string(),
                status: FlowStatus::Active,
                lanes: vec!["solo".to_string()],
            },
            lanes: vec![lane("solo", vec![])],
        };
        let config = EngineConfig::default();
        let runner = ScriptedAgentRunner::completed();
        let cancel = CancelFlag::new();
        cancel.request_term();

        let outcome = run_flow_with(&git, &run_layout, &flow, "run-1", &config, &runner, &cancel).expect("run flow");
        assert_eq!(outcome, RunOutcome::Cancelled);
    }
}
