//! C7: resume/recovery. Classifies a run's lanes, runs a minimal Git-level
//! preflight check, and drives the resumable set to completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, instrument, warn};

use crate::cancel::CancelFlag;
use crate::core::resume_plan::{classify_lanes, plan_resume, ResumeClass};
use crate::core::types::{LaneConfig, LaneState, LaneStatus};
use crate::dag::{LaneEvent, RunOutcome, SCHEDULER_POLL_INTERVAL};
use crate::io::agent_runner::AgentRunner;
use crate::io::config::EngineConfig;
use crate::io::flow_config::Flow;
use crate::io::git::Git;
use crate::io::process_probe::{pid_is_alive, send_signal, SIGKILL, SIGTERM};
use crate::io::run_layout::RunLayout;
use crate::io::state_store;
use crate::lane::{run_lane_tasks, LaneOutcome};

/// Result of the minimal preflight check run before a resume, unless
/// `--skip-doctor` was passed. Checks Git-level invariants only: the full
/// interactive `doctor` surface (tool versions, auth, network) is out of scope.
#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    pub problems: Vec<String>,
}

impl DoctorReport {
    pub fn ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check that the Flow's base branch still exists and the repository is a
/// usable Git working tree.
pub fn doctor_check(repo_git: &Git, base_branch: &str) -> Result<DoctorReport> {
    let mut problems = Vec::new();
    match repo_git.branch_exists(base_branch) {
        Ok(true) => {}
        Ok(false) => problems.push(format!("base branch '{base_branch}' not found")),
        Err(err) => problems.push(format!("git error checking base branch: {err}")),
    }
    Ok(DoctorReport { problems })
}

/// Resume a run: classify every lane, optionally doctor-check, then drive
/// the resumable set to completion with the same concurrency model as a
/// fresh run (§4.7).
#[instrument(skip_all, fields(run_id))]
pub fn resume_run<R>(
    repo_git: &Git,
    run_layout: &RunLayout,
    flow: &Flow,
    run_id: &str,
    config: &EngineConfig,
    agent_runner: &R,
    skip_doctor: bool,
    cancel: &CancelFlag,
) -> Result<RunOutcome>
where
    R: AgentRunner + Sync,
{
    if !skip_doctor {
        let report = doctor_check(repo_git, &flow.meta.base_branch)?;
        if !report.ok() {
            return Err(anyhow!("doctor check failed: {}", report.problems.join("; ")));
        }
    }

    let mut states: HashMap<String, LaneState> = flow
        .lanes
        .iter()
        .filter_map(|lane| {
            state_store::load(&run_layout.lane(&lane.lane_name))
                .ok()
                .flatten()
                .map(|s| (lane.lane_name.clone(), s))
        })
        .collect();

    let pid_alive: HashMap<String, bool> = states
        .iter()
        .filter(|(_, s)| s.status == LaneStatus::Running)
        .filter_map(|(name, s)| s.pid.map(|pid| (name.clone(), pid_is_alive(pid))))
        .collect();

    let mut classes = classify_lanes(&flow.lanes, &states, &pid_alive);
    if classes.values().any(|c| *c == ResumeClass::Unresolvable) {
        let unresolvable: Vec<&str> = classes
            .iter()
            .filter(|(_, c)| **c == ResumeClass::Unresolvable)
            .map(|(name, _)| name.as_str())
            .collect();
        warn!(lanes = ?unresolvable, "unresolvable lanes excluded from resume");
    }

    for (name, state) in states.iter_mut() {
        if classes.get(name) == Some(&ResumeClass::Resumable) {
            state.status = LaneStatus::Pending;
            state.error = None;
            state.dependency_request = None;
            state.pid = None;
            state_store::save(&run_layout.lane(name), state)?;
        }
    }

    let (tx, rx) = mpsc::channel::<LaneEvent>();
    let mut running = 0usize;
    let mut any_failed = false;
    let mut any_paused = false;
    let mut in_flight: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut cancelled = false;

    thread::scope(|scope| -> Result<()> {
        loop {
            if cancel.term_requested() {
                cancelled = true;
                signal_in_flight_lanes(run_layout, &in_flight, cancel.kill_requested());
            } else {
                let plan = plan_resume(&flow.lanes, &classes, &states, running > 0);
                if plan.deadlocked {
                    warn!("resume deadlocked: resumable lanes remain but none are launchable");
                    any_failed = true;
                    break;
                }

                for lane_name in &plan.launchable {
                    if running >= config.max_concurrent_lanes as usize {
                        break;
                    }
                    if states.get(lane_name).map(|s| s.status) != Some(LaneStatus::Pending) {
                        continue;
                    }
                    let lane = flow
                        .lanes
                        .iter()
                        .find(|l| &l.lane_name == lane_name)
                        .expect("launchable lane exists in flow");
                    states.get_mut(lane_name).unwrap().status = LaneStatus::Waiting;
                    let tx = tx.clone();
                    in_flight.insert(lane_name.clone());
                    let base_branch = flow.meta.base_branch.as_str();
                    scope.spawn(move || {
                        let outcome = resume_one_lane(repo_git, run_layout, lane, base_branch, agent_runner, config)
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
                    in_flight.remove(&event.lane_name);
                    match &event.outcome {
                        Ok(LaneOutcome::Completed) => info!(lane = %event.lane_name, "lane completed"),
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
                    classes = classify_lanes(&flow.lanes, &states, &HashMap::new());
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
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

/// Signal every currently in-flight resumed lane's agent process: SIGTERM on
/// the first Ctrl-C, escalating to SIGKILL on the second (§5 Cancellation).
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

fn resume_one_lane<R>(
    repo_git: &Git,
    run_layout: &RunLayout,
    lane: &LaneConfig,
    base_branch: &str,
    agent_runner: &R,
    config: &EngineConfig,
) -> Result<LaneOutcome>
where
    R: AgentRunner,
{
    let lane_path = run_layout.lane(&lane.lane_name);
    let mut state = state_store::load(&lane_path)?
        .with_context(|| format!("lane {} missing state on resume", lane.lane_name))?;
    state.status = LaneStatus::Running;
    state_store::save(&lane_path, &state)?;
    let worktree = PathBuf::from(
        state
            .worktree_dir
            .clone()
            .with_context(|| format!("lane {} missing worktree_dir on resume", lane.lane_name))?,
    );
    if !worktree.exists() {
        reacquire_worktree(repo_git, &state, &worktree, base_branch)
            .with_context(|| format!("lane {} failed to reacquire worktree on resume", lane.lane_name))?;
    }
    let lane_git = Git::new(&worktree);
    run_lane_tasks(&lane_git, run_layout, lane, &mut state, agent_runner, config)
}

/// Recreate a lane's worktree after it was removed (cleanup, orphaned
/// zombie) so resume can pick up where the lane left off (§4.7, §9).
/// Re-attaches the existing pipeline branch when one was already recorded;
/// falls back to creating a fresh branch from `base_branch` only if the
/// lane never got that far.
fn reacquire_worktree(repo_git: &Git, state: &LaneState, worktree: &Path, base_branch: &str) -> Result<()> {
    match &state.pipeline_branch {
        Some(branch) if repo_git.branch_exists(branch)? => {
            repo_git.attach_worktree(branch, worktree)?;
        }
        Some(branch) => {
            repo_git.create_worktree(base_branch, branch, worktree)?;
        }
        None => bail!("lane has no recorded pipeline_branch to reacquire a worktree for"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FlowMeta, FlowStatus, TaskConfig};
    use crate::io::run_layout::RepoLayout;
    use crate::test_support::{init_bare_repo_with_commit, ScriptedAgentRunner};

    fn lane_config(name: &str) -> LaneConfig {
        LaneConfig {
            lane_name: name.to_string(),
            branch_prefix: None,
            tasks: vec![
                TaskConfig {
                    name: "t1".to_string(),
                    model: "gpt".to_string(),
                    prompt: "p".to_string(),
                    depends_on: vec![],
                    timeout: None,
                },
                TaskConfig {
                    name: "t2".to_string(),
                    model: "gpt".to_string(),
                    prompt: "p".to_string(),
                    depends_on: vec![],
                    timeout: None,
                },
            ],
        }
    }

    #[test]
    fn resume_continues_from_current_task_index() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo_root = temp.path().join("repo");
        init_bare_repo_with_commit(&repo_root);
        let repo_git = Git::new(&repo_root);
        let repo_layout = RepoLayout::new(temp.path().join("workspace"));
        let run_layout = repo_layout.run("run-1");

        let lane = lane_config("solo");
        let worktree = run_layout.lane("solo").join("worktree");
        repo_git.create_worktree("main", "lanes/solo/run-1", &worktree).expect("worktree");

        let mut state = LaneState::new_pending("solo", "solo.json", 2, vec![]);
        state.worktree_dir = Some(worktree.to_string_lossy().to_string());
        state.pipeline_branch = Some("lanes/solo/run-1".to_string());
        state.current_task_index = 1;
        state.status = LaneStatus::Failed;
        state.error = Some("crashed last time".to_string());
        state_store::save(&run_layout.lane("solo"), &state).expect("save");

        let flow = Flow {
            meta: FlowMeta {
                id: "f1".to_string(),
                name: "demo".to_string(),
                created_at: "now".to_string(),
                base_branch: "main".to_string(),
                status: FlowStatus::Active,
                lanes: vec!["solo".to_string()],
            },
            lanes: vec![lane],
        };
        let config = EngineConfig::default();
        let runner = ScriptedAgentRunner::completed();

        let outcome =
            resume_run(&repo_git, &run_layout, &flow, "run-1", &config, &runner, true, &CancelFlag::new()).expect("resume");
        assert_eq!(outcome, RunOutcome::AllCompleted);

        let final_state = state_store::load(&run_layout.lane("solo")).expect("load").expect("some");
        assert_eq!(final_state.current_task_index, 2);
        assert_eq!(final_state.status, LaneStatus::Completed);
    }

    #[test]
    fn resume_recreates_a_worktree_removed_since_the_last_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo_root = temp.path().join("repo");
        init_bare_repo_with_commit(&repo_root);
        let repo_git = Git::new(&repo_root);
        let repo_layout = RepoLayout::new(temp.path().join("workspace"));
        let run_layout = repo_layout.run("run-1");

        let lane = lane_config("solo");
        let worktree = run_layout.lane("solo").join("worktree");
        repo_git.create_worktree("main", "lanes/solo/run-1", &worktree).expect("worktree");

        let mut state = LaneState::new_pending("solo", "solo.json", 2, vec![]);
        state.worktree_dir = Some(worktree.to_string_lossy().to_string());
        state.pipeline_branch = Some("lanes/solo/run-1".to_string());
        state.current_task_index = 1;
        state.status = LaneStatus::Failed;
        state.error = Some("crashed last time".to_string());
        state_store::save(&run_layout.lane("solo"), &state).expect("save");

        // Simulate the worktree having been cleaned up or orphaned between
        // the crash and the resume attempt.
        repo_git.remove_worktree(&worktree, true).expect("remove worktree");
        assert!(!worktree.exists());

        let flow = Flow {
            meta: FlowMeta {
                id: "f1".to_string(),
                name: "demo".to_string(),
                created_at: "now".to_string(),
                base_branch: "main".to_string(),
                status: FlowStatus::Active,
                lanes: vec!["solo".to_string()],
            },
            lanes: vec![lane],
        };
        let config = EngineConfig::default();
        let runner = ScriptedAgentRunner::completed();

        let outcome =
            resume_run(&repo_git, &run_layout, &flow, "run-1", &config, &runner, true, &CancelFlag::new()).expect("resume");
        assert_eq!(outcome, RunOutcome::AllCompleted);

        let final_state = state_store::load(&run_layout.lane("solo")).expect("load").expect("some");
        assert_eq!(final_state.current_task_index, 2);
        assert_eq!(final_state.status, LaneStatus::Completed);
    }

    #[test]
    fn doctor_check_flags_missing_base_branch() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_bare_repo_with_commit(&temp.path().join("repo"));
        let git = Git::new(temp.path().join("repo"));

        let report = doctor_check(&git, "does-not-exist").expect("doctor");
        assert!(!report.ok());
    }
}
