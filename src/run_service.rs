//! C6: run enumeration, inspection, zombie detection, stop, and deletion.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::types::{LaneState, LaneStatus};
use crate::core::zombie::{classify, LaneHealth};
use crate::io::git::Git;
use crate::io::process_probe::{pid_is_alive, send_signal, SIGKILL, SIGTERM};
use crate::io::run_layout::RepoLayout;
use crate::io::state_store;

/// A run's id plus its lanes' last-persisted state.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub lanes: Vec<LaneState>,
}

/// Signal a `stop` request should send to a lane's agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Kill,
}

/// What `delete` removes alongside the run's own log directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub remove_branches: bool,
    pub remove_worktrees: bool,
}

/// List run ids under a repo's `_cursorflow/logs/runs/`, most recent first
/// (ids are `run-<unix-millis>`, so reverse-lexicographic order is
/// reverse-chronological).
pub fn list_runs(repo_layout: &RepoLayout) -> Result<Vec<String>> {
    let runs_dir = repo_layout.runs_dir();
    if !runs_dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = fs::read_dir(&runs_dir)
        .with_context(|| format!("read {}", runs_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(ids)
}

/// Find the most recent Run against `flow_dir` that has not yet completed
/// every lane, so `run` can delegate to the Resume Engine instead of
/// silently starting a second, duplicate Run over the same Flow (§4.5: an
/// existing incomplete Run is resumed automatically, not left for the
/// caller to notice and resume by hand).
pub fn find_resumable_run(repo_layout: &RepoLayout, flow_dir: &Path) -> Result<Option<String>> {
    let flow_ref = flow_dir.to_string_lossy().to_string();
    for run_id in list_runs(repo_layout)? {
        let run_layout = repo_layout.run(&run_id);
        let Some(meta) = state_store::load_run_meta(run_layout.root())? else {
            continue;
        };
        if meta.flow_ref != flow_ref {
            continue;
        }
        let lanes = state_store::list_lanes(run_layout.root()).unwrap_or_default();
        let all_completed = !lanes.is_empty() && lanes.iter().all(|l| l.status == LaneStatus::Completed);
        if all_completed {
            continue;
        }
        return Ok(Some(run_id));
    }
    Ok(None)
}

/// Load every lane's state for one run.
pub fn describe_run(repo_layout: &RepoLayout, run_id: &str) -> Result<RunSummary> {
    let run_layout = repo_layout.run(run_id);
    let lanes = state_store::list_lanes(run_layout.root())
        .with_context(|| format!("describe run {run_id}"))?;
    Ok(RunSummary {
        run_id: run_id.to_string(),
        lanes,
    })
}

/// Probe every `running` lane in a run and report which are zombies (their
/// recorded `pid` is no longer alive).
#[instrument(skip(repo_layout))]
pub fn detect_zombies(repo_layout: &RepoLayout, run_id: &str) -> Result<Vec<String>> {
    let summary = describe_run(repo_layout, run_id)?;
    let mut zombies = Vec::new();
    for lane in &summary.lanes {
        let pid_alive = lane.pid.map(pid_is_alive);
        if classify(lane, pid_alive) == LaneHealth::Zombie {
            warn!(lane = %lane.lane_name, "zombie lane detected");
            zombies.push(lane.lane_name.clone());
        }
    }
    Ok(zombies)
}

/// Probe every `running` lane across every run, for periodic sweeps.
pub fn detect_zombies_all_runs(repo_layout: &RepoLayout) -> Result<HashMap<String, Vec<String>>> {
    let mut out = HashMap::new();
    for run_id in list_runs(repo_layout)? {
        let zombies = detect_zombies(repo_layout, &run_id)?;
        if !zombies.is_empty() {
            out.insert(run_id, zombies);
        }
    }
    Ok(out)
}

/// Send `SIGTERM` or `SIGKILL` to a lane's recorded pid. Does not alter
/// persisted `LaneState`; the Lane Executor observes the process exit and
/// updates state on its own thread.
pub fn stop_lane(repo_layout: &RepoLayout, run_id: &str, lane_name: &str, signal: StopSignal) -> Result<()> {
    let run_layout = repo_layout.run(run_id);
    let lane_path = run_layout.lane(lane_name);
    let state = state_store::load(&lane_path)?
        .with_context(|| format!("lane {lane_name} has no state in run {run_id}"))?;
    let Some(pid) = state.pid else {
        info!(lane = %lane_name, "lane has no recorded pid, nothing to signal");
        return Ok(());
    };
    let sig = match signal {
        StopSignal::Term => SIGTERM,
        StopSignal::Kill => SIGKILL,
    };
    send_signal(pid, sig);
    Ok(())
}

/// Delete a run's log directory and, if requested, its lanes' worktrees and
/// branches. Worktree/branch removal is best-effort: a branch or worktree
/// already gone is not an error.
#[instrument(skip(repo_git, repo_layout))]
pub fn delete_run(
    repo_git: &Git,
    repo_layout: &RepoLayout,
    run_id: &str,
    opts: DeleteOptions,
) -> Result<()> {
    let run_layout = repo_layout.run(run_id);
    let lanes = state_store::list_lanes(run_layout.root()).unwrap_or_default();

    if opts.remove_worktrees {
        for lane in &lanes {
            if let Some(dir) = &lane.worktree_dir {
                let path = Path::new(dir);
                if let Err(err) = repo_git.remove_worktree(path, true) {
                    warn!(lane = %lane.lane_name, err = %err, "failed to remove worktree (non-fatal)");
                }
            }
        }
    }
    if opts.remove_branches {
        for lane in &lanes {
            if let Some(branch) = &lane.pipeline_branch
                && let Err(err) = repo_git.delete_branch(branch, false, true)
            {
                warn!(lane = %lane.lane_name, err = %err, "failed to remove branch (non-fatal)");
            }
        }
    }

    let root = run_layout.root();
    if root.exists() {
        fs::remove_dir_all(root).with_context(|| format!("remove run directory {}", root.display()))?;
    }
    info!(run_id, "run deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LaneState;

    #[test]
    fn list_runs_returns_empty_when_no_runs_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RepoLayout::new(temp.path());
        assert!(list_runs(&layout).expect("list").is_empty());
    }

    #[test]
    fn list_runs_sorted_most_recent_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RepoLayout::new(temp.path());
        fs::create_dir_all(layout.runs_dir().join("run-100")).expect("mkdir");
        fs::create_dir_all(layout.runs_dir().join("run-200")).expect("mkdir");
        assert_eq!(list_runs(&layout).expect("list"), vec!["run-200", "run-100"]);
    }

    #[test]
    fn find_resumable_run_skips_other_flows_and_fully_completed_runs() {
        use crate::core::types::RunMeta;

        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RepoLayout::new(temp.path());
        let flow_dir = temp.path().join("flow");

        let done_run = layout.run("run-100");
        state_store::save_run_meta(
            done_run.root(),
            &RunMeta {
                id: "run-100".to_string(),
                start_time: "unix:1".to_string(),
                path: done_run.root().to_string_lossy().to_string(),
                flow_ref: flow_dir.to_string_lossy().to_string(),
            },
        )
        .expect("save meta");
        let mut done_state = LaneState::new_pending("a", "a.json", 1, vec![]);
        done_state.status = LaneStatus::Completed;
        state_store::save(&done_run.lane("a"), &done_state).expect("save lane");

        let incomplete_run = layout.run("run-200");
        state_store::save_run_meta(
            incomplete_run.root(),
            &RunMeta {
                id: "run-200".to_string(),
                start_time: "unix:2".to_string(),
                path: incomplete_run.root().to_string_lossy().to_string(),
                flow_ref: flow_dir.to_string_lossy().to_string(),
            },
        )
        .expect("save meta");
        let mut running_state = LaneState::new_pending("a", "a.json", 1, vec![]);
        running_state.status = LaneStatus::Running;
        state_store::save(&incomplete_run.lane("a"), &running_state).expect("save lane");

        let other_flow_run = layout.run("run-300");
        state_store::save_run_meta(
            other_flow_run.root(),
            &RunMeta {
                id: "run-300".to_string(),
                start_time: "unix:3".to_string(),
                path: other_flow_run.root().to_string_lossy().to_string(),
                flow_ref: temp.path().join("other-flow").to_string_lossy().to_string(),
            },
        )
        .expect("save meta");

        let found = find_resumable_run(&layout, &flow_dir).expect("find");
        assert_eq!(found, Some("run-200".to_string()));
    }

    #[test]
    fn describe_run_loads_lane_states() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RepoLayout::new(temp.path());
        let run_layout = layout.run("run-1");
        state_store::save(&run_layout.lane("a"), &LaneState::new_pending("a", "a.json", 1, vec![])).expect("save");

        let summary = describe_run(&layout, "run-1").expect("describe");
        assert_eq!(summary.lanes.len(), 1);
        assert_eq!(summary.lanes[0].lane_name, "a");
    }

    #[test]
    fn detect_zombies_flags_running_lane_with_dead_pid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RepoLayout::new(temp.path());
        let run_layout = layout.run("run-1");
        let mut state = LaneState::new_pending("a", "a.json", 1, vec![]);
        state.status = LaneStatus::Running;
        state.pid = Some(u32::MAX - 1);
        state_store::save(&run_layout.lane("a"), &state).expect("save");

        let zombies = detect_zombies(&layout, "run-1").expect("detect");
        assert_eq!(zombies, vec!["a".to_string()]);
    }

    #[test]
    fn delete_run_removes_log_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = RepoLayout::new(temp.path());
        let run_layout = layout.run("run-1");
        state_store::save(&run_layout.lane("a"), &LaneState::new_pending("a", "a.json", 1, vec![])).expect("save");
        let git = Git::new(temp.path());

        delete_run(&git, &layout, "run-1", DeleteOptions::default()).expect("delete");
        assert!(!run_layout.root().exists());
    }
}
