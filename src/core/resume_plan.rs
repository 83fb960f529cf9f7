//! Pure partitioning logic for the Resume/Recovery Engine (§4.7).

use std::collections::HashMap;

use crate::core::types::{LaneConfig, LaneState, LaneStatus, TaskNode};
use crate::core::zombie::{classify, LaneHealth};

/// A lane's resume classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeClass {
    Completed,
    Resumable,
    Unresolvable,
}

/// Classify every lane in a run. `pid_alive` supplies the OS probe result
/// (`None` if not running) for lanes whose status is `running`. `lanes`
/// supplies each task's position within its lane, so a dependency on a
/// specific task (`laneId:taskName`) can be checked without requiring that
/// task's whole lane to have reached `completed`.
pub fn classify_lanes(
    lanes: &[LaneConfig],
    states: &HashMap<String, LaneState>,
    pid_alive: &HashMap<String, bool>,
) -> HashMap<String, ResumeClass> {
    let task_index = task_index_by_lane(lanes);

    let mut classes = HashMap::new();
    for (name, state) in states {
        if state.status == LaneStatus::Completed {
            classes.insert(name.clone(), ResumeClass::Completed);
            continue;
        }

        let is_zombie = state.status == LaneStatus::Running
            && classify(state, pid_alive.get(name).copied()) == LaneHealth::Zombie;

        let directly_resumable = matches!(state.status, LaneStatus::Failed | LaneStatus::Paused)
            || is_zombie
            || (state.status == LaneStatus::Pending && state.current_task_index > 0);

        if !directly_resumable {
            classes.insert(name.clone(), ResumeClass::Unresolvable);
            continue;
        }

        let deps_ok = state
            .depends_on
            .iter()
            .all(|dep| dependency_task_completed(dep, states, &task_index));
        if deps_ok {
            classes.insert(name.clone(), ResumeClass::Resumable);
        } else {
            classes.insert(name.clone(), ResumeClass::Unresolvable);
        }
    }
    classes
}

/// Per-lane task name -> position, used to check a dependency task's
/// completion without requiring its whole lane to be `completed` (§3, §4.5).
fn task_index_by_lane(lanes: &[LaneConfig]) -> HashMap<(&str, &str), usize> {
    lanes
        .iter()
        .flat_map(|lane| {
            lane.tasks
                .iter()
                .enumerate()
                .map(move |(i, task)| ((lane.lane_name.as_str(), task.name.as_str()), i))
        })
        .collect()
}

fn dependency_task_completed(
    dep: &TaskNode,
    states: &HashMap<String, LaneState>,
    task_index: &HashMap<(&str, &str), usize>,
) -> bool {
    let Some(state) = states.get(&dep.lane) else {
        return false;
    };
    let Some(&index) = task_index.get(&(dep.lane.as_str(), dep.task.as_str())) else {
        return false;
    };
    state.current_task_index as usize > index
}

/// Outcome of planning a resume over the resumable set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Lanes that may launch immediately, in lexicographic order.
    pub launchable: Vec<String>,
    /// True when no resumable lane can start and nothing is running: deadlock.
    pub deadlocked: bool,
}

/// Run a miniature scheduler pass over the resumable set: a lane can start
/// when all its `dependsOn` are in the "session-completed" set, which
/// initially contains every pre-existing `completed` lane.
pub fn plan_resume(
    lanes: &[LaneConfig],
    classes: &HashMap<String, ResumeClass>,
    states: &HashMap<String, LaneState>,
    any_running: bool,
) -> ResumePlan {
    let task_index = task_index_by_lane(lanes);

    let mut launchable: Vec<String> = lanes
        .iter()
        .filter(|lane| classes.get(&lane.lane_name) == Some(&ResumeClass::Resumable))
        .filter(|lane| {
            states.get(&lane.lane_name).is_some_and(|s| {
                s.depends_on
                    .iter()
                    .all(|d| dependency_task_completed(d, states, &task_index))
            })
        })
        .map(|lane| lane.lane_name.clone())
        .collect();
    launchable.sort();

    // A lane classified Unresolvable (e.g. two lanes each waiting on the
    // other's failed task) still counts toward deadlock: nothing launchable,
    // nothing running, and work remains that will never become launchable.
    let deadlocked = launchable.is_empty()
        && !any_running
        && classes.values().any(|c| *c != ResumeClass::Completed);

    ResumePlan {
        launchable,
        deadlocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskConfig;

    fn lane(name: &str) -> LaneConfig {
        lane_with_tasks(name, vec!["t"])
    }

    fn lane_with_tasks(name: &str, tasks: Vec<&str>) -> LaneConfig {
        LaneConfig {
            lane_name: name.to_string(),
            branch_prefix: None,
            tasks: tasks
                .into_iter()
                .map(|t| TaskConfig {
                    name: t.to_string(),
                    model: "gpt".to_string(),
                    prompt: "p".to_string(),
                    depends_on: vec![],
                    timeout: None,
                })
                .collect(),
        }
    }

    #[test]
    fn zombie_lane_is_resumable() {
        let lanes = vec![lane("l1")];
        let mut s = LaneState::new_pending("l1", "l1.json", 1, vec![]);
        s.status = LaneStatus::Running;
        s.pid = Some(999);
        let mut states = HashMap::new();
        states.insert("l1".to_string(), s);
        let pid_alive = HashMap::from([("l1".to_string(), false)]);

        let classes = classify_lanes(&lanes, &states, &pid_alive);
        assert_eq!(classes["l1"], ResumeClass::Resumable);
    }

    #[test]
    fn unresolvable_when_dependency_not_completed() {
        let lanes = vec![lane("dependent"), lane("base")];
        let mut s = LaneState::new_pending("dependent", "d.json", 1, vec![TaskNode::new("base", "t")]);
        s.status = LaneStatus::Failed;
        let mut base = LaneState::new_pending("base", "b.json", 1, vec![]);
        base.status = LaneStatus::Failed;

        let mut states = HashMap::new();
        states.insert("dependent".to_string(), s);
        states.insert("base".to_string(), base);

        let classes = classify_lanes(&lanes, &states, &HashMap::new());
        assert_eq!(classes["dependent"], ResumeClass::Unresolvable);
        assert_eq!(classes["base"], ResumeClass::Resumable);
    }

    #[test]
    fn unresolvable_becomes_resumable_once_its_specific_dependency_task_advances() {
        // "dependent" depends on "base:first", not all of "base" — it should
        // unblock as soon as that task's index is passed, even though "base"
        // (now on its second task) has not reached a terminal status.
        let lanes = vec![
            lane_with_tasks("base", vec!["first", "second"]),
            lane("dependent"),
        ];
        let mut dependent = LaneState::new_pending(
            "dependent",
            "d.json",
            1,
            vec![TaskNode::new("base", "first")],
        );
        dependent.status = LaneStatus::Failed;
        let mut base = LaneState::new_pending("base", "b.json", 2, vec![]);
        base.status = LaneStatus::Running;
        base.current_task_index = 1;

        let mut states = HashMap::new();
        states.insert("dependent".to_string(), dependent);
        states.insert("base".to_string(), base);

        let classes = classify_lanes(&lanes, &states, &HashMap::new());
        assert_eq!(classes["dependent"], ResumeClass::Resumable);
    }

    #[test]
    fn deadlock_detected_when_nothing_launchable_and_nothing_running() {
        let lanes = vec![lane("a"), lane("b")];
        let mut a = LaneState::new_pending("a", "a.json", 1, vec![TaskNode::new("b", "t")]);
        a.status = LaneStatus::Failed;
        let mut b = LaneState::new_pending("b", "b.json", 1, vec![TaskNode::new("a", "t")]);
        b.status = LaneStatus::Failed;

        let mut states = HashMap::new();
        states.insert("a".to_string(), a);
        states.insert("b".to_string(), b);

        let classes = classify_lanes(&lanes, &states, &HashMap::new());
        let plan = plan_resume(&lanes, &classes, &states, false);
        assert!(plan.deadlocked);
        assert!(plan.launchable.is_empty());
    }

    #[test]
    fn launchable_lanes_are_lexicographic() {
        let lanes = vec![lane("zeta"), lane("alpha")];
        let mut z = LaneState::new_pending("zeta", "z.json", 1, vec![]);
        z.status = LaneStatus::Paused;
        let mut a = LaneState::new_pending("alpha", "a.json", 1, vec![]);
        a.status = LaneStatus::Paused;

        let mut states = HashMap::new();
        states.insert("zeta".to_string(), z);
        states.insert("alpha".to_string(), a);

        let classes = classify_lanes(&lanes, &states, &HashMap::new());
        let plan = plan_resume(&lanes, &classes, &states, false);
        assert_eq!(plan.launchable, vec!["alpha", "zeta"]);
    }
}
