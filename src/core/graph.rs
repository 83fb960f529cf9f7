//! Task-level dependency graph: construction, validation, and readiness.
//!
//! Pure over in-memory `LaneConfig`/`LaneState` data — no I/O. Mirrors the
//! separation between a tree's semantic invariants and its traversal
//! selector, generalized from a single tree to a multi-lane DAG.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::types::{LaneConfig, LaneState, LaneStatus, TaskGraph, TaskNode};

/// Build the task-level node/edge set for a Flow's lanes.
///
/// Unqualified `laneId` dependencies expand to `(laneId, laneId.lastTask)`.
/// Does not validate; call [`validate_graph`] before relying on the result.
pub fn build_graph(lanes: &[LaneConfig]) -> TaskGraph {
    let mut nodes = Vec::new();
    let mut edges: BTreeMap<TaskNode, Vec<TaskNode>> = BTreeMap::new();
    let last_task: HashMap<&str, &str> = lanes
        .iter()
        .filter_map(|lane| lane.tasks.last().map(|t| (lane.lane_name.as_str(), t.name.as_str())))
        .collect();

    for lane in lanes {
        for (i, task) in lane.tasks.iter().enumerate() {
            let node = TaskNode::new(lane.lane_name.clone(), task.name.clone());
            nodes.push(node.clone());
            let mut deps = Vec::new();
            // Implicit intra-lane ordering: task i cannot start before task
            // i-1 in the same lane completes. This is never itself a cycle
            // (it's just the lane's sequential order), but it combines with
            // an explicit same-lane dependsOn to catch the *reversed* form —
            // an earlier task declaring it depends on a later one — as the
            // 2-cycle it actually is, per the spec's open question (§9).
            if i > 0 {
                deps.push(TaskNode::new(lane.lane_name.clone(), lane.tasks[i - 1].name.clone()));
            }
            for dep in &task.depends_on {
                deps.push(resolve_dependency(dep, &last_task));
            }
            edges.insert(node, deps);
        }
    }

    TaskGraph { nodes, edges }
}

fn resolve_dependency(dep: &str, last_task: &HashMap<&str, &str>) -> TaskNode {
    if let Some((lane, task)) = dep.split_once(':') {
        TaskNode::new(lane, task)
    } else {
        let task = last_task.get(dep).copied().unwrap_or("");
        TaskNode::new(dep, task)
    }
}

/// Resolve a single `dependsOn` entry against a Flow's lanes. Shared by the
/// scheduler (to populate `LaneState.depends_on`) and this module's own
/// `build_graph`, so both ends of a dependency edge agree on which task an
/// unqualified `laneId` entry actually means.
pub fn resolve_task_dependency(dep: &str, lanes: &[LaneConfig]) -> TaskNode {
    let last_task: HashMap<&str, &str> = lanes
        .iter()
        .filter_map(|lane| lane.tasks.last().map(|t| (lane.lane_name.as_str(), t.name.as_str())))
        .collect();
    resolve_dependency(dep, &last_task)
}

/// Validation errors the scheduler must reject a Flow for, before any lane starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// `dependsOn` names a lane or task that does not exist.
    DanglingDependency { node: TaskNode, target: String },
    /// A task name is duplicated within a lane.
    DuplicateTaskName { lane: String, task: String },
    /// The graph contains a cycle; `path` lists nodes in order of discovery.
    Cycle { path: Vec<TaskNode> },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::DanglingDependency { node, target } => write!(
                f,
                "{}:{} depends on unknown '{}'",
                node.lane, node.task, target
            ),
            GraphError::DuplicateTaskName { lane, task } => {
                write!(f, "duplicate task name '{task}' in lane '{lane}'")
            }
            GraphError::Cycle { path } => {
                let names: Vec<String> = path.iter().map(|n| format!("{}:{}", n.lane, n.task)).collect();
                write!(f, "dependency cycle: {}", names.join(" -> "))
            }
        }
    }
}

/// Validate a Flow's lanes: duplicate task names, dangling deps, cycles.
///
/// Returns every violation found (not just the first), the way schema
/// validation reports every error rather than bailing on the first one.
pub fn validate_graph(lanes: &[LaneConfig]) -> Vec<GraphError> {
    let mut errors = Vec::new();
    let mut seen_lane_task: BTreeSet<(String, String)> = BTreeSet::new();
    let lane_names: BTreeSet<&str> = lanes.iter().map(|l| l.lane_name.as_str()).collect();

    for lane in lanes {
        for task in &lane.tasks {
            let key = (lane.lane_name.clone(), task.name.clone());
            if !seen_lane_task.insert(key) {
                errors.push(GraphError::DuplicateTaskName {
                    lane: lane.lane_name.clone(),
                    task: task.name.clone(),
                });
            }
        }
    }

    let graph = build_graph(lanes);
    let task_names_by_lane: HashMap<&str, BTreeSet<&str>> = lanes
        .iter()
        .map(|l| (l.lane_name.as_str(), l.tasks.iter().map(|t| t.name.as_str()).collect()))
        .collect();

    for lane in lanes {
        for task in &lane.tasks {
            let node = TaskNode::new(lane.lane_name.clone(), task.name.clone());
            for dep in &task.depends_on {
                let (dep_lane, dep_task) = match dep.split_once(':') {
                    Some((l, t)) => (l, Some(t)),
                    None => (dep.as_str(), None),
                };
                if !lane_names.contains(dep_lane) {
                    errors.push(GraphError::DanglingDependency {
                        node: node.clone(),
                        target: dep.clone(),
                    });
                    continue;
                }
                if let Some(t) = dep_task
                    && !task_names_by_lane.get(dep_lane).is_some_and(|s| s.contains(t))
                {
                    errors.push(GraphError::DanglingDependency {
                        node: node.clone(),
                        target: dep.clone(),
                    });
                }
            }
        }
    }

    if let Some(path) = find_cycle(&graph) {
        errors.push(GraphError::Cycle { path });
    }

    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Done,
}

/// DFS cycle detection. Returns the cycle path (in discovery order) if found.
fn find_cycle(graph: &TaskGraph) -> Option<Vec<TaskNode>> {
    let mut marks: HashMap<&TaskNode, Mark> = HashMap::new();
    let mut stack: Vec<TaskNode> = Vec::new();

    for start in &graph.nodes {
        if marks.contains_key(start) {
            continue;
        }
        if let Some(cycle) = visit(start, graph, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a TaskNode,
    graph: &'a TaskGraph,
    marks: &mut HashMap<&'a TaskNode, Mark>,
    stack: &mut Vec<TaskNode>,
) -> Option<Vec<TaskNode>> {
    if let Some(pos) = stack.iter().position(|n| n == node) {
        let mut cycle = stack[pos..].to_vec();
        cycle.push(node.clone());
        return Some(cycle);
    }
    if marks.get(node).copied() == Some(Mark::Done) {
        return None;
    }

    stack.push(node.clone());
    if let Some(deps) = graph.edges.get(node) {
        for dep in deps {
            if let Some(dep_node) = graph.nodes.iter().find(|n| *n == dep)
                && let Some(cycle) = visit(dep_node, graph, marks, stack)
            {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    marks.insert(node, Mark::Done);
    None
}

/// Deterministic readiness predicate: a lane is ready when every task
/// outside the lane that any of its tasks depends on has itself completed —
/// i.e. the dependency's own lane has advanced `currentTaskIndex` past it —
/// and the lane itself has not yet started. A dependency's lane need not be
/// fully `completed` itself: a qualified `laneId:taskName` edge is satisfied
/// the moment that task finishes, even while its lane keeps running (§3, §4.5).
///
/// Returns lane names in lexicographic order (fairness & determinism, §4.5).
pub fn ready_lanes(
    lanes: &[LaneConfig],
    states: &HashMap<String, LaneState>,
) -> Vec<String> {
    let graph = build_graph(lanes);
    let task_index: HashMap<(&str, &str), usize> = lanes
        .iter()
        .flat_map(|lane| {
            lane.tasks
                .iter()
                .enumerate()
                .map(move |(i, task)| ((lane.lane_name.as_str(), task.name.as_str()), i))
        })
        .collect();

    let mut ready: Vec<String> = Vec::new();
    for lane in lanes {
        let Some(state) = states.get(&lane.lane_name) else {
            continue;
        };
        if state.status != LaneStatus::Pending && state.status != LaneStatus::Waiting {
            continue;
        }
        let lane_satisfied = lane.tasks.iter().all(|task| {
            let node = TaskNode::new(lane.lane_name.clone(), task.name.clone());
            graph
                .edges
                .get(&node)
                .into_iter()
                .flatten()
                .filter(|dep| dep.lane != lane.lane_name)
                .all(|dep| task_completed(dep, states, &task_index))
        });
        if lane_satisfied {
            ready.push(lane.lane_name.clone());
        }
    }
    ready.sort();
    ready
}

/// Whether `dep`'s task has already run: its lane's `current_task_index` has
/// advanced strictly past that task's position. Unknown lanes or tasks are
/// treated as unsatisfied rather than panicking, since a Flow mid-validation
/// or a stale `LaneState` should withhold readiness, not crash the scheduler.
fn task_completed(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskConfig;

    fn lane(name: &str, tasks: Vec<TaskConfig>) -> LaneConfig {
        LaneConfig {
            lane_name: name.to_string(),
            branch_prefix: None,
            tasks,
        }
    }

    fn task(name: &str, depends_on: Vec<&str>) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            model: "gpt".to_string(),
            prompt: "do it".to_string(),
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
            timeout: None,
        }
    }

    #[test]
    fn validate_graph_accepts_valid_chain() {
        let lanes = vec![
            lane("base", vec![task("init", vec![])]),
            lane("dependent", vec![task("use", vec!["base:init"])]),
        ];
        assert!(validate_graph(&lanes).is_empty());
    }

    #[test]
    fn validate_graph_rejects_dangling_dependency() {
        let lanes = vec![lane("a", vec![task("t1", vec!["nope:ghost"])])];
        let errors = validate_graph(&lanes);
        assert!(matches!(errors[0], GraphError::DanglingDependency { .. }));
    }

    #[test]
    fn validate_graph_rejects_duplicate_task_name() {
        let lanes = vec![lane(
            "a",
            vec![task("t1", vec![]), task("t1", vec![])],
        )];
        let errors = validate_graph(&lanes);
        assert!(errors.iter().any(|e| matches!(e, GraphError::DuplicateTaskName { .. })));
    }

    #[test]
    fn validate_graph_rejects_direct_cycle() {
        let lanes = vec![
            lane("a", vec![task("t", vec!["b"])]),
            lane("b", vec![task("t", vec!["a"])]),
        ];
        let errors = validate_graph(&lanes);
        assert!(errors.iter().any(|e| matches!(e, GraphError::Cycle { .. })));
    }

    #[test]
    fn validate_graph_rejects_self_loop() {
        let lanes = vec![lane("a", vec![task("t", vec!["a:t"])])];
        let errors = validate_graph(&lanes);
        assert!(errors.iter().any(|e| matches!(e, GraphError::Cycle { .. })));
    }

    #[test]
    fn ready_lanes_orders_lexicographically() {
        let lanes = vec![
            lane("zeta", vec![task("t", vec![])]),
            lane("alpha", vec![task("t", vec![])]),
        ];
        let mut states = HashMap::new();
        states.insert(
            "zeta".to_string(),
            LaneState::new_pending("zeta", "zeta.json", 1, vec![]),
        );
        states.insert(
            "alpha".to_string(),
            LaneState::new_pending("alpha", "alpha.json", 1, vec![]),
        );
        assert_eq!(ready_lanes(&lanes, &states), vec!["alpha", "zeta"]);
    }

    #[test]
    fn ready_lanes_withholds_until_dependency_completed() {
        let lanes = vec![
            lane("base", vec![task("init", vec![])]),
            lane("dependent", vec![task("use", vec!["base:init"])]),
        ];
        let mut states = HashMap::new();
        states.insert(
            "base".to_string(),
            LaneState::new_pending("base", "base.json", 1, vec![]),
        );
        states.insert(
            "dependent".to_string(),
            LaneState::new_pending("dependent", "dependent.json", 1, vec![TaskNode::new("base", "init")]),
        );
        assert!(ready_lanes(&lanes, &states) == vec!["base"]);

        let base = states.get_mut("base").unwrap();
        base.status = LaneStatus::Completed;
        base.current_task_index = 1;
        assert_eq!(ready_lanes(&lanes, &states), vec!["dependent"]);
    }

    #[test]
    fn ready_lanes_unblocks_on_a_specific_task_without_waiting_for_the_whole_lane() {
        // "dependent" depends on "base:first" only; "base" has a second task
        // still to run, so its lane never reaches `Completed`, but the
        // specific dependency task is already done.
        let lanes = vec![
            lane("base", vec![task("first", vec![]), task("second", vec![])]),
            lane("dependent", vec![task("use", vec!["base:first"])]),
        ];
        let mut states = HashMap::new();
        let mut base = LaneState::new_pending("base", "base.json", 2, vec![]);
        base.status = LaneStatus::Running;
        base.current_task_index = 1;
        states.insert("base".to_string(), base);
        states.insert(
            "dependent".to_string(),
            LaneState::new_pending(
                "dependent",
                "dependent.json",
                1,
                vec![TaskNode::new("base", "first")],
            ),
        );
        assert_eq!(ready_lanes(&lanes, &states), vec!["dependent"]);
    }

    #[test]
    fn intra_lane_self_dependency_on_earlier_task_is_a_noop() {
        // Same-lane dependsOn on an earlier task is accepted (sequential order
        // already enforces it); only the reversed form is a cycle.
        let lanes = vec![lane(
            "a",
            vec![task("first", vec![]), task("second", vec!["a:first"])],
        )];
        assert!(validate_graph(&lanes).is_empty());
    }

    #[test]
    fn intra_lane_dependency_on_a_later_task_is_rejected_as_a_cycle() {
        // The reversed form: an earlier task depends on a later task in the
        // same lane. Combined with the lane's own sequential order this is
        // unsatisfiable, so it must surface as a cycle rather than pass
        // validation silently.
        let lanes = vec![lane(
            "a",
            vec![task("first", vec!["a:second"]), task("second", vec![])],
        )];
        let errors = validate_graph(&lanes);
        assert!(errors.iter().any(|e| matches!(e, GraphError::Cycle { .. })));
    }
}
