//! Shared deterministic types for the engine's pure core logic.
//!
//! These types define the stable data model (Flow/Lane/Task/Run/LaneState).
//! Nothing in this module touches the filesystem or spawns processes, so it
//! stays fully unit-testable in isolation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Flow metadata, immutable after creation except `status`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowMeta {
    pub id: String,
    pub name: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "baseBranch")]
    pub base_branch: String,
    pub status: FlowStatus,
    pub lanes: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Draft,
    Active,
    Archived,
}

/// A declarative lane: an ordered sequence of tasks sharing one worktree/branch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneConfig {
    #[serde(rename = "laneName")]
    pub lane_name: String,
    #[serde(rename = "branchPrefix", default)]
    pub branch_prefix: Option<String>,
    pub tasks: Vec<TaskConfig>,
}

/// A single agent invocation within a lane.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    pub model: String,
    pub prompt: String,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: Vec<String>,
    /// Milliseconds. Absent means the engine applies its configured default.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// One orchestration invocation over a Flow.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunMeta {
    pub id: String,
    #[serde(rename = "startTime")]
    pub start_time: String,
    pub path: String,
    #[serde(rename = "flowRef")]
    pub flow_ref: String,
}

/// Lifecycle states of a lane, per the data model's state machine.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LaneStatus {
    Pending,
    Waiting,
    Running,
    Reviewing,
    Paused,
    Completed,
    Failed,
}

/// A structured dependency request raised by an agent mid-task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyRequest {
    pub reason: String,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// The durable per-lane record the engine advances.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneState {
    pub lane_name: String,
    pub tasks_file: String,
    pub worktree_dir: Option<String>,
    pub pipeline_branch: Option<String>,
    pub current_task_index: u32,
    pub total_tasks: u32,
    pub status: LaneStatus,
    pub pid: Option<u32>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub depends_on: Vec<TaskNode>,
    pub error: Option<String>,
    pub dependency_request: Option<DependencyRequest>,
}

impl LaneState {
    pub fn new_pending(lane_name: &str, tasks_file: &str, total_tasks: u32, depends_on: Vec<TaskNode>) -> Self {
        Self {
            lane_name: lane_name.to_string(),
            tasks_file: tasks_file.to_string(),
            worktree_dir: None,
            pipeline_branch: None,
            current_task_index: 0,
            total_tasks,
            status: LaneStatus::Pending,
            pid: None,
            start_time: None,
            end_time: None,
            depends_on,
            error: None,
            dependency_request: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            LaneStatus::Completed | LaneStatus::Failed | LaneStatus::Paused
        )
    }
}

/// Outcome reported by the Agent Runner for one task invocation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AgentOutcome {
    Completed,
    BlockedOnDependency,
    Timeout,
    Crashed,
    Cancelled,
}

/// A parsed, fully resolved task-level dependency node, used by the scheduler
/// and persisted on `LaneState` so readiness/resume checks never have to
/// re-derive it from the Flow's raw `dependsOn` strings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskNode {
    pub lane: String,
    pub task: String,
}

impl TaskNode {
    pub fn new(lane: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            lane: lane.into(),
            task: task.into(),
        }
    }
}

/// A resolved dependency graph: task node -> its direct predecessors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
    pub edges: BTreeMap<TaskNode, Vec<TaskNode>>,
}
