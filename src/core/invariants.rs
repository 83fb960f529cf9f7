//! Semantic invariants over `LaneState` not expressible via JSON Schema.

use crate::core::types::{LaneState, LaneStatus};

/// Check Invariant 1: `currentTaskIndex <= totalTasks`; `completed <=>
/// currentTaskIndex == totalTasks && endTime set`.
pub fn validate_lane_state(state: &LaneState) -> Vec<String> {
    let mut errors = Vec::new();
    let label = &state.lane_name;

    if state.current_task_index > state.total_tasks {
        errors.push(format!(
            "{label}: current_task_index {} exceeds total_tasks {}",
            state.current_task_index, state.total_tasks
        ));
    }

    let at_end = state.current_task_index == state.total_tasks;
    let has_end_time = state.end_time.is_some();
    if state.status == LaneStatus::Completed && !(at_end && has_end_time) {
        errors.push(format!(
            "{label}: status=completed requires current_task_index == total_tasks and end_time set"
        ));
    }
    if at_end && has_end_time && state.status != LaneStatus::Completed {
        errors.push(format!(
            "{label}: current_task_index == total_tasks and end_time set but status is not completed"
        ));
    }

    errors
}

/// Invariant 3 (partial, statically checkable part): a `worktreeDir` must not
/// be absent while the lane is running.
pub fn validate_worktree_presence(state: &LaneState) -> Vec<String> {
    let mut errors = Vec::new();
    if state.status == LaneStatus::Running && state.worktree_dir.is_none() {
        errors.push(format!(
            "{}: status=running requires a worktree_dir",
            state.lane_name
        ));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LaneState {
        LaneState::new_pending("l1", "l1.json", 2, vec![])
    }

    #[test]
    fn rejects_index_past_total() {
        let mut s = base();
        s.current_task_index = 3;
        let errors = validate_lane_state(&s);
        assert!(errors.iter().any(|e| e.contains("exceeds total_tasks")));
    }

    #[test]
    fn completed_requires_index_and_end_time() {
        let mut s = base();
        s.status = LaneStatus::Completed;
        s.current_task_index = 2;
        let errors = validate_lane_state(&s);
        assert!(errors.iter().any(|e| e.contains("end_time set")));

        s.end_time = Some("2026-01-01T00:00:00Z".to_string());
        assert!(validate_lane_state(&s).is_empty());
    }

    #[test]
    fn running_requires_worktree_dir() {
        let mut s = base();
        s.status = LaneStatus::Running;
        let errors = validate_worktree_presence(&s);
        assert!(!errors.is_empty());

        s.worktree_dir = Some("/tmp/wt".to_string());
        assert!(validate_worktree_presence(&s).is_empty());
    }
}
