//! Test doubles and fixtures shared across unit and integration tests.
//! Gated behind the `test-support` feature so it never ships in release
//! builds but can still be depended on from `tests/`.

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use crate::core::types::{AgentOutcome, DependencyRequest};
use crate::io::agent_runner::{AgentRequest, AgentResult, AgentRunner};

/// Initialize a git repository at `path` with one commit on `main`, suitable
/// as the base a Lane Executor creates worktrees from.
pub fn init_bare_repo_with_commit(path: &Path) {
    std::fs::create_dir_all(path).expect("create repo dir");
    git(path, &["init", "-b", "main"]);
    git(path, &["config", "user.email", "test@example.com"]);
    git(path, &["config", "user.name", "Test"]);
    std::fs::write(path.join("README.md"), "seed\n").expect("write seed file");
    git(path, &["add", "-A"]);
    git(path, &["commit", "-m", "seed"]);
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// An `AgentRunner` that returns a scripted sequence of results instead of
/// spawning a real agent process, one per call to `run`.
pub struct ScriptedAgentRunner {
    results: Mutex<Vec<AgentResult>>,
}

impl ScriptedAgentRunner {
    pub fn sequence(mut results: Vec<AgentResult>) -> Self {
        results.reverse();
        Self {
            results: Mutex::new(results),
        }
    }

    pub fn completed() -> Self {
        Self::completed_n(1)
    }

    /// Scripts `n` identical completions, for a runner shared by `n` lanes
    /// that each invoke it exactly once.
    pub fn completed_n(n: usize) -> Self {
        Self::sequence(
            std::iter::repeat_with(|| AgentResult {
                exit_code: Some(0),
                duration: std::time::Duration::from_millis(1),
                outcome: AgentOutcome::Completed,
                dependency_request: None,
            })
            .take(n)
            .collect(),
        )
    }

    pub fn blocked(request: DependencyRequest) -> Self {
        Self::sequence(vec![AgentResult {
            exit_code: None,
            duration: std::time::Duration::from_millis(1),
            outcome: AgentOutcome::BlockedOnDependency,
            dependency_request: Some(request),
        }])
    }

    pub fn crashed() -> Self {
        Self::sequence(vec![AgentResult {
            exit_code: Some(1),
            duration: std::time::Duration::from_millis(1),
            outcome: AgentOutcome::Crashed,
            dependency_request: None,
        }])
    }

    pub fn timed_out() -> Self {
        Self::sequence(vec![AgentResult {
            exit_code: None,
            duration: std::time::Duration::from_millis(1),
            outcome: AgentOutcome::Timeout,
            dependency_request: None,
        }])
    }

    pub fn cancelled() -> Self {
        Self::sequence(vec![AgentResult {
            exit_code: None,
            duration: std::time::Duration::from_millis(1),
            outcome: AgentOutcome::Cancelled,
            dependency_request: None,
        }])
    }
}

impl AgentRunner for ScriptedAgentRunner {
    fn run(&self, _request: &AgentRequest, on_pid: &mut dyn FnMut(u32)) -> anyhow::Result<AgentResult> {
        on_pid(9999);
        let mut results = self.results.lock().expect("scripted runner lock");
        results
            .pop()
            .ok_or_else(|| anyhow::anyhow!("ScriptedAgentRunner: no more scripted results"))
    }
}
