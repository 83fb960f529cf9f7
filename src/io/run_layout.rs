//! Canonical path layout under `<repo>/_cursorflow/...` (§6).

use std::path::{Path, PathBuf};

/// Paths rooted at a repository's `_cursorflow/` directory.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            root: repo_root.into().join("_cursorflow"),
        }
    }

    pub fn flows_dir(&self) -> PathBuf {
        self.root.join("flows")
    }

    pub fn flow_dir(&self, flow_dir_name: &str) -> PathBuf {
        self.flows_dir().join(flow_dir_name)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("logs").join("runs")
    }

    pub fn run(&self, run_id: &str) -> RunLayout {
        RunLayout {
            root: self.runs_dir().join(run_id),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

/// Paths for a single Run directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("run.meta.json")
    }

    pub fn lanes_dir(&self) -> PathBuf {
        self.root.join("lanes")
    }

    pub fn lane(&self, lane_name: &str) -> PathBuf {
        self.lanes_dir().join(lane_name)
    }
}

/// Run ID format: `run-<unix-millis>` (monotonic on a single host).
pub fn generate_run_id(now_unix_millis: u128) -> String {
    format!("run-{now_unix_millis}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_stable() {
        let layout = RepoLayout::new("/repo");
        assert_eq!(layout.flows_dir(), PathBuf::from("/repo/_cursorflow/flows"));
        assert_eq!(
            layout.runs_dir(),
            PathBuf::from("/repo/_cursorflow/logs/runs")
        );
        let run = layout.run("run-123");
        assert_eq!(run.lane("alpha"), PathBuf::from("/repo/_cursorflow/logs/runs/run-123/lanes/alpha"));
    }

    #[test]
    fn run_id_format_matches_contract() {
        assert_eq!(generate_run_id(1_700_000_000_000), "run-1700000000000");
    }
}
