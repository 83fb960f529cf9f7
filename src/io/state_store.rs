//! C1: atomic persistence for `LaneState` and the append-only conversation log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{LaneState, RunMeta};

/// One line of the append-only conversation/event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Load a lane's `state.json`. Tolerates a missing-target race with an
/// in-flight rename by retrying once before surfacing an error.
pub fn load(lane_path: &Path) -> Result<Option<LaneState>> {
    let path = lane_path.join("state.json");
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let state = serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?;
            Ok(Some(state))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Retry once: a concurrent writer may be mid-rename.
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    let state = serde_json::from_str(&contents)
                        .with_context(|| format!("parse {}", path.display()))?;
                    Ok(Some(state))
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
            }
        }
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Persist a lane's `state.json` via atomic write-then-rename.
pub fn save(lane_path: &Path, state: &LaneState) -> Result<()> {
    fs::create_dir_all(lane_path)
        .with_context(|| format!("create lane dir {}", lane_path.display()))?;
    let path = lane_path.join("state.json");
    let mut buf = serde_json::to_string_pretty(state).context("serialize lane state")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Append one record to `conversation.jsonl`, flushing immediately so a
/// crash never loses an already-returned write.
pub fn append_log(lane_path: &Path, record: &LogRecord) -> Result<()> {
    fs::create_dir_all(lane_path)
        .with_context(|| format!("create lane dir {}", lane_path.display()))?;
    let path = lane_path.join("conversation.jsonl");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut line = serde_json::to_string(record).context("serialize log record")?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.flush().with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}

/// Persist a Run's metadata (`run.meta.json`), written once when the run
/// starts so `resume` can find the Flow it came from.
pub fn save_run_meta(run_path: &Path, meta: &RunMeta) -> Result<()> {
    fs::create_dir_all(run_path).with_context(|| format!("create run dir {}", run_path.display()))?;
    let path = run_path.join("run.meta.json");
    let mut buf = serde_json::to_string_pretty(meta).context("serialize run meta")?;
    buf.push('\n');
    write_atomic(&path, &buf)
}

/// Load a Run's metadata, if present.
pub fn load_run_meta(run_path: &Path) -> Result<Option<RunMeta>> {
    let path = run_path.join("run.meta.json");
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?,
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// List every lane's persisted state under a Run's `lanes/` directory.
pub fn list_lanes(run_path: &Path) -> Result<Vec<LaneState>> {
    let lanes_dir = run_path.join("lanes");
    if !lanes_dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(&lanes_dir)
        .with_context(|| format!("read {}", lanes_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();
    for entry in entries {
        match load(&entry)? {
            Some(state) => out.push(state),
            None => {
                return Err(anyhow!(
                    "lane directory {} has no parseable state.json",
                    entry.display()
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lane_path = temp.path().join("lanes").join("l1");
        let state = LaneState::new_pending("l1", "/flow/l1.json", 3, vec![]);

        save(&lane_path, &state).expect("save");
        let loaded = load(&lane_path).expect("load").expect("some");
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_missing_returns_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lane_path = temp.path().join("lanes").join("missing");
        assert!(load(&lane_path).expect("load").is_none());
    }

    #[test]
    fn append_log_writes_one_json_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lane_path = temp.path().join("lanes").join("l1");

        append_log(
            &lane_path,
            &LogRecord {
                timestamp: "t1".to_string(),
                kind: "progress".to_string(),
                content: "hello".to_string(),
                task_id: Some("build".to_string()),
            },
        )
        .expect("append 1");
        append_log(
            &lane_path,
            &LogRecord {
                timestamp: "t2".to_string(),
                kind: "progress".to_string(),
                content: "world".to_string(),
                task_id: None,
            },
        )
        .expect("append 2");

        let contents = fs::read_to_string(lane_path.join("conversation.jsonl")).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: LogRecord = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first.content, "hello");
    }

    #[test]
    fn run_meta_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_path = temp.path().join("run-1");
        let meta = RunMeta {
            id: "run-1".to_string(),
            start_time: "unix:1".to_string(),
            path: run_path.to_string_lossy().to_string(),
            flow_ref: "/repo/_cursorflow/flows/demo".to_string(),
        };
        save_run_meta(&run_path, &meta).expect("save meta");
        let loaded = load_run_meta(&run_path).expect("load meta").expect("some");
        assert_eq!(loaded, meta);
    }

    #[test]
    fn list_lanes_sorted_by_directory_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_path = temp.path();
        save(
            &run_path.join("lanes").join("b"),
            &LaneState::new_pending("b", "b.json", 1, vec![]),
        )
        .expect("save b");
        save(
            &run_path.join("lanes").join("a"),
            &LaneState::new_pending("a", "a.json", 1, vec![]),
        )
        .expect("save a");

        let lanes = list_lanes(run_path).expect("list");
        let names: Vec<&str> = lanes.iter().map(|l| l.lane_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
