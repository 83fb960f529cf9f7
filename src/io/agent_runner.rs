//! C3: spawn the external agent for one task, stream its stdout, detect
//! idle/timeout, parse structured events, and cooperate with the
//! intervention channel.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::{classify_idle, IdleState, IdleThresholds};
use crate::core::types::{AgentOutcome, DependencyRequest};
use crate::io::intervention::{read_and_consume_intervention, read_timeout_override};
use crate::io::process::strip_ansi;
use crate::io::process_probe::{SIGKILL, SIGTERM, send_signal};
use crate::io::state_store::{self, LogRecord};

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub model: String,
    pub timeout: Duration,
    pub task_id: String,
    /// Lane directory: holds `conversation.jsonl`, `terminal-raw.log`,
    /// `terminal.log`, `intervention.txt?`, `timeout.txt?`.
    pub lane_path: PathBuf,
    /// Idle-time thresholds, from `EngineConfig`.
    pub idle_thresholds: IdleThresholds,
    /// Heartbeat cadence, from `EngineConfig`.
    pub heartbeat_interval: Duration,
    /// Cap on bytes retained in the readable log per invocation, from
    /// `EngineConfig`; bytes beyond this are still drained from the pipe
    /// (to avoid deadlocking the child) but not written out.
    pub output_limit_bytes: usize,
}

impl Default for AgentRequest {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::new(),
            prompt: String::new(),
            model: String::new(),
            timeout: Duration::from_secs(600),
            task_id: String::new(),
            lane_path: PathBuf::new(),
            idle_thresholds: IdleThresholds::default(),
            heartbeat_interval: Duration::from_secs(30),
            output_limit_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub outcome: AgentOutcome,
    pub dependency_request: Option<DependencyRequest>,
}

/// Abstraction over agent execution backends, decoupling the Lane Executor
/// from the actual `cursor-agent` binary so tests can substitute a script.
pub trait AgentRunner {
    /// `on_pid` is invoked the moment the child is spawned, so the caller can
    /// persist the pid into `LaneState` before any output is read.
    fn run(&self, request: &AgentRequest, on_pid: &mut dyn FnMut(u32)) -> Result<AgentResult>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StructuredEvent {
    DependencyRequest {
        reason: String,
        #[serde(default)]
        changes: Vec<String>,
        #[serde(default)]
        commands: Vec<String>,
    },
    TaskComplete {
        success: bool,
        #[serde(default)]
        notes: Option<String>,
    },
}

/// Agent runner that spawns the configured external agent executable.
pub struct CursorAgentRunner {
    pub binary: String,
}

impl Default for CursorAgentRunner {
    fn default() -> Self {
        Self {
            binary: "cursor-agent".to_string(),
        }
    }
}

impl AgentRunner for CursorAgentRunner {
    #[instrument(skip_all, fields(task = %request.task_id, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &AgentRequest, on_pid: &mut dyn FnMut(u32)) -> Result<AgentResult> {
        let start = Instant::now();

        let mut prompt = request.prompt.clone();
        if let Some(intervention) = read_and_consume_intervention(&request.lane_path)? {
            info!("delivering queued intervention before spawning agent");
            append_record(&request.lane_path, "intervention", &intervention, Some(&request.task_id))?;
            prompt = format!("{intervention}\n\n{prompt}");
        }
        let timeout = read_timeout_override(&request.lane_path)?.unwrap_or(request.timeout);

        fs::create_dir_all(&request.working_dir)
            .with_context(|| format!("create working dir {}", request.working_dir.display()))?;

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CURSORFLOW_MODEL", &request.model);

        debug!("spawning agent process");
        let mut child = cmd.spawn().context("spawn agent process")?;
        let pid = child.id();
        on_pid(pid);

        {
            let mut stdin = child.stdin.take().context("agent stdin not piped")?;
            stdin.write_all(prompt.as_bytes()).context("write prompt to agent stdin")?;
        }

        let stdout = child.stdout.take().context("agent stdout not piped")?;
        let stderr = child.stderr.take().context("agent stderr not piped")?;

        let (tx, rx) = mpsc::channel::<Option<Vec<u8>>>();
        let stdout_thread = thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => {
                        let _ = tx.send(None);
                        break;
                    }
                    Ok(_) => {
                        if tx.send(Some(line)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let output_limit_bytes = request.output_limit_bytes;
        let stderr_thread = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

        let raw_log = request.lane_path.join("terminal-raw.log");
        let readable_log = request.lane_path.join("terminal.log");
        fs::create_dir_all(&request.lane_path)
            .with_context(|| format!("create lane dir {}", request.lane_path.display()))?;
        let mut raw_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&raw_log)
            .with_context(|| format!("open {}", raw_log.display()))?;
        let mut readable_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&readable_log)
            .with_context(|| format!("open {}", readable_log.display()))?;

        let mut last_byte = Instant::now();
        let mut last_heartbeat = Instant::now();
        let mut dependency_request = None;
        let mut task_complete_success: Option<bool> = None;
        let mut killed_for_timeout = false;
        let mut stdout_done = false;
        let mut logged_bytes: usize = 0;
        let mut output_truncated: usize = 0;

        loop {
            if let Ok(status) = child.try_wait()
                && status.is_some()
            {
                break;
            }

            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Some(line)) => {
                    last_byte = Instant::now();
                    let remaining = request.output_limit_bytes.saturating_sub(logged_bytes);
                    let keep = line.len().min(remaining);
                    output_truncated += line.len() - keep;
                    if keep > 0 {
                        logged_bytes += keep;
                        raw_file.write_all(&line[..keep]).ok();
                        let text = String::from_utf8_lossy(&line[..keep]);
                        let readable = strip_ansi(text.trim_end());
                        writeln!(readable_file, "{readable}").ok();

                        if let Ok(event) = serde_json::from_str::<StructuredEvent>(readable.trim()) {
                            match event {
                                StructuredEvent::DependencyRequest { reason, changes, commands } => {
                                    let req = DependencyRequest { reason, changes, commands };
                                    append_record(
                                        &request.lane_path,
                                        "dependency_request",
                                        &req.reason,
                                        Some(&request.task_id),
                                    )?;
                                    dependency_request = Some(req);
                                }
                                StructuredEvent::TaskComplete { success, notes } => {
                                    task_complete_success = Some(success);
                                    append_record(
                                        &request.lane_path,
                                        "task_complete",
                                        notes.as_deref().unwrap_or(""),
                                        Some(&request.task_id),
                                    )?;
                                }
                            }
                        } else if !readable.trim().is_empty() {
                            append_record(&request.lane_path, "progress", &readable, Some(&request.task_id))?;
                        }
                    }
                }
                Ok(None) => {
                    stdout_done = true;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    stdout_done = true;
                }
            }

            if last_heartbeat.elapsed() >= request.heartbeat_interval {
                append_record(&request.lane_path, "heartbeat", "alive", None)?;
                last_heartbeat = Instant::now();
            }

            if classify_idle(last_byte.elapsed(), request.idle_thresholds) == IdleState::Kill
                || start.elapsed() >= timeout
            {
                warn!(pid, "agent exceeded idle or wall-clock timeout, terminating");
                killed_for_timeout = true;
                send_signal(pid, SIGTERM);
                if child.wait_timeout(Duration::from_secs(5)).context("wait for agent after SIGTERM")?.is_none() {
                    send_signal(pid, SIGKILL);
                }
                break;
            }

            if stdout_done && child.try_wait().ok().flatten().is_some() {
                break;
            }
        }

        let status = child.wait().context("wait for agent process")?;
        let _ = stdout_thread.join();
        let (stderr_bytes, stderr_truncated) = stderr_thread
            .join()
            .unwrap_or_else(|_| Err(anyhow::anyhow!("stderr reader thread panicked")))?;
        output_truncated += stderr_truncated;
        if !stderr_bytes.is_empty() {
            raw_file.write_all(&stderr_bytes).ok();
        }
        if output_truncated > 0 {
            warn!(pid, output_truncated, "agent output truncated to output_limit_bytes");
            append_record(
                &request.lane_path,
                "output_truncated",
                &format!("{output_truncated} bytes dropped"),
                Some(&request.task_id),
            )?;
        }

        let duration = start.elapsed();
        let outcome = if killed_for_timeout {
            AgentOutcome::Timeout
        } else if dependency_request.is_some() {
            AgentOutcome::BlockedOnDependency
        } else if status.success() || task_complete_success == Some(true) {
            AgentOutcome::Completed
        } else if terminated_by_signal(&status) {
            // Killed by something other than our own idle/timeout escalation
            // above — an external SIGTERM/SIGKILL, i.e. a user cancellation
            // (§5 Cancellation) rather than a crash.
            AgentOutcome::Cancelled
        } else if task_complete_success == Some(false) {
            AgentOutcome::Crashed
        } else {
            AgentOutcome::Crashed
        };

        Ok(AgentResult {
            exit_code: status.code(),
            duration,
            outcome,
            dependency_request,
        })
    }
}

/// Whether a child exited because it was killed by a signal, as opposed to
/// returning a normal (possibly non-zero) exit code.
#[cfg(unix)]
fn terminated_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn terminated_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}

/// Drain a stream to completion while keeping only the first `limit` bytes,
/// so a chatty stderr never grows unbounded memory while still letting the
/// pipe empty out (an un-drained pipe would deadlock the child).
fn read_stream_limited<R: std::io::Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read stderr")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }
    Ok((buf, truncated))
}

fn append_record(lane_path: &std::path::Path, kind: &str, content: &str, task_id: Option<&str>) -> Result<()> {
    state_store::append_log(
        lane_path,
        &LogRecord {
            timestamp: now_rfc3339_ish(),
            kind: kind.to_string(),
            content: content.to_string(),
            task_id: task_id.map(str::to_string),
        },
    )
}

/// A coarse, dependency-free timestamp. Real wall-clock timestamps are
/// supplied by the caller layer in production; kept local and simple here so
/// core I/O helpers stay free of a chrono dependency the rest of the stack
/// does not otherwise need.
fn now_rfc3339_ish() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("unix:{secs}")
}
