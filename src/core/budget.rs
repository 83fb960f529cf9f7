//! Pure timeout/idle bookkeeping helpers.

use std::time::Duration;

/// Default wall-clock timeout for a task with no explicit `timeout` (§3: "≥ 10 min").
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

/// Idle thresholds from §5: warn at 60s, escalate at 120s, kill at 600s.
pub const IDLE_WARN: Duration = Duration::from_secs(60);
pub const IDLE_ESCALATE: Duration = Duration::from_secs(120);
pub const IDLE_KILL: Duration = Duration::from_secs(600);

/// Heartbeat cadence while an agent is streaming output.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Classification of elapsed idle time against the thresholds above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Fresh,
    Warn,
    Escalate,
    Kill,
}

/// Idle thresholds an agent invocation is classified against. Constructed
/// from `EngineConfig` at the call site rather than read from the module
/// constants above, so a repo's `config.toml` can override §5's defaults.
#[derive(Debug, Clone, Copy)]
pub struct IdleThresholds {
    pub warn: Duration,
    pub escalate: Duration,
    pub kill: Duration,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        Self {
            warn: IDLE_WARN,
            escalate: IDLE_ESCALATE,
            kill: IDLE_KILL,
        }
    }
}

pub fn classify_idle(since_last_byte: Duration, thresholds: IdleThresholds) -> IdleState {
    if since_last_byte >= thresholds.kill {
        IdleState::Kill
    } else if since_last_byte >= thresholds.escalate {
        IdleState::Escalate
    } else if since_last_byte >= thresholds.warn {
        IdleState::Warn
    } else {
        IdleState::Fresh
    }
}

/// Resolve a task's effective timeout: its own value or the configured default.
pub fn effective_timeout(task_timeout_ms: Option<u64>, default: Duration) -> Duration {
    task_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_idle_thresholds() {
        let t = IdleThresholds::default();
        assert_eq!(classify_idle(Duration::from_secs(10), t), IdleState::Fresh);
        assert_eq!(classify_idle(Duration::from_secs(61), t), IdleState::Warn);
        assert_eq!(classify_idle(Duration::from_secs(121), t), IdleState::Escalate);
        assert_eq!(classify_idle(Duration::from_secs(601), t), IdleState::Kill);
    }

    #[test]
    fn classify_idle_respects_custom_thresholds() {
        let t = IdleThresholds {
            warn: Duration::from_secs(5),
            escalate: Duration::from_secs(10),
            kill: Duration::from_secs(20),
        };
        assert_eq!(classify_idle(Duration::from_secs(4), t), IdleState::Fresh);
        assert_eq!(classify_idle(Duration::from_secs(15), t), IdleState::Escalate);
        assert_eq!(classify_idle(Duration::from_secs(20), t), IdleState::Kill);
    }

    #[test]
    fn effective_timeout_falls_back_to_default() {
        assert_eq!(effective_timeout(None, DEFAULT_TASK_TIMEOUT), DEFAULT_TASK_TIMEOUT);
        assert_eq!(
            effective_timeout(Some(5_000), DEFAULT_TASK_TIMEOUT),
            Duration::from_secs(5)
        );
    }
}
