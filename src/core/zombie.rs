//! Pure zombie classification (Invariant 2, §4.6).
//!
//! The OS probe ("does this pid exist") is I/O and lives in
//! [`crate::io::process_probe`]; this module only decides what a probe
//! result means for a lane's state.

use crate::core::types::{LaneState, LaneStatus};

/// Classification of a lane observed to have `status = running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneHealth {
    /// `pid` is alive; nothing to do.
    Alive,
    /// `status = running` but the OS reports no such process.
    Zombie,
    /// Not running; classification does not apply.
    NotApplicable,
}

/// Classify a lane given whether its recorded `pid` was found alive.
///
/// `pid_alive` is `None` when the lane has no `pid` recorded (not yet started
/// or already reaped); in that case a `running` status with no pid is itself
/// a zombie, since a running lane is required to have recorded its pid.
pub fn classify(state: &LaneState, pid_alive: Option<bool>) -> LaneHealth {
    if state.status != LaneStatus::Running {
        return LaneHealth::NotApplicable;
    }
    match pid_alive {
        Some(true) => LaneHealth::Alive,
        Some(false) | None => LaneHealth::Zombie,
    }
}
