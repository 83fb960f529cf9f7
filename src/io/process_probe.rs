//! OS-level liveness probe used to classify zombie lanes (§4.6, Invariant 2).

/// Probe whether a process is alive via "signal 0" (no signal delivered,
/// only existence/permission checked).
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: kill(pid, 0) sends no signal; it only queries whether the
    // process exists and is visible to us. `pid` is a plain integer with no
    // aliasing concerns.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    // Non-Unix targets are out of scope; assume alive rather than
    // misclassify a healthy lane as a zombie.
    true
}

/// Send a signal to a process, ignoring "no such process" (already exited).
#[cfg(unix)]
pub fn send_signal(pid: u32, sig: i32) {
    // SAFETY: pid/sig are plain integers; kill() is a well-defined libc call.
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _sig: i32) {}

#[cfg(unix)]
pub const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
pub const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub const SIGTERM: i32 = 15;
#[cfg(not(unix))]
pub const SIGKILL: i32 = 9;
