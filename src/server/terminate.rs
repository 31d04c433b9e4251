//! Platform-specific process termination strategies.
//!
//! Graceful delivery uses SIGTERM where available; escalation enumerates
//! the process tree with `sysinfo` so helper processes forked by the server
//! (worker pools, reloaders) do not outlive it. Callers can skip the tree
//! walk with `tree_kill = false`, which must leave sibling processes alone.

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};

/// Ask the process to terminate gracefully.
///
/// Returns `false` when the platform has no graceful delivery mechanism and
/// the caller should escalate immediately.
pub(crate) fn send_graceful(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Safety: kill with a valid signal number is always safe to call.
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Forcefully kill every live descendant of `pid`, deepest first.
///
/// The root process itself is killed by the caller through its child
/// handle, so the reaped exit status stays observable.
pub(crate) fn kill_descendants(pid: u32) {
    let refresh = RefreshKind::new().with_processes(ProcessRefreshKind::new());
    let system = System::new_with_specifics(refresh);
    let root = Pid::from_u32(pid);

    let mut descendants = Vec::new();
    collect_descendants(&system, root, &mut descendants);

    for target in descendants.iter().rev() {
        if let Some(process) = system.process(*target) {
            tracing::debug!(pid = %target, "Killing backend descendant process");
            process.kill();
        }
    }
}

fn collect_descendants(system: &System, parent: Pid, acc: &mut Vec<Pid>) {
    for (pid, process) in system.processes() {
        if process.parent() == Some(parent) {
            acc.push(*pid);
            collect_descendants(system, *pid, acc);
        }
    }
}
