//! Lifecycle operations run from outside an instance: start, stop,
//! restart, cleanup, status.
//!
//! `start()` replaces classic double-fork daemonisation: it spawns the
//! instance's foreground entrypoint in its own process group and returns
//! once the child has published its port record. The caller is then free
//! to exit.
//!
//! Liveness files are guarded by existence checks only. Two concurrent
//! `start()` calls can both see "not running" and both spawn; the loser's
//! `Daemon::bind` usually sees the winner's pid record and exits, but the
//! window between probe and pid write is not closed.

use std::process::Child;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::instance::InstanceDir;
use super::process::{self, Entrypoint, Liveness};
use super::DaemonContext;
use crate::errors::DaemonError;


/// How `stop()` concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running. Not an error.
    NotRunning,
    /// The daemon exited and removed its own liveness files.
    Stopped { pid: u32 },
    /// Liveness files survived the grace period and were removed by force.
    ForcedCleanup { pid: Option<u32> },
}


/// Probe an instance's liveness.
pub fn status(instance: &InstanceDir) -> Liveness {
    process::probe(instance)
}


/// Remove liveness and output files unconditionally.
pub fn cleanup(instance: &InstanceDir) {
    instance.cleanup();
}


/// Start an instance in the background.
///
/// Fails with `AlreadyRunning` (leaving the live instance untouched) if a
/// live process owns the name. Stale files from a crashed instance are
/// cleared first. Returns the child handle so long-lived callers can reap it.
pub fn start(ctx: &DaemonContext, entry: &Entrypoint) -> Result<Child, DaemonError> {
    let instance = ctx.instance();
    let name = instance.name().to_string();

    match process::probe(instance) {
        Liveness::Running { pid } => return Err(DaemonError::AlreadyRunning { name, pid }),
        Liveness::Stale { pid } => {
            warn!(instance = %name, ?pid, "removing stale liveness files before start");
            instance.cleanup();
        }
        Liveness::NotRunning => {}
    }

    instance.ensure()?;
    let mut child = match process::spawn_detached(entry, instance) {
        Ok(child) => child,
        Err(source) => {
            instance.cleanup();
            return Err(DaemonError::SpawnFailed { name, source });
        }
    };

    let timeout_ms = ctx.settings().start_timeout_ms;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut interval = Duration::from_millis(25);

    loop {
        if instance.has_port_record() {
            info!(instance = %name, pid = child.id(), "started");
            return Ok(child);
        }

        if let Ok(Some(status)) = child.try_wait() {
            let mut stderr = instance.stderr_tail(2_000);
            if stderr.is_empty() {
                stderr = format!("exited with {}", status);
            }
            instance.cleanup();
            return Err(DaemonError::ChildExited { name, stderr });
        }

        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            instance.cleanup();
            return Err(DaemonError::StartTimeout { name, timeout_ms });
        }

        std::thread::sleep(interval);
        // Exponential backoff capped at 200ms
        interval = std::cmp::min(interval * 2, Duration::from_millis(200));
    }
}


/// Stop an instance with SIGTERM.
///
/// Not running is reported, not raised. If the process or its liveness
/// files outlive the grace period, the process is killed and the files
/// removed; that is logged as a cleanup failure.
pub fn stop(ctx: &DaemonContext) -> Result<StopOutcome, DaemonError> {
    let instance = ctx.instance();
    let grace = Duration::from_millis(ctx.settings().stop_grace_ms);

    let pid = match process::probe(instance) {
        Liveness::NotRunning => {
            info!(instance = instance.name(), "not running");
            return Ok(StopOutcome::NotRunning);
        }
        Liveness::Stale { pid } => {
            warn!(instance = instance.name(), ?pid, "cleanup failure: stale liveness files removed");
            instance.cleanup();
            return Ok(StopOutcome::ForcedCleanup { pid });
        }
        Liveness::Running { pid } => pid,
    };

    if !process::terminate(pid) {
        warn!(instance = instance.name(), pid, "could not signal process");
    }

    let exited = process::wait_for_exit(pid, grace);
    let deadline = Instant::now() + Duration::from_millis(250);
    while instance.has_liveness_files() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(25));
    }

    if exited && !instance.has_liveness_files() {
        info!(instance = instance.name(), pid, "stopped");
        return Ok(StopOutcome::Stopped { pid });
    }

    if !exited {
        warn!(instance = instance.name(), pid, "still alive after grace period, sending SIGKILL");
        process::force_kill(pid);
    }
    warn!(instance = instance.name(), pid, "cleanup failure: removing leftover liveness files");
    instance.cleanup();
    Ok(StopOutcome::ForcedCleanup { pid: Some(pid) })
}


/// `stop()` then `start()`. "Not running" from the stop half is fine.
pub fn restart(ctx: &DaemonContext, entry: &Entrypoint) -> Result<Child, DaemonError> {
    let outcome = stop(ctx)?;
    info!(instance = ctx.name(), ?outcome, "restarting");
    start(ctx, entry)
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
