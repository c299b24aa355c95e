//! Worker agent ("kid"): supervises one experiment's child process.
//!
//! The agent reads its launch payload from the instance's stdin record,
//! starts the child with stdout and stderr going to `child.out` and
//! `child.err`, and reports to the orchestrator's `update` query:
//!
//! - `STARTED` once the child has a pid
//! - `RUNNING` with `log_output` whenever a log file grew
//! - `FINISHED` with the exit code (and any last output) when it exits
//! - `FAILED` with an error if the child could not be started
//!
//! The agent quits after `FINISHED`. Its only query besides the built-ins
//! is `kill`, which terminates the child; the exit is then reported
//! through the normal poll. Log text that could not be delivered is held
//! and sent with the next report.
//!
//! If the loop ends any other way (`stop`, a signal, the port record
//! vanishing) the child's process group is terminated before the agent
//! exits.

pub mod logfile;

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::daemon::{process, Daemon, DaemonContext, ExitReason, InstanceDir, Tick};
use crate::errors::{DaemonError, RpcError};
use crate::rpc::message::RpcMessage;
use crate::rpc::{QueryInterface, QueryTable};

use self::logfile::LogCursor;


pub const UPDATE_QUERY: &str = "update";
pub const CHILD_STDOUT: &str = "child.out";
pub const CHILD_STDERR: &str = "child.err";

/// Polls a finished agent keeps trying to deliver its final report.
const FINAL_REPORT_ATTEMPTS: u32 = 5;


// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Where the orchestrator listens for updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Callback {
    #[serde(default = "loopback")]
    pub host: String,
    pub port: u16,
}


fn loopback() -> String {
    "127.0.0.1".to_string()
}


/// Launch payload written to the agent's stdin record by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KidLaunch {
    pub experiment: String,
    pub command: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    pub callback: Callback,
    /// Program and arguments the command is wrapped in, e.g. `srun -N1`.
    #[serde(default)]
    pub wrapper: Vec<String>,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KidState {
    Started,
    Running,
    Finished,
    Failed,
}


/// One report from an agent to the orchestrator, sent as the kwargs of an
/// `update` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KidUpdate {
    pub experiment: String,
    pub state: KidState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Log path -> text appended since the previous report.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_output: BTreeMap<String, String>,
}


impl KidUpdate {
    pub fn new(experiment: &str, state: KidState) -> KidUpdate {
        KidUpdate {
            experiment: experiment.to_string(),
            state,
            pid: None,
            exit_code: None,
            error: None,
            log_output: BTreeMap::new(),
        }
    }

    pub fn to_message(&self) -> RpcMessage {
        let mut msg = RpcMessage::new(UPDATE_QUERY);
        if let Ok(Value::Object(map)) = serde_json::to_value(self) {
            msg.kwargs = map;
        }
        msg
    }

    pub fn from_message(msg: &RpcMessage) -> Result<KidUpdate, String> {
        serde_json::from_value(Value::Object(msg.kwargs.clone()))
            .map_err(|e| format!("bad update: {}", e))
    }
}


/// Where an agent's reports go.
pub trait UpdateSink {
    fn send(&mut self, update: &KidUpdate) -> Result<(), RpcError>;
}


impl UpdateSink for QueryInterface {
    fn send(&mut self, update: &KidUpdate) -> Result<(), RpcError> {
        self.call_ok(&update.to_message()).map(|_| ())
    }
}


// ---------------------------------------------------------------------------
// Kid
// ---------------------------------------------------------------------------

pub struct Kid<U> {
    launch: KidLaunch,
    log_dir: PathBuf,
    child: Option<Child>,
    cursors: Vec<LogCursor>,
    sink: U,
    /// Log text read from the cursors but not yet accepted by the sink.
    pending: BTreeMap<String, String>,
    final_report: Option<KidUpdate>,
    final_attempts: u32,
}


impl<U: UpdateSink> Kid<U> {
    /// An agent for `launch` whose child logs go to `log_dir`. Nothing is
    /// started until `start()`.
    pub fn new(launch: KidLaunch, log_dir: &Path, sink: U) -> Kid<U> {
        Kid {
            cursors: vec![
                LogCursor::new(&log_dir.join(CHILD_STDOUT)),
                LogCursor::new(&log_dir.join(CHILD_STDERR)),
            ],
            launch,
            log_dir: log_dir.to_path_buf(),
            child: None,
            sink,
            pending: BTreeMap::new(),
            final_report: None,
            final_attempts: 0,
        }
    }

    /// Start the child and report `STARTED`. If the child cannot be
    /// started, `FAILED` is reported and the error returned.
    pub fn start(&mut self) -> Result<u32, DaemonError> {
        let child = match spawn_child(&self.launch, &self.log_dir) {
            Ok(child) => child,
            Err(source) => {
                error!(experiment = %self.launch.experiment, error = %source, "cannot start child");
                let mut failed = KidUpdate::new(&self.launch.experiment, KidState::Failed);
                failed.error = Some(format!("cannot start '{}': {}", self.launch.command, source));
                if let Err(e) = self.sink.send(&failed) {
                    warn!(experiment = %self.launch.experiment, error = %e, "cannot report launch failure");
                }
                return Err(DaemonError::SpawnFailed {
                    name: self.launch.experiment.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        self.child = Some(child);
        info!(experiment = %self.launch.experiment, pid, "child started");
        let mut started = KidUpdate::new(&self.launch.experiment, KidState::Started);
        started.pid = Some(pid);
        if let Err(e) = self.sink.send(&started) {
            warn!(experiment = %self.launch.experiment, error = %e, "cannot report start");
        }
        Ok(pid)
    }

    pub fn experiment(&self) -> &str {
        &self.launch.experiment
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn sink(&self) -> &U {
        &self.sink
    }

    /// One polling step: forward new log text, and once the child has
    /// exited, deliver `FINISHED` and ask the loop to quit.
    pub fn poll(&mut self) -> Tick {
        if self.final_report.is_some() {
            return self.deliver_final();
        }

        let child = match self.child.as_mut() {
            Some(child) => child,
            None => return Tick::Quit,
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut report = KidUpdate::new(&self.launch.experiment, KidState::Finished);
                report.exit_code = Some(exit_code(status));
                report.log_output = self.take_output(true);
                info!(experiment = %self.launch.experiment, exit_code = ?report.exit_code, "child finished");
                self.final_report = Some(report);
                self.deliver_final()
            }
            Ok(None) => {
                let log_output = self.take_output(false);
                if !log_output.is_empty() {
                    let mut report = KidUpdate::new(&self.launch.experiment, KidState::Running);
                    report.log_output = log_output;
                    if let Err(e) = self.sink.send(&report) {
                        warn!(experiment = %self.launch.experiment, error = %e, "log output not delivered, holding it for the next report");
                        self.pending = report.log_output;
                    }
                }
                Tick::Continue
            }
            Err(e) => {
                warn!(experiment = %self.launch.experiment, error = %e, "cannot poll child");
                Tick::Continue
            }
        }
    }

    /// SIGTERM the child's process group. Its exit is reported by `poll`.
    pub fn kill(&mut self) -> bool {
        let pid = match self.child_pid() {
            Some(pid) => pid,
            None => return false,
        };
        info!(experiment = %self.launch.experiment, pid, "terminating child");
        process::terminate_group(pid) || process::terminate(pid)
    }

    /// Stop supervising. A child that is still running has its process
    /// group terminated, then killed if it outlives `grace`. The exit is
    /// reported with one `FINISHED` attempt.
    pub fn shutdown(&mut self, grace: Duration) {
        if let Some(report) = self.final_report.take() {
            if let Err(e) = self.sink.send(&report) {
                warn!(experiment = %self.launch.experiment, error = %e, "final report not delivered");
            }
            return;
        }
        let mut child = match self.child.take() {
            Some(child) => child,
            None => return,
        };

        let pid = child.id();
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                info!(experiment = %self.launch.experiment, pid, "agent stopping, terminating child");
                if !process::terminate_group(pid) {
                    process::terminate(pid);
                }
                match wait_child(&mut child, grace) {
                    Some(status) => Some(status),
                    None => {
                        warn!(experiment = %self.launch.experiment, pid, "child outlived grace period, sending SIGKILL");
                        process::kill_group(pid);
                        let _ = child.kill();
                        child.wait().ok()
                    }
                }
            }
        };

        let mut report = KidUpdate::new(&self.launch.experiment, KidState::Finished);
        report.exit_code = status.map(exit_code);
        report.log_output = self.take_output(true);
        if let Err(e) = self.sink.send(&report) {
            warn!(experiment = %self.launch.experiment, error = %e, "final report not delivered");
        }
    }

    /// Held text followed by whatever the cursors have gained since.
    fn take_output(&mut self, include_partial: bool) -> BTreeMap<String, String> {
        let mut out = std::mem::take(&mut self.pending);
        for (path, text) in self.collect(include_partial) {
            out.entry(path).or_default().push_str(&text);
        }
        out
    }

    fn collect(&mut self, include_partial: bool) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for cursor in &mut self.cursors {
            let read = if include_partial { cursor.drain() } else { cursor.read_new() };
            match read {
                Ok(Some(text)) => {
                    out.insert(cursor.path().display().to_string(), text);
                }
                Ok(None) => {}
                Err(e) => debug!(path = %cursor.path().display(), error = %e, "log read failed"),
            }
        }
        out
    }

    fn deliver_final(&mut self) -> Tick {
        let report = match &self.final_report {
            Some(r) => r,
            None => return Tick::Continue,
        };
        self.final_attempts += 1;
        match self.sink.send(report) {
            Ok(()) => Tick::Quit,
            Err(e) if self.final_attempts < FINAL_REPORT_ATTEMPTS => {
                warn!(experiment = %self.launch.experiment, attempt = self.final_attempts, error = %e, "final report not delivered, will retry");
                Tick::Continue
            }
            Err(e) => {
                error!(experiment = %self.launch.experiment, error = %e, "giving up on final report");
                Tick::Quit
            }
        }
    }
}


fn spawn_child(launch: &KidLaunch, log_dir: &Path) -> std::io::Result<Child> {
    use std::os::unix::process::CommandExt;

    std::fs::create_dir_all(log_dir)?;
    let stdout = File::create(log_dir.join(CHILD_STDOUT))?;
    let stderr = File::create(log_dir.join(CHILD_STDERR))?;

    let mut cmd = match launch.wrapper.split_first() {
        Some((program, args)) => {
            let mut cmd = Command::new(program);
            cmd.args(args).arg("sh").arg("-c").arg(&launch.command);
            cmd
        }
        None => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&launch.command);
            cmd
        }
    };
    if let Some(dir) = &launch.workdir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()
}


fn wait_child(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(25)),
            _ => return None,
        }
    }
}


/// Exit code, or 128 + signal number for a signalled child.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}


// ---------------------------------------------------------------------------
// Daemon wiring
// ---------------------------------------------------------------------------

/// Foreground entry point of a worker agent instance.
///
/// The listener is bound (and the port record published) before the child
/// starts, so the orchestrator's `start()` returns and is accepting again by
/// the time `STARTED` arrives.
pub fn run_kid(ctx: DaemonContext) -> Result<ExitReason, DaemonError> {
    let instance: InstanceDir = ctx.instance().clone();
    let raw = instance.read_stdin()?;
    let launch: KidLaunch = serde_json::from_str(&raw).map_err(|e| DaemonError::Io {
        path: instance.stdin_path(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })?;

    let settings = ctx.settings().clone();
    let sink = QueryInterface::remote(&launch.callback.host, launch.callback.port, &settings);
    let kid = Kid::new(launch, &instance.dir(), sink);

    let mut daemon = bind_kid(ctx, kid)?;
    if let Err(e) = daemon.state_mut().start() {
        instance.cleanup();
        return Err(e);
    }
    Ok(supervise(&mut daemon))
}


/// Bind an agent's daemon: the `kill` query plus polling on every idle tick.
pub fn bind_kid<U>(ctx: DaemonContext, kid: Kid<U>) -> Result<Daemon<Kid<U>>, DaemonError>
where
    U: UpdateSink + 'static,
{
    let mut queries: QueryTable<Kid<U>> = QueryTable::new();
    queries.register("kill", |kid, _session, _msg, reply| {
        if kid.kill() {
            reply.succeed(format!("terminating {}", kid.experiment()));
            Ok(())
        } else {
            Err(format!("cannot signal child of {}", kid.experiment()))
        }
    });

    let poll = ctx.settings().kid_poll();
    Daemon::bind(ctx.with_poll(poll), kid, queries, |kid, _ctx| kid.poll())
}


/// Run an agent's loop. Unless the loop ended because the child finished,
/// the child is shut down before this returns.
pub fn supervise<U: UpdateSink>(daemon: &mut Daemon<Kid<U>>) -> ExitReason {
    let reason = daemon.run();
    if reason != ExitReason::IdleHook {
        let grace = Duration::from_millis(daemon.context().settings().stop_grace_ms);
        daemon.state_mut().shutdown(grace);
    }
    reason
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
