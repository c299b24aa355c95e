//! Orchestrator ("mum"): queues experiments, dispatches worker agents and
//! folds their reports into each experiment's record.
//!
//! All state lives in one `Mum` value owned by the daemon run loop, so
//! queries and idle ticks never race. Each idle tick:
//!
//! 1. Delivers deferred kill requests to worker agents
//! 2. Marks experiments whose agent vanished as `lost`
//! 3. Dispatches at most one pending experiment (FIFO)
//!
//! Kill requests are deferred to the idle tick because they usually arise
//! while an agent is blocked waiting for the reply to its own update.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Child;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::daemon::{self, Daemon, DaemonContext, Entrypoint, ExitReason, InstanceDir, Tick};
use crate::errors::DaemonError;
use crate::experiment::{ConditionAction, Experiment, ExperimentState};
use crate::kid::{Callback, KidLaunch, KidState, KidUpdate};
use crate::rpc::message::RpcMessage;
use crate::rpc::query::now_ms;
use crate::rpc::{QueryInterface, QueryTable};
use crate::settings::Settings;


/// Instance name of the orchestrator.
pub const MUM_INSTANCE: &str = "mum";

/// Lines of log output kept per experiment and log file.
const OUTPUT_TAIL_LINES: usize = 200;

/// Idle ticks a kill request is retried before it is dropped.
const KILL_ATTEMPTS: u32 = 5;


/// Instance name of the worker agent for an experiment.
pub fn kid_instance_name(experiment_id: &str) -> String {
    format!("kid-{}", experiment_id)
}


// ---------------------------------------------------------------------------
// KidLauncher
// ---------------------------------------------------------------------------

/// How the orchestrator starts, stops and watches worker agents.
pub trait KidLauncher: Send {
    /// Start an agent for `experiment` that reports to `callback_port`.
    fn launch(&mut self, experiment: &Experiment, callback_port: u16) -> Result<(), String>;
    /// Ask the agent to terminate its child.
    fn kill(&mut self, experiment_id: &str) -> Result<(), String>;
    /// Whether the agent process is still there.
    fn is_alive(&mut self, experiment_id: &str) -> bool;
}


/// Runs each agent as a detached `labrig kid run` process on this host.
pub struct ProcessKidLauncher {
    root: PathBuf,
    settings: Settings,
    /// Wraps every child command, e.g. `srun -N1 -n1` on a scheduler node.
    wrapper: Vec<String>,
    children: HashMap<String, Child>,
}


impl ProcessKidLauncher {
    pub fn new(root: &Path, settings: Settings, wrapper: Vec<String>) -> ProcessKidLauncher {
        ProcessKidLauncher {
            root: root.to_path_buf(),
            settings,
            wrapper,
            children: HashMap::new(),
        }
    }

    fn context(&self, experiment_id: &str) -> DaemonContext {
        DaemonContext::new(&self.root, &kid_instance_name(experiment_id), self.settings.clone())
    }
}


impl KidLauncher for ProcessKidLauncher {
    fn launch(&mut self, experiment: &Experiment, callback_port: u16) -> Result<(), String> {
        let ctx = self.context(&experiment.id);
        let payload = KidLaunch {
            experiment: experiment.id.clone(),
            command: experiment.command(),
            workdir: None,
            callback: Callback {
                host: "127.0.0.1".into(),
                port: callback_port,
            },
            wrapper: self.wrapper.clone(),
        };
        let json = serde_json::to_string(&payload).map_err(|e| e.to_string())?;
        ctx.instance().write_stdin(&json).map_err(|e| e.to_string())?;

        let entry = Entrypoint::current("kid", ctx.instance(), &[]).map_err(|e| e.to_string())?;
        let child = daemon::start(&ctx, &entry).map_err(|e| e.to_string())?;
        self.children.insert(experiment.id.clone(), child);
        Ok(())
    }

    fn kill(&mut self, experiment_id: &str) -> Result<(), String> {
        let ctx = self.context(experiment_id);
        QueryInterface::local(ctx.instance().clone(), &self.settings)
            .call_ok(&RpcMessage::new("kill"))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn is_alive(&mut self, experiment_id: &str) -> bool {
        // Reap first; an unreaped child still answers the liveness probe.
        if let Some(child) = self.children.get_mut(experiment_id) {
            if let Ok(Some(_)) = child.try_wait() {
                self.children.remove(experiment_id);
            }
        }
        daemon::status(self.context(experiment_id).instance()).is_running()
    }
}


// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The orchestrator's record of one experiment and its agent.
#[derive(Debug, Clone)]
pub struct Agent {
    pub experiment: Experiment,
    pub kid_pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// Log path -> most recent lines.
    pub output: BTreeMap<String, VecDeque<String>>,
}


impl Agent {
    fn new(experiment: Experiment) -> Agent {
        Agent {
            experiment,
            kid_pid: None,
            exit_code: None,
            output: BTreeMap::new(),
        }
    }

    fn push_line(&mut self, path: &str, line: &str) {
        let tail = self.output.entry(path.to_string()).or_default();
        if tail.len() >= OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    /// Whether an agent process should exist for this experiment.
    fn has_live_agent(&self) -> bool {
        matches!(
            self.experiment.state(),
            ExperimentState::SubmittedToKid | ExperimentState::Running
        )
    }
}


/// What `experiments` reports per experiment.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary<'a> {
    pub state: ExperimentState,
    pub exit_code: Option<i32>,
    pub warnings: &'a [crate::experiment::WarningRecord],
    pub states: &'a [crate::experiment::StateEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<&'a BTreeMap<String, VecDeque<String>>>,
}


// ---------------------------------------------------------------------------
// Mum
// ---------------------------------------------------------------------------

pub struct Mum {
    queue: VecDeque<String>,
    agents: BTreeMap<String, Agent>,
    launcher: Box<dyn KidLauncher>,
    callback_port: u16,
    kills: VecDeque<(String, u32)>,
}


impl fmt::Debug for Mum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mum")
            .field("queue", &self.queue)
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("callback_port", &self.callback_port)
            .finish()
    }
}


impl Mum {
    pub fn new(launcher: Box<dyn KidLauncher>, callback_port: u16) -> Mum {
        Mum {
            queue: VecDeque::new(),
            agents: BTreeMap::new(),
            launcher,
            callback_port,
            kills: VecDeque::new(),
        }
    }

    pub fn set_callback_port(&mut self, port: u16) {
        self.callback_port = port;
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn state_of(&self, id: &str) -> Option<ExperimentState> {
        self.agents.get(id).map(|a| a.experiment.state())
    }

    /// Accept an experiment: it becomes `submitted` and joins the back of
    /// the queue. An id that is still in flight is refused; a finished one
    /// is replaced.
    pub fn register(&mut self, mut experiment: Experiment, now_ms: u64) -> Result<(), String> {
        experiment.validate()?;
        if let Some(existing) = self.agents.get(&experiment.id) {
            if !existing.experiment.state().is_terminal() {
                return Err(format!(
                    "experiment '{}' is already {}",
                    experiment.id,
                    existing.experiment.state()
                ));
            }
        }
        experiment.normalize();
        if experiment.state().is_terminal() {
            return Err(format!(
                "experiment '{}' arrived already {}",
                experiment.id,
                experiment.state()
            ));
        }
        experiment.update_state(ExperimentState::Submitted, now_ms);
        let id = experiment.id.clone();
        info!(experiment = %id, "registered");
        self.agents.insert(id.clone(), Agent::new(experiment));
        self.queue.push_back(id);
        Ok(())
    }

    /// Ids waiting for dispatch, in queue order.
    pub fn pending(&self) -> Vec<&str> {
        self.queue.iter().map(String::as_str).collect()
    }

    /// Start the agent for the first experiment in the queue that is still
    /// `submitted`. At most one per call. Returns its id.
    pub fn dispatch_next(&mut self, now_ms: u64) -> Option<String> {
        while let Some(id) = self.queue.pop_front() {
            let agent = match self.agents.get_mut(&id) {
                Some(a) if a.experiment.state() == ExperimentState::Submitted => a,
                _ => continue,
            };
            match self.launcher.launch(&agent.experiment, self.callback_port) {
                Ok(()) => {
                    agent.experiment.update_state(ExperimentState::SubmittedToKid, now_ms);
                    info!(experiment = %id, "worker agent started");
                }
                Err(e) => {
                    error!(experiment = %id, error = %e, "cannot start worker agent");
                    agent.experiment.update_state(ExperimentState::Lost, now_ms);
                    agent
                        .experiment
                        .add_warning("launch", ConditionAction::Warn, &e, now_ms);
                }
            }
            return Some(id);
        }
        None
    }

    /// Fold one worker agent report into its experiment.
    pub fn apply_update(&mut self, update: &KidUpdate, now_ms: u64) -> Result<(), String> {
        let agent = self
            .agents
            .get_mut(&update.experiment)
            .ok_or_else(|| format!("no experiment '{}'", update.experiment))?;
        let id = update.experiment.clone();

        if update.pid.is_some() {
            agent.kid_pid = update.pid;
        }
        if matches!(update.state, KidState::Started | KidState::Running) {
            // A RUNNING report also covers a lost STARTED.
            if agent.experiment.update_state(ExperimentState::Running, now_ms) {
                info!(experiment = %id, pid = ?update.pid, "running");
            }
        }

        let mut kill = false;
        for (path, text) in &update.log_output {
            for line in text.lines() {
                agent.push_line(path, line);
                if agent.experiment.state() != ExperimentState::Running {
                    continue;
                }
                let verdict = agent.experiment.observe(line, now_ms);
                let condition = verdict.condition.as_deref().unwrap_or("");
                match verdict.action {
                    ConditionAction::Kill => {
                        info!(experiment = %id, condition, line, "condition requested kill");
                        agent.experiment.update_state(ExperimentState::Terminated, now_ms);
                        kill = true;
                    }
                    ConditionAction::Warn => warn!(experiment = %id, condition, line, "condition warning"),
                    ConditionAction::Email => {
                        warn!(experiment = %id, condition, line, "condition requested email")
                    }
                    ConditionAction::NoAction => {}
                }
            }
        }

        match update.state {
            KidState::Finished => {
                agent.exit_code = update.exit_code;
                if agent.experiment.update_state(ExperimentState::Finished, now_ms) {
                    info!(experiment = %id, exit_code = ?update.exit_code, "finished");
                } else {
                    debug!(experiment = %id, state = %agent.experiment.state(), "finish after terminal state");
                }
            }
            KidState::Failed => {
                let message = update.error.clone().unwrap_or_else(|| "child failed to start".into());
                error!(experiment = %id, error = %message, "worker agent could not start child");
                agent.experiment.update_state(ExperimentState::Lost, now_ms);
                agent
                    .experiment
                    .add_warning("launch", ConditionAction::Warn, &message, now_ms);
            }
            KidState::Started | KidState::Running => {}
        }

        if kill {
            self.kills.push_back((id, 0));
        }
        Ok(())
    }

    /// Operator-requested termination. Same path as a condition kill.
    pub fn request_kill(&mut self, id: &str, now_ms: u64) -> Result<(), String> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| format!("no experiment '{}'", id))?;
        let state = agent.experiment.state();
        if state.is_terminal() {
            return Err(format!("experiment '{}' is already {}", id, state));
        }
        agent.experiment.update_state(ExperimentState::Terminated, now_ms);
        info!(experiment = %id, previous = %state, "kill requested");
        if state == ExperimentState::Submitted {
            self.queue.retain(|q| q != id);
        } else {
            self.kills.push_back((id.to_string(), 0));
        }
        Ok(())
    }

    /// Deliver queued kill requests; failures are retried on later ticks.
    pub fn process_kills(&mut self) {
        let pending: Vec<(String, u32)> = self.kills.drain(..).collect();
        for (id, attempts) in pending {
            match self.launcher.kill(&id) {
                Ok(()) => debug!(experiment = %id, "kill delivered"),
                Err(e) if attempts + 1 < KILL_ATTEMPTS => {
                    debug!(experiment = %id, error = %e, "kill not delivered, will retry");
                    self.kills.push_back((id, attempts + 1));
                }
                Err(e) => warn!(experiment = %id, error = %e, "giving up on kill"),
            }
        }
    }

    /// Experiments with an agent that is no longer alive move to `lost`.
    pub fn reap_lost(&mut self, now_ms: u64) -> Vec<String> {
        let mut lost = Vec::new();
        for (id, agent) in self.agents.iter_mut() {
            if !agent.has_live_agent() || self.launcher.is_alive(id) {
                continue;
            }
            warn!(experiment = %id, state = %agent.experiment.state(), "worker agent gone without reporting");
            agent.experiment.update_state(ExperimentState::Lost, now_ms);
            lost.push(id.clone());
        }
        lost
    }

    /// Idle-tick work of the run loop.
    pub fn on_idle(&mut self) -> Tick {
        let now = now_ms();
        self.process_kills();
        self.reap_lost(now);
        self.dispatch_next(now);
        Tick::Continue
    }

    /// State, warnings and history of one experiment (with its output
    /// tail) or of all of them.
    pub fn report(&self, id: Option<&str>) -> Result<Value, String> {
        let summary = |agent: &Agent, with_output: bool| {
            serde_json::to_value(ExperimentSummary {
                state: agent.experiment.state(),
                exit_code: agent.exit_code,
                warnings: &agent.experiment.warnings,
                states: &agent.experiment.states,
                output: if with_output { Some(&agent.output) } else { None },
            })
            .unwrap_or(Value::Null)
        };

        let mut map = serde_json::Map::new();
        match id {
            Some(id) => {
                let agent = self
                    .agents
                    .get(id)
                    .ok_or_else(|| format!("no experiment '{}'", id))?;
                map.insert(id.to_string(), summary(agent, true));
            }
            None => {
                for (id, agent) in &self.agents {
                    map.insert(id.clone(), summary(agent, false));
                }
            }
        }
        Ok(Value::Object(map))
    }

    /// The orchestrator's query table.
    pub fn queries() -> QueryTable<Mum> {
        let mut table: QueryTable<Mum> = QueryTable::new();

        table.register("register", |mum: &mut Mum, _s, msg, reply| {
            let exp: Experiment = msg
                .kwarg_as("experiment")?
                .ok_or("missing 'experiment' argument")?;
            let id = exp.id.clone();
            mum.register(exp, now_ms())?;
            reply.succeed(format!("registered {}", id));
            Ok(())
        });

        table.register("list", |mum: &mut Mum, _s, _msg, reply| {
            reply.rv = 0;
            reply.set("pending", mum.pending());
            Ok(())
        });

        table.register("update", |mum: &mut Mum, _s, msg, reply| {
            let update = KidUpdate::from_message(msg)?;
            mum.apply_update(&update, now_ms())?;
            reply.rv = 0;
            Ok(())
        });

        table.register("experiments", |mum: &mut Mum, _s, msg, reply| {
            let report = mum.report(msg.kwarg_str("id"))?;
            reply.rv = 0;
            reply.set("experiments", report);
            Ok(())
        });

        table.register("kill", |mum: &mut Mum, _s, msg, reply| {
            let id = msg.kwarg_str("id").ok_or("missing 'id' argument")?;
            mum.request_kill(id, now_ms())?;
            reply.succeed(format!("terminating {}", id));
            Ok(())
        });

        table
    }
}


/// Foreground entry point of the orchestrator instance.
pub fn run_mum(ctx: DaemonContext, launcher: Box<dyn KidLauncher>) -> Result<ExitReason, DaemonError> {
    let mum = Mum::new(launcher, 0);
    let mut daemon = Daemon::bind(ctx, mum, Mum::queries(), |mum, _ctx| mum.on_idle())?;
    let port = daemon.port();
    daemon.state_mut().set_callback_port(port);
    Ok(daemon.run())
}


/// Client for the orchestrator instance under `root`.
pub fn mum_client(root: &Path, settings: &Settings) -> QueryInterface {
    QueryInterface::local(InstanceDir::new(root, MUM_INSTANCE), settings)
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{Comparator, Condition, TimeGate};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    static TEST_SEQ: AtomicU32 = AtomicU32::new(0);

    #[derive(Default)]
    struct Calls {
        launched: Vec<(String, u16)>,
        killed: Vec<String>,
        alive: HashSet<String>,
        fail_launch: bool,
        fail_kill: bool,
    }

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<Calls>>);

    impl KidLauncher for Recording {
        fn launch(&mut self, experiment: &Experiment, callback_port: u16) -> Result<(), String> {
            let mut calls = self.0.lock().unwrap();
            if calls.fail_launch {
                return Err("no such binary".into());
            }
            calls.launched.push((experiment.id.clone(), callback_port));
            calls.alive.insert(experiment.id.clone());
            Ok(())
        }

        fn kill(&mut self, experiment_id: &str) -> Result<(), String> {
            let mut calls = self.0.lock().unwrap();
            if calls.fail_kill {
                return Err("no reply".into());
            }
            calls.killed.push(experiment_id.to_string());
            Ok(())
        }

        fn is_alive(&mut self, experiment_id: &str) -> bool {
            self.0.lock().unwrap().alive.contains(experiment_id)
        }
    }

    fn mum() -> (Mum, Recording) {
        let rec = Recording::default();
        (Mum::new(Box::new(rec.clone()), 7000), rec)
    }

    fn exp_with_conditions(id: &str) -> Experiment {
        let mut exp = Experiment::new(id, "python train.py");
        exp.conditions = vec![
            Condition {
                name: "slow".into(),
                variable: "loss".into(),
                threshold: 5.0,
                comparator: Comparator::Gt,
                when: TimeGate::Immediately,
                action: ConditionAction::Warn,
                start_time_ms: None,
            },
            Condition {
                name: "diverged".into(),
                variable: "loss".into(),
                threshold: 50.0,
                comparator: Comparator::Gt,
                when: TimeGate::Immediately,
                action: ConditionAction::Kill,
                start_time_ms: None,
            },
        ];
        exp
    }

    fn update(id: &str, state: KidState) -> KidUpdate {
        KidUpdate::new(id, state)
    }

    fn with_log(id: &str, text: &str) -> KidUpdate {
        let mut u = update(id, KidState::Running);
        u.log_output.insert("/x/child.out".into(), text.into());
        u
    }

    fn running(mum: &mut Mum, id: &str) {
        mum.register(exp_with_conditions(id), 1).unwrap();
        mum.dispatch_next(2);
        let mut started = update(id, KidState::Started);
        started.pid = Some(4321);
        mum.apply_update(&started, 3).unwrap();
    }

    #[test]
    fn register_queues_submitted_experiment() {
        let (mut mum, _rec) = mum();
        mum.register(Experiment::new("a", "true"), 1).unwrap();
        mum.register(Experiment::new("b", "true"), 1).unwrap();
        assert_eq!(mum.pending(), vec!["a", "b"]);
        assert_eq!(mum.state_of("a"), Some(ExperimentState::Submitted));

        let err = mum.register(Experiment::new("a", "true"), 2).unwrap_err();
        assert!(err.contains("already submitted"));
    }

    #[test]
    fn one_dispatch_per_tick_in_fifo_order() {
        let (mut mum, rec) = mum();
        for id in ["a", "b", "c"] {
            mum.register(Experiment::new(id, "true"), 1).unwrap();
        }
        assert_eq!(mum.on_idle(), Tick::Continue);
        assert_eq!(rec.0.lock().unwrap().launched, vec![("a".to_string(), 7000)]);
        assert_eq!(mum.pending(), vec!["b", "c"]);
        assert_eq!(mum.state_of("a"), Some(ExperimentState::SubmittedToKid));

        mum.on_idle();
        mum.on_idle();
        mum.on_idle();
        let launched: Vec<String> = rec.0.lock().unwrap().launched.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(launched, vec!["a", "b", "c"]);
    }

    #[test]
    fn launch_failure_marks_lost() {
        let (mut mum, rec) = mum();
        rec.0.lock().unwrap().fail_launch = true;
        mum.register(Experiment::new("a", "true"), 1).unwrap();
        assert_eq!(mum.dispatch_next(2).as_deref(), Some("a"));
        assert_eq!(mum.state_of("a"), Some(ExperimentState::Lost));
        assert_eq!(mum.agent("a").unwrap().experiment.warnings.len(), 1);
    }

    #[test]
    fn started_update_moves_to_running_and_arms_conditions() {
        let (mut mum, _rec) = mum();
        running(&mut mum, "a");
        let agent = mum.agent("a").unwrap();
        assert_eq!(agent.experiment.state(), ExperimentState::Running);
        assert_eq!(agent.kid_pid, Some(4321));
        assert!(agent.experiment.conditions.iter().all(|c| c.start_time_ms == Some(3)));
    }

    #[test]
    fn warn_is_recorded_and_experiment_keeps_running() {
        let (mut mum, rec) = mum();
        running(&mut mum, "a");
        mum.apply_update(&with_log("a", "epoch 1\nloss 7\n"), 4).unwrap();

        let agent = mum.agent("a").unwrap();
        assert_eq!(agent.experiment.state(), ExperimentState::Running);
        assert_eq!(agent.experiment.warnings.len(), 1);
        assert_eq!(agent.experiment.warnings[0].condition, "slow");
        assert_eq!(agent.output["/x/child.out"], vec!["epoch 1", "loss 7"]);
        assert!(rec.0.lock().unwrap().killed.is_empty());
    }

    #[test]
    fn kill_condition_terminates_and_finish_does_not_downgrade() {
        let (mut mum, rec) = mum();
        running(&mut mum, "a");
        mum.apply_update(&with_log("a", "loss 7\nloss 51\nloss 99\n"), 4).unwrap();
        assert_eq!(mum.state_of("a"), Some(ExperimentState::Terminated));
        // Lines after the kill are kept but not evaluated.
        assert_eq!(mum.agent("a").unwrap().experiment.warnings.len(), 1);
        assert!(rec.0.lock().unwrap().killed.is_empty(), "kill waits for the idle tick");

        mum.on_idle();
        assert_eq!(rec.0.lock().unwrap().killed, vec!["a".to_string()]);

        let mut fin = update("a", KidState::Finished);
        fin.exit_code = Some(143);
        mum.apply_update(&fin, 5).unwrap();
        let agent = mum.agent("a").unwrap();
        assert_eq!(agent.experiment.state(), ExperimentState::Terminated);
        assert_eq!(agent.exit_code, Some(143));
    }

    #[test]
    fn failed_kill_is_retried_then_dropped() {
        let (mut mum, rec) = mum();
        running(&mut mum, "a");
        rec.0.lock().unwrap().fail_kill = true;
        mum.request_kill("a", 4).unwrap();
        for _ in 0..KILL_ATTEMPTS {
            mum.process_kills();
        }
        assert!(mum.kills.is_empty());
        assert_eq!(mum.state_of("a"), Some(ExperimentState::Terminated));
    }

    #[test]
    fn operator_kill_of_queued_experiment_removes_it() {
        let (mut mum, rec) = mum();
        mum.register(Experiment::new("a", "true"), 1).unwrap();
        mum.request_kill("a", 2).unwrap();
        assert!(mum.pending().is_empty());
        assert_eq!(mum.state_of("a"), Some(ExperimentState::Terminated));
        mum.on_idle();
        assert!(rec.0.lock().unwrap().launched.is_empty());
        assert!(mum.request_kill("a", 3).is_err());
    }

    #[test]
    fn failed_report_marks_lost_with_warning() {
        let (mut mum, _rec) = mum();
        mum.register(Experiment::new("a", "true"), 1).unwrap();
        mum.dispatch_next(2);
        let mut failed = update("a", KidState::Failed);
        failed.error = Some("cannot start 'true': No such file or directory".into());
        mum.apply_update(&failed, 3).unwrap();

        let agent = mum.agent("a").unwrap();
        assert_eq!(agent.experiment.state(), ExperimentState::Lost);
        assert!(agent.experiment.warnings[0].line.contains("No such file"));
    }

    #[test]
    fn vanished_agent_is_lost() {
        let (mut mum, rec) = mum();
        running(&mut mum, "a");
        assert!(mum.reap_lost(4).is_empty());

        rec.0.lock().unwrap().alive.clear();
        assert_eq!(mum.reap_lost(5), vec!["a".to_string()]);
        assert_eq!(mum.state_of("a"), Some(ExperimentState::Lost));
    }

    #[test]
    fn update_for_unknown_experiment_fails() {
        let (mut mum, _rec) = mum();
        assert!(mum.apply_update(&update("ghost", KidState::Started), 1).is_err());
    }

    #[test]
    fn report_single_and_all() {
        let (mut mum, _rec) = mum();
        running(&mut mum, "a");
        mum.register(Experiment::new("b", "true"), 1).unwrap();

        let all = mum.report(None).unwrap();
        assert_eq!(all["a"]["state"], "running");
        assert_eq!(all["b"]["state"], "submitted");
        assert!(all["a"].get("output").is_none());

        let one = mum.report(Some("a")).unwrap();
        assert!(one["a"].get("output").is_some());
        assert!(mum.report(Some("zzz")).is_err());
    }

    // --- Through the daemon ---

    #[test]
    fn queries_over_a_running_orchestrator() {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        let root = std::env::temp_dir().join(format!("lrm{}-{}", std::process::id(), seq));
        std::fs::create_dir_all(&root).unwrap();
        let settings = Settings {
            accept_poll_ms: 10,
            protocol_timeout_ms: 1_000,
            refused_backoff_ms: 20,
            ..Settings::default()
        };

        let rec = Recording::default();
        let ctx = DaemonContext::new(&root, MUM_INSTANCE, settings.clone());
        let mut daemon = Daemon::bind(ctx, Mum::new(Box::new(rec.clone()), 0), Mum::queries(), |m, _c| m.on_idle()).unwrap();
        let port = daemon.port();
        daemon.state_mut().set_callback_port(port);
        let thread = std::thread::spawn(move || daemon.run());

        let client = mum_client(&root, &settings);
        let exp = serde_json::to_value(exp_with_conditions("e1")).unwrap();
        client.call_ok(&RpcMessage::new("register").kwarg("experiment", exp)).unwrap();

        // Dispatch happens on an idle tick.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while rec.0.lock().unwrap().launched.is_empty() {
            assert!(std::time::Instant::now() < deadline, "never dispatched");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(rec.0.lock().unwrap().launched[0], ("e1".to_string(), port));

        client.call_ok(&update("e1", KidState::Started).to_message()).unwrap();
        let reply = client.call_ok(&RpcMessage::new("experiments").kwarg("id", "e1")).unwrap();
        assert_eq!(reply.get("experiments").unwrap()["e1"]["state"], "running");

        let bad = client.call(&RpcMessage::new("kill").kwarg("id", "nope")).unwrap();
        assert_eq!(bad.rv, 1);

        client.call_ok(&RpcMessage::new("stop")).unwrap();
        thread.join().unwrap();
        let _ = std::fs::remove_dir_all(&root);
    }
}
