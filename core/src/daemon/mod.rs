//! Daemon runtime: the single-threaded run loop shared by every role.
//!
//! A `Daemon<S>` owns its state `S`, a `QueryTable<S>` and an idle hook.
//! The orchestrator and the worker agent are the same runtime with a
//! different table and hook.
//!
//! # Main loop tick
//!
//! 1. Exit if a termination signal arrived or the port record is gone
//! 2. Accept one connection (bounded by the context's poll interval)
//! 3. Serve it, or run the idle hook if nobody connected
//! 4. Exit if a `stop` query asked for it
//!
//! Every exit path removes the instance's liveness files.

pub mod instance;
pub mod lifecycle;
pub mod process;
pub mod signals;

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::DaemonError;
use crate::rpc::query::{QueryTable, Session};
use crate::rpc::service::{serve_connection, QueryService};
use crate::settings::Settings;

pub use instance::InstanceDir;
pub use lifecycle::{cleanup, restart, start, status, stop, StopOutcome};
pub use process::{Entrypoint, Liveness};


// ---------------------------------------------------------------------------
// DaemonContext
// ---------------------------------------------------------------------------

/// Everything a component needs to know about the instance it runs in.
/// Created once per instance and passed down explicitly.
#[derive(Debug, Clone)]
pub struct DaemonContext {
    instance: InstanceDir,
    settings: Settings,
    poll: Duration,
}


impl DaemonContext {
    pub fn new(root: &Path, name: &str, settings: Settings) -> DaemonContext {
        let poll = settings.accept_poll();
        DaemonContext {
            instance: InstanceDir::new(root, name),
            settings,
            poll,
        }
    }

    /// Override how long one accept waits before the idle hook runs.
    pub fn with_poll(mut self, poll: Duration) -> DaemonContext {
        self.poll = poll;
        self
    }

    pub fn name(&self) -> &str {
        self.instance.name()
    }

    pub fn instance(&self) -> &InstanceDir {
        &self.instance
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn poll(&self) -> Duration {
        self.poll
    }
}


// ---------------------------------------------------------------------------
// Tick / ExitReason
// ---------------------------------------------------------------------------

/// What the idle hook wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Quit,
}


/// Why a run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A `stop` query was served.
    StopQuery,
    /// Someone removed the port record.
    PortRecordRemoved,
    /// SIGTERM or SIGINT.
    Signal,
    /// The idle hook returned `Tick::Quit`.
    IdleHook,
}


pub type IdleHook<S> = Box<dyn FnMut(&mut S, &DaemonContext) -> Tick + Send>;


// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon<S> {
    ctx: DaemonContext,
    service: QueryService,
    queries: QueryTable<S>,
    state: S,
    on_idle: IdleHook<S>,
    started: Instant,
    quit: bool,
}


impl<S> Daemon<S> {
    /// Claim the instance: refuse if another live process owns it, bind the
    /// listener, then publish the pid and port records.
    pub fn bind<F>(ctx: DaemonContext, state: S, queries: QueryTable<S>, on_idle: F) -> Result<Daemon<S>, DaemonError>
    where
        F: FnMut(&mut S, &DaemonContext) -> Tick + Send + 'static,
    {
        let instance = ctx.instance().clone();
        instance.ensure()?;

        match process::probe(&instance) {
            Liveness::Running { pid } if pid != std::process::id() => {
                return Err(DaemonError::AlreadyRunning {
                    name: instance.name().to_string(),
                    pid,
                });
            }
            Liveness::Stale { pid } => {
                debug!(instance = instance.name(), ?pid, "replacing stale liveness files");
            }
            _ => {}
        }

        let service = QueryService::bind_loopback().map_err(|source| DaemonError::Bind {
            name: instance.name().to_string(),
            source,
        })?;

        instance.write_pid(std::process::id())?;
        instance.write_port(service.port())?;
        info!(instance = instance.name(), port = service.port(), pid = std::process::id(), "listening");

        Ok(Daemon {
            ctx,
            service,
            queries,
            state,
            on_idle: Box::new(on_idle),
            started: Instant::now(),
            quit: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.service.port()
    }

    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn queries(&self) -> &QueryTable<S> {
        &self.queries
    }

    /// Run until a stop query, a signal, the idle hook, or the port record
    /// disappearing ends the loop. Liveness files are removed on the way out.
    pub fn run(&mut self) -> ExitReason {
        signals::install();
        self.started = Instant::now();

        let reason = loop {
            if let Some(reason) = self.tick() {
                break reason;
            }
        };

        self.ctx.instance().cleanup();
        info!(instance = self.ctx.name(), ?reason, "run loop finished");
        reason
    }

    /// Run exactly one tick of the main loop.
    /// Returns the exit reason once the loop should end.
    pub fn tick(&mut self) -> Option<ExitReason> {
        if signals::termination_requested() {
            return Some(ExitReason::Signal);
        }
        if !self.ctx.instance().has_port_record() {
            return Some(ExitReason::PortRecordRemoved);
        }

        match self.service.accept_timeout(self.ctx.poll()) {
            Ok(Some(stream)) => {
                let mut session = Session::new(&self.ctx, self.started);
                let timeout = self.ctx.settings().protocol_timeout();
                match serve_connection(stream, &mut self.queries, &mut self.state, &mut session, timeout) {
                    Ok(name) => debug!(instance = self.ctx.name(), query = %name, "served"),
                    Err(e) => warn!(instance = self.ctx.name(), error = %e, "connection error"),
                }
                if session.quit_requested() {
                    self.quit = true;
                }
            }
            Ok(None) => {
                if (self.on_idle)(&mut self.state, &self.ctx) == Tick::Quit {
                    return Some(ExitReason::IdleHook);
                }
            }
            Err(e) => {
                warn!(instance = self.ctx.name(), error = %e, "accept failed");
            }
        }

        if self.quit {
            return Some(ExitReason::StopQuery);
        }
        None
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
