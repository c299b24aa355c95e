//! Controller operations: the local side of the CLI.
//!
//! The controller owns the node registry and reaches orchestrators on
//! nodes through `RemoteShell`. It never talks to a remote orchestrator's
//! socket directly; every remote step is a `labrig` invocation on the node.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::ControllerError;
use crate::experiment::Experiment;
use crate::node::runner::CommandRunner;
use crate::node::{shell_quote, Node, NodeKind, NodeRegistry, RemoteShell, NODES_FILE};
use crate::settings::Settings;


pub struct Controller<R> {
    root: PathBuf,
    settings: Settings,
    registry: NodeRegistry,
    runner: R,
}


impl<R: CommandRunner> Controller<R> {
    /// Load settings and the node registry from `root`.
    pub fn open(root: &Path, runner: R) -> Result<Controller<R>, ControllerError> {
        let settings = Settings::load(root).map_err(ControllerError::Registry)?;
        let registry = NodeRegistry::load(&root.join(NODES_FILE)).map_err(ControllerError::Registry)?;
        Ok(Controller {
            root: root.to_path_buf(),
            settings,
            registry,
            runner,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn nodes(&self) -> Vec<&Node> {
        self.registry.list()
    }

    /// Add or replace a node and persist the registry.
    pub fn add_node(&mut self, node: Node) -> Result<Option<Node>, ControllerError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| ControllerError::Registry(format!("cannot create {}: {}", self.root.display(), e)))?;
        let id = node.id.clone();
        let previous = self.registry.upsert(node);
        self.registry
            .save(&self.root.join(NODES_FILE))
            .map_err(ControllerError::Registry)?;
        info!(node = %id, replaced = previous.is_some(), "node registered");
        Ok(previous)
    }

    pub fn describe_node(&self, id: &str) -> Result<&Node, ControllerError> {
        self.registry
            .get(id)
            .ok_or_else(|| ControllerError::UnknownNode(id.to_string()))
    }

    pub fn test_node(&self, id: &str) -> Result<String, ControllerError> {
        let node = self.describe_node(id)?;
        Ok(self.shell(node).test_connection()?)
    }

    /// Load every experiment definition in `folder`.
    pub fn register(&self, folder: &Path) -> Result<Vec<Experiment>, ControllerError> {
        let experiments = Experiment::load_folder(folder)?;
        info!(folder = %folder.display(), count = experiments.len(), "experiments loaded");
        Ok(experiments)
    }

    /// Make sure the node's orchestrator is up, then hand it the experiment.
    /// Returns the orchestrator's reply text.
    pub fn submit(&self, experiment: &Experiment, node_id: &str) -> Result<String, ControllerError> {
        let node = self.describe_node(node_id)?;
        let shell = self.shell(node);

        match shell.execute(&mum_start_command(node), None) {
            Ok(_) => info!(node = %node.id, "orchestrator started"),
            Err(e) if e.is_already_running() => {
                info!(node = %node.id, "orchestrator already running");
            }
            Err(e) => {
                warn!(node = %node.id, error = %e, "orchestrator bootstrap failed");
                return Err(e.into());
            }
        }

        let mut outgoing = experiment.clone();
        outgoing.cluster = Some(node.id.clone());
        let payload = serde_json::to_string(&outgoing)?;
        let submit = format!("labrig --root {} mum submit -", shell_quote(&node.workdir));
        let output = shell.execute(&submit, Some(&payload))?;
        info!(experiment = %experiment.id, node = %node.id, "submitted");
        Ok(output.stdout.trim_end().to_string())
    }

    /// Experiment report from the node's orchestrator, one id or all.
    pub fn status(&self, node_id: &str, id: Option<&str>) -> Result<String, ControllerError> {
        let node = self.describe_node(node_id)?;
        let mut command = format!("labrig --root {} mum experiments", shell_quote(&node.workdir));
        if let Some(id) = id {
            command.push(' ');
            command.push_str(&shell_quote(id));
        }
        let output = self.shell(node).execute(&command, None)?;
        Ok(output.stdout.trim_end().to_string())
    }

    fn shell<'a>(&'a self, node: &'a Node) -> RemoteShell<'a> {
        RemoteShell::new(node, &self.settings, &self.runner)
    }
}


fn mum_start_command(node: &Node) -> String {
    let mut command = format!("labrig --root {} mum start", shell_quote(&node.workdir));
    if node.kind == NodeKind::BatchScheduler && !node.scheduler_args.is_empty() {
        command.push_str(" --srun-args ");
        command.push_str(&shell_quote(&node.scheduler_args.join(" ")));
    }
    command
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
