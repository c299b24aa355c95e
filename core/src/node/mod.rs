//! Remote execution targets ("nodes") and the node registry.
//!
//! A node is either an unmanaged host reached over SSH or the login host
//! of a batch-scheduler partition. Commands run through
//! `ssh <address> "cd <workdir>; [prelude;] PATH=<runtime>:$PATH <command>"`,
//! where the prelude (e.g. `module load slurm`) is only used on scheduler
//! nodes.

pub mod runner;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::RemoteExecError;
use crate::settings::Settings;

use self::runner::{CommandRunner, ExecOutput};


/// File holding the node registry inside the instance root.
pub const NODES_FILE: &str = "nodes.yaml";


// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Unmanaged,
    BatchScheduler,
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    /// Short name used to reference this node (e.g. "gpu1", "cluster-a").
    pub id: String,
    pub kind: NodeKind,
    /// SSH destination, `host` or `user@host`.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    /// Instance root on the node; remote commands run from here.
    pub workdir: String,
    /// Extra arguments for the scheduler's launcher, e.g. `-p gpu -N1`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduler_args: Vec<String>,
}


impl Node {
    /// SSH arguments up to and including the destination.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(port) = self.ssh_port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(self.address.clone());
        args
    }
}


// ---------------------------------------------------------------------------
// NodeRegistry
// ---------------------------------------------------------------------------

/// Nodes by id. Adding an existing id replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeRegistry {
    #[serde(default)]
    nodes: BTreeMap<String, Node>,
}


impl NodeRegistry {
    pub fn new() -> NodeRegistry {
        NodeRegistry::default()
    }

    /// Insert or replace a node. Returns the node it replaced.
    pub fn upsert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.id.clone(), node)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn list(&self) -> Vec<&Node> {
        self.nodes.values().collect()
    }

    /// Load from a YAML file. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<NodeRegistry, String> {
        if !path.exists() {
            return Ok(NodeRegistry::new());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        if content.trim().is_empty() {
            return Ok(NodeRegistry::new());
        }
        let registry: NodeRegistry = serde_yaml::from_str(&content)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        for (key, node) in &registry.nodes {
            if key != &node.id {
                return Err(format!("{}: node '{}' is filed under '{}'", path.display(), node.id, key));
            }
        }
        Ok(registry)
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| format!("cannot serialize node registry: {}", e))?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }
}


// ---------------------------------------------------------------------------
// RemoteShell
// ---------------------------------------------------------------------------

/// Runs commands on one node through an injected `CommandRunner`.
pub struct RemoteShell<'a> {
    node: &'a Node,
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
}


impl<'a> RemoteShell<'a> {
    pub fn new(node: &'a Node, settings: &'a Settings, runner: &'a dyn CommandRunner) -> RemoteShell<'a> {
        RemoteShell { node, settings, runner }
    }

    /// The remote shell line that runs `command` on this node.
    pub fn bootstrap_command(&self, command: &str) -> String {
        let mut line = format!("cd {}; ", shell_quote(&self.node.workdir));
        if self.node.kind == NodeKind::BatchScheduler && !self.settings.scheduler_prelude.is_empty() {
            line.push_str(&self.settings.scheduler_prelude);
            line.push_str("; ");
        }
        if let Some(dir) = &self.settings.remote_runtime_dir {
            line.push_str(&format!("PATH={}:$PATH ", shell_quote(dir)));
        }
        line.push_str(command);
        line
    }

    /// Run `command` on the node. A nonzero exit is an error carrying the
    /// captured output.
    pub fn execute(&self, command: &str, stdin: Option<&str>) -> Result<ExecOutput, RemoteExecError> {
        let mut args = self.node.ssh_args();
        args.push(self.bootstrap_command(command));
        debug!(node = %self.node.id, command, "remote execute");

        let output = self
            .runner
            .run("ssh", &args, stdin)
            .map_err(|e| RemoteExecError::Spawn {
                target: self.node.id.clone(),
                message: e.to_string(),
            })?;
        if output.code != 0 {
            return Err(RemoteExecError::Failed {
                target: self.node.id.clone(),
                command: command.to_string(),
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Check that the node runs a `labrig` of our version.
    pub fn test_connection(&self) -> Result<String, RemoteExecError> {
        let expected = format!("labrig {}", crate::VERSION);
        let output = self.execute("labrig --version", None)?;
        let found = output.stdout.trim().to_string();
        if !found.contains(&expected) {
            return Err(RemoteExecError::Mismatch {
                target: self.node.id.clone(),
                expected,
                found,
            });
        }
        info!(node = %self.node.id, version = %found, "connection ok");
        Ok(found)
    }
}


/// Quote `s` for a POSIX shell unless it is plainly safe.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | ',' | '+' | '@' | '~'));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::runner::MockRunner;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_dir() -> PathBuf {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("lrn{}-{}", std::process::id(), seq));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn host() -> Node {
        Node {
            id: "gpu1".into(),
            kind: NodeKind::Unmanaged,
            address: "alice@gpu1.lab".into(),
            ssh_port: None,
            workdir: "/home/alice/labrig".into(),
            scheduler_args: Vec::new(),
        }
    }

    fn cluster() -> Node {
        Node {
            id: "hpc".into(),
            kind: NodeKind::BatchScheduler,
            address: "login.hpc".into(),
            ssh_port: Some(2222),
            workdir: "/scratch/my runs".into(),
            scheduler_args: vec!["-p".into(), "gpu".into()],
        }
    }

    #[test]
    fn unmanaged_bootstrap_has_no_prelude() {
        let node = host();
        let settings = Settings::default();
        let runner = MockRunner::new();
        let shell = RemoteShell::new(&node, &settings, &runner);
        assert_eq!(shell.bootstrap_command("labrig mum start"), "cd /home/alice/labrig; labrig mum start");
    }

    #[test]
    fn scheduler_bootstrap_loads_modules_and_sets_path() {
        let node = cluster();
        let settings = Settings {
            remote_runtime_dir: Some("/opt/labrig/bin".into()),
            ..Settings::default()
        };
        let runner = MockRunner::new();
        let shell = RemoteShell::new(&node, &settings, &runner);
        assert_eq!(
            shell.bootstrap_command("labrig mum start"),
            "cd '/scratch/my runs'; module load slurm; PATH=/opt/labrig/bin:$PATH labrig mum start"
        );
    }

    #[test]
    fn execute_goes_through_ssh_with_stdin() {
        let node = cluster();
        let settings = Settings::default();
        let runner = MockRunner::with_responses(vec![ExecOutput::ok("registered e1\n")]);
        let shell = RemoteShell::new(&node, &settings, &runner);

        let out = shell.execute("labrig mum submit -", Some("{}")).unwrap();
        assert_eq!(out.stdout, "registered e1\n");

        let call = &runner.calls()[0];
        assert_eq!(call.program, "ssh");
        assert_eq!(&call.args[..6], &["-o", "BatchMode=yes", "-o", "ConnectTimeout=10", "-p", "2222"]);
        assert_eq!(call.args[6], "login.hpc");
        assert!(call.args[7].ends_with("labrig mum submit -"));
        assert_eq!(call.stdin.as_deref(), Some("{}"));
    }

    #[test]
    fn nonzero_exit_is_typed_failure_with_output() {
        let node = host();
        let settings = Settings::default();
        let runner = MockRunner::with_responses(vec![ExecOutput {
            code: 127,
            stdout: "partial".into(),
            stderr: "labrig: not found".into(),
        }]);
        let shell = RemoteShell::new(&node, &settings, &runner);
        match shell.execute("labrig mum start", None).unwrap_err() {
            RemoteExecError::Failed { code, stdout, stderr, .. } => {
                assert_eq!(code, 127);
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "labrig: not found");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_connection_checks_version() {
        let node = host();
        let settings = Settings::default();
        let good = MockRunner::with_responses(vec![ExecOutput::ok(&format!("labrig {}\n", crate::VERSION))]);
        assert!(RemoteShell::new(&node, &settings, &good).test_connection().is_ok());

        let old = MockRunner::with_responses(vec![ExecOutput::ok("labrig 0.0.1\n")]);
        let err = RemoteShell::new(&node, &settings, &old).test_connection().unwrap_err();
        assert!(matches!(err, RemoteExecError::Mismatch { .. }));
    }

    #[test]
    fn registry_upsert_overwrites_and_persists() {
        let dir = test_dir();
        let path = dir.join(NODES_FILE);
        let mut reg = NodeRegistry::load(&path).unwrap();
        assert!(reg.list().is_empty());

        assert!(reg.upsert(host()).is_none());
        reg.upsert(cluster());
        let mut moved = host();
        moved.address = "alice@gpu1-new.lab".into();
        assert!(reg.upsert(moved).is_some());
        reg.save(&path).unwrap();

        let back = NodeRegistry::load(&path).unwrap();
        assert_eq!(back, reg);
        assert_eq!(back.get("gpu1").unwrap().address, "alice@gpu1-new.lab");
        assert_eq!(back.list().len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn node_kind_is_kebab_case() {
        let yaml = serde_yaml::to_string(&cluster()).unwrap();
        assert!(yaml.contains("kind: batch-scheduler"));
    }

    #[test]
    fn shell_quote_cases() {
        assert_eq!(shell_quote("/tmp/x"), "/tmp/x");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
