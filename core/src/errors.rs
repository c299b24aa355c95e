use std::path::PathBuf;

use thiserror::Error;


// ---------------------------------------------------------------------------
// Daemon lifecycle errors
// ---------------------------------------------------------------------------

/// Phrase an `AlreadyRunning` failure prints, as seen in a remote stderr.
pub const ALREADY_RUNNING: &str = "is already running";


#[derive(Debug, Error)]
pub enum DaemonError {
    /// `start()` found a live process holding the instance name. The text
    /// must keep containing `ALREADY_RUNNING`; controllers match on it.
    #[error("instance '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("instance '{name}' is not running")]
    NotRunning { name: String },

    #[error("cannot spawn daemon for '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The detached child exited before publishing its port record.
    #[error("daemon '{name}' exited during startup: {stderr}")]
    ChildExited { name: String, stderr: String },

    #[error("daemon '{name}' did not publish a port record within {timeout_ms}ms")]
    StartTimeout { name: String, timeout_ms: u64 },

    #[error("cannot bind listener for '{name}': {source}")]
    Bind {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}


// ---------------------------------------------------------------------------
// RPC errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RpcError {
    /// Server is not listening yet (or any more). Retryable.
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },

    /// Local target without a port record.
    #[error("no port record for instance '{name}'")]
    NotRunning { name: String },

    /// Request was sent but no reply arrived within the protocol timeout.
    #[error("no reply from {addr} to '{query}'")]
    NoReply { addr: String, query: String },

    #[error("bad frame: {0}")]
    Frame(String),

    #[error("cannot encode or decode message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Server answered with a nonzero return code.
    #[error("query '{query}' failed with rv={rv}: {}", msgbody.as_deref().unwrap_or("no message"))]
    Remote {
        query: String,
        rv: i64,
        msgbody: Option<String>,
    },
}


impl RpcError {
    /// Whether another attempt at the same round trip may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectionRefused { .. } | RpcError::NotRunning { .. }
        )
    }
}


// ---------------------------------------------------------------------------
// Remote execution errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RemoteExecError {
    /// Remote command exited nonzero. Carries whatever it printed.
    #[error("'{command}' on {target} exited with {code}: {}", stderr.trim())]
    Failed {
        target: String,
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// `test_connection()` reached the node but found the wrong runtime.
    #[error("runtime mismatch on {target}: expected '{expected}', found '{found}'")]
    Mismatch {
        target: String,
        expected: String,
        found: String,
    },

    #[error("cannot run remote shell for {target}: {message}")]
    Spawn { target: String, message: String },
}


impl RemoteExecError {
    /// Exit code a CLI should propagate for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RemoteExecError::Failed { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }

    /// A remote `start` refused because the instance is live. Any other
    /// exit 1 (timeout, early exit, bad settings) is a real failure.
    pub fn is_already_running(&self) -> bool {
        matches!(
            self,
            RemoteExecError::Failed { code: 1, stderr, .. } if stderr.contains(ALREADY_RUNNING)
        )
    }
}


// ---------------------------------------------------------------------------
// Experiment definition errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("unknown comparator '{0}' (expected gt, lt, eq, geq or leq)")]
    UnknownComparator(String),

    #[error("unknown action '{0}' (expected no action, warn, kill or email)")]
    UnknownAction(String),

    #[error("bad time gate '{0}' (expected 'immediately' or 'time N')")]
    BadTimeGate(String),

    #[error("cannot parse experiment {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}


// ---------------------------------------------------------------------------
// Controller errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("node registry: {0}")]
    Registry(String),

    #[error(transparent)]
    Remote(#[from] RemoteExecError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error("cannot encode experiment: {0}")]
    Codec(#[from] serde_json::Error),
}


impl ControllerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ControllerError::Remote(e) => e.exit_code(),
            _ => 1,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_and_not_running_are_retryable() {
        let refused = RpcError::ConnectionRefused { addr: "127.0.0.1:1".into() };
        let missing = RpcError::NotRunning { name: "mum".into() };
        let silent = RpcError::NoReply { addr: "127.0.0.1:1".into(), query: "uptime".into() };
        assert!(refused.is_retryable());
        assert!(missing.is_retryable());
        assert!(!silent.is_retryable());
    }

    #[test]
    fn remote_failure_propagates_exit_code() {
        let err = RemoteExecError::Failed {
            target: "gpu1".into(),
            command: "labrig mum start".into(),
            code: 127,
            stdout: String::new(),
            stderr: "labrig: command not found\n".into(),
        };
        assert_eq!(err.exit_code(), 127);
        assert!(err.to_string().contains("command not found"));
        assert_eq!(ControllerError::from(err).exit_code(), 127);
    }

    #[test]
    fn already_running_is_told_apart_from_other_exit_ones() {
        let live = DaemonError::AlreadyRunning { name: "mum".into(), pid: 77 };
        let failed = |stderr: String| RemoteExecError::Failed {
            target: "gpu1".into(),
            command: "labrig mum start".into(),
            code: 1,
            stdout: String::new(),
            stderr,
        };
        assert!(failed(format!("labrig: {}\n", live)).is_already_running());

        let timeout = DaemonError::StartTimeout { name: "mum".into(), timeout_ms: 10_000 };
        assert!(!failed(format!("labrig: {}\n", timeout)).is_already_running());
    }

    #[test]
    fn remote_error_message_mentions_rv() {
        let err = RpcError::Remote { query: "register".into(), rv: 1, msgbody: None };
        assert_eq!(err.to_string(), "query 'register' failed with rv=1: no message");
    }
}
