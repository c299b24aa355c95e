//! Runtime settings shared by every labrig process.
//!
//! Settings live in `<instance_root>/labrig.yaml`. Every field has a
//! default, so a missing file or a partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};


/// Name of the settings file inside the instance root.
pub const SETTINGS_FILE: &str = "labrig.yaml";

/// Environment variable that overrides the instance root.
pub const ROOT_ENV: &str = "LABRIG_ROOT";


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Socket read/write timeout for one request/reply round trip.
    pub protocol_timeout_ms: u64,
    /// Upper bound on one accept-with-timeout wait. Each expiry is an idle tick.
    pub accept_poll_ms: u64,
    /// Worker agent polling interval for the child process and its logs.
    pub kid_poll_ms: u64,
    /// Client attempts per query when the server refuses the connection.
    pub query_trials: u32,
    /// Sleep between refused attempts.
    pub refused_backoff_ms: u64,
    /// How long `stop()` waits for a signalled daemon to clean up after itself.
    pub stop_grace_ms: u64,
    /// How long `start()` waits for a detached daemon to publish its port record.
    pub start_timeout_ms: u64,
    /// Shell prefix run before any command on a batch-scheduler node.
    pub scheduler_prelude: String,
    /// Directory holding the `labrig` binary on remote nodes, prepended to PATH.
    pub remote_runtime_dir: Option<String>,
}


impl Default for Settings {
    fn default() -> Self {
        Settings {
            protocol_timeout_ms: 2_000,
            accept_poll_ms: 500,
            kid_poll_ms: 1_000,
            query_trials: 4,
            refused_backoff_ms: 250,
            stop_grace_ms: 3_000,
            start_timeout_ms: 5_000,
            scheduler_prelude: "module load slurm".into(),
            remote_runtime_dir: None,
        }
    }
}


impl Settings {
    /// Load settings from `<root>/labrig.yaml`, falling back to defaults
    /// when the file does not exist.
    pub fn load(root: &Path) -> Result<Settings, String> {
        let path = root.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Settings::parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    /// Parse settings from YAML text. An empty document yields defaults.
    pub fn parse(content: &str) -> Result<Settings, String> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(content).map_err(|e| format!("invalid settings: {}", e))
    }

    /// Write settings to `<root>/labrig.yaml`.
    pub fn save(&self, root: &Path) -> Result<(), String> {
        let path = root.join(SETTINGS_FILE);
        let content = serde_yaml::to_string(self)
            .map_err(|e| format!("cannot serialize settings: {}", e))?;
        std::fs::write(&path, content)
            .map_err(|e| format!("cannot write {}: {}", path.display(), e))
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_millis(self.protocol_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn kid_poll(&self) -> Duration {
        Duration::from_millis(self.kid_poll_ms)
    }

    pub fn refused_backoff(&self) -> Duration {
        Duration::from_millis(self.refused_backoff_ms)
    }
}


/// Resolve the instance root: explicit flag, then `LABRIG_ROOT`, then
/// `$HOME/.labrig`.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var(ROOT_ENV) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".labrig")
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
