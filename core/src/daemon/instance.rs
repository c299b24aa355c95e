//! Instance directory layout and liveness files.
//!
//! ```text
//! <root>/<name>/pid      process id of the run loop (text integer)
//! <root>/<name>/port     loopback port the run loop listens on (text integer)
//! <root>/<name>/stdout   captured standard output
//! <root>/<name>/stderr   captured standard error
//! <root>/<name>/stdin    launch payload (worker agents only)
//! ```
//!
//! The port record is the canonical "running" signal for clients. Records are
//! written through a temp file and a rename so a reader never sees a partial
//! number.

use std::path::{Path, PathBuf};

use crate::errors::DaemonError;


/// Paths of one named daemon instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDir {
    root: PathBuf,
    name: String,
}


impl InstanceDir {
    pub fn new(root: &Path, name: &str) -> InstanceDir {
        InstanceDir {
            root: root.to_path_buf(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir().join("pid")
    }

    pub fn port_path(&self) -> PathBuf {
        self.dir().join("port")
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir().join("stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir().join("stderr")
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.dir().join("stdin")
    }

    /// Create the instance directory if needed.
    pub fn ensure(&self) -> Result<(), DaemonError> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir).map_err(|source| DaemonError::Io { path: dir, source })
    }

    pub fn read_pid(&self) -> Option<u32> {
        read_number(&self.pid_path())
    }

    pub fn read_port(&self) -> Option<u16> {
        read_number(&self.port_path())
    }

    pub fn has_port_record(&self) -> bool {
        self.port_path().exists()
    }

    pub fn write_pid(&self, pid: u32) -> Result<(), DaemonError> {
        write_record(&self.pid_path(), &pid.to_string())
    }

    pub fn write_port(&self, port: u16) -> Result<(), DaemonError> {
        write_record(&self.port_path(), &port.to_string())
    }

    /// Drop a pid record that points at a process we no longer own.
    pub fn clear_pid(&self) {
        let _ = std::fs::remove_file(self.pid_path());
    }

    /// Write the launch payload read by a worker agent at startup.
    pub fn write_stdin(&self, payload: &str) -> Result<(), DaemonError> {
        self.ensure()?;
        let path = self.stdin_path();
        std::fs::write(&path, payload).map_err(|source| DaemonError::Io { path, source })
    }

    pub fn read_stdin(&self) -> Result<String, DaemonError> {
        let path = self.stdin_path();
        std::fs::read_to_string(&path).map_err(|source| DaemonError::Io { path, source })
    }

    /// Last `max_bytes` of the stderr capture, for startup failure reports.
    pub fn stderr_tail(&self, max_bytes: usize) -> String {
        let text = std::fs::read_to_string(self.stderr_path()).unwrap_or_default();
        let text = text.trim_end();
        if text.len() <= max_bytes {
            return text.to_string();
        }
        let mut start = text.len() - max_bytes;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..].to_string()
    }

    /// Remove liveness and output files unconditionally. The stdin payload
    /// is an input, not output, and is left in place.
    pub fn cleanup(&self) {
        for path in [
            self.port_path(),
            self.pid_path(),
            self.stdout_path(),
            self.stderr_path(),
        ] {
            let _ = std::fs::remove_file(path);
        }
    }

    /// True if any liveness file is still on disk.
    pub fn has_liveness_files(&self) -> bool {
        self.pid_path().exists() || self.port_path().exists()
    }
}


fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
}


fn write_record(path: &Path, value: &str) -> Result<(), DaemonError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, value).map_err(|source| DaemonError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| DaemonError::Io {
        path: path.to_path_buf(),
        source,
    })
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
