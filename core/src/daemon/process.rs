//! Process-table helpers: liveness probes, signalling, detached spawn.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use super::instance::InstanceDir;


/// What the liveness files of an instance say, checked against the
/// process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Pid record points at a live process that owns the instance name.
    Running { pid: u32 },
    /// No pid record and no port record.
    NotRunning,
    /// Liveness files exist but nothing live backs them.
    Stale { pid: Option<u32> },
}


impl Liveness {
    pub fn is_running(&self) -> bool {
        matches!(self, Liveness::Running { .. })
    }
}


/// Probe an instance. A live pid whose command line does not carry
/// `--name <instance>` is a recycled pid: its record is cleared and the instance
/// is reported stale.
pub fn probe(instance: &InstanceDir) -> Liveness {
    let pid = match instance.read_pid() {
        Some(pid) => pid,
        None if instance.has_port_record() => return Liveness::Stale { pid: None },
        None => return Liveness::NotRunning,
    };

    if !is_pid_alive(pid) {
        return Liveness::Stale { pid: Some(pid) };
    }

    if pid != std::process::id() && owns_name(pid, instance.name()) == Some(false) {
        tracing::warn!(
            instance = instance.name(),
            pid,
            "pid record points at an unrelated process, clearing it"
        );
        instance.clear_pid();
        return Liveness::Stale { pid: Some(pid) };
    }

    Liveness::Running { pid }
}


/// Check if a process with the given PID is alive.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // kill(pid, 0) checks existence without sending a signal. EPERM still
    // means the process exists.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}


/// Whether `pid` runs instance `name`, i.e. its command line carries
/// `--name <name>` or `--name=<name>`. `None` when that cannot be told:
/// no `/proc`, or an empty command line (mid-exec, zombie, kernel thread).
pub fn owns_name(pid: u32, name: &str) -> Option<bool> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    if raw.is_empty() {
        return None;
    }
    let args: Vec<String> = raw
        .split(|&b| b == 0)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    Some(names_instance(&args, name))
}


fn names_instance(args: &[String], name: &str) -> bool {
    let joined = format!("--name={}", name);
    args.iter().enumerate().any(|(i, arg)| {
        *arg == joined || (arg == "--name" && args.get(i + 1).map(String::as_str) == Some(name))
    })
}


/// Send SIGTERM. Returns false if the process could not be signalled.
pub fn terminate(pid: u32) -> bool {
    send_signal(pid, libc::SIGTERM)
}


/// Send SIGKILL.
pub fn force_kill(pid: u32) -> bool {
    send_signal(pid, libc::SIGKILL)
}


/// Send SIGTERM to every process in the group led by `pgid`.
pub fn terminate_group(pgid: u32) -> bool {
    signal_group(pgid, libc::SIGTERM)
}


/// Send SIGKILL to every process in the group led by `pgid`.
pub fn kill_group(pgid: u32) -> bool {
    signal_group(pgid, libc::SIGKILL)
}


fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    if pgid == 0 || pgid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(-(pgid as libc::pid_t), signal) == 0 }
}


fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}


/// Poll until `pid` is gone or `timeout` elapses. Returns true if it exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}


// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

/// Program and arguments that run an instance's loop in the foreground.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub program: PathBuf,
    pub args: Vec<String>,
}


impl Entrypoint {
    /// `<current-exe> <role> run --name <name> --root <root> [extra...]`.
    pub fn current(role: &str, instance: &InstanceDir, extra: &[String]) -> Result<Entrypoint, std::io::Error> {
        let program = std::env::current_exe()?;
        let mut args = vec![
            "--root".to_string(),
            instance.root().display().to_string(),
            role.to_string(),
            "run".to_string(),
            "--name".to_string(),
            instance.name().to_string(),
        ];
        args.extend(extra.iter().cloned());
        Ok(Entrypoint { program, args })
    }
}


/// Spawn the entrypoint detached from the caller: its own process group,
/// stdout/stderr appended to the instance capture files, stdin from the stdin
/// payload if one exists (otherwise /dev/null).
pub fn spawn_detached(entry: &Entrypoint, instance: &InstanceDir) -> std::io::Result<Child> {
    use std::os::unix::process::CommandExt;

    let stdout = append(&instance.stdout_path())?;
    let stderr = append(&instance.stderr_path())?;
    let stdin = open_stdin(&instance.stdin_path())?;

    let mut cmd = Command::new(&entry.program);
    cmd.args(&entry.args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);
    cmd.spawn()
}


fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}


fn open_stdin(path: &Path) -> std::io::Result<Stdio> {
    if path.exists() {
        Ok(Stdio::from(File::open(path)?))
    } else {
        Ok(Stdio::null())
    }
}


/// A shell that stays alive for a few seconds with `--name <name>` on its
/// command line. Returns once `/proc` shows that command line.
#[cfg(test)]
pub(crate) fn spawn_name_owner(name: &str) -> Child {
    let child = Command::new("sh")
        .args(["-c", "sleep 5; :", "--name", name])
        .spawn()
        .expect("spawn sh");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while owns_name(child.id(), name) != Some(true) {
        assert!(std::time::Instant::now() < deadline, "cmdline of {} never settled", child.id());
        std::thread::sleep(Duration::from_millis(5));
    }
    child
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_root() -> PathBuf {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("lrp{}-{}", std::process::id(), seq));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn is_pid_alive_returns_true_for_self() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn is_pid_alive_returns_false_for_nonexistent() {
        assert!(!is_pid_alive(4_000_000));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn probe_without_records_is_not_running() {
        let root = test_root();
        let inst = InstanceDir::new(&root, "mum");
        assert_eq!(probe(&inst), Liveness::NotRunning);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_dead_pid_is_stale() {
        let root = test_root();
        let inst = InstanceDir::new(&root, "mum");
        inst.ensure().unwrap();
        inst.write_pid(4_000_000).unwrap();
        assert_eq!(probe(&inst), Liveness::Stale { pid: Some(4_000_000) });
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_port_without_pid_is_stale() {
        let root = test_root();
        let inst = InstanceDir::new(&root, "mum");
        inst.ensure().unwrap();
        inst.write_port(40000).unwrap();
        assert_eq!(probe(&inst), Liveness::Stale { pid: None });
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_own_pid_is_running() {
        let root = test_root();
        let inst = InstanceDir::new(&root, "mum");
        inst.ensure().unwrap();
        inst.write_pid(std::process::id()).unwrap();
        assert!(probe(&inst).is_running());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_recycled_pid_clears_record() {
        if !Path::new("/proc/self/cmdline").exists() {
            return;
        }
        let root = test_root();
        let inst = InstanceDir::new(&root, "kid-nobody-has-this-name");
        inst.ensure().unwrap();

        let mut other = Command::new("sleep").arg("5").spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while owns_name(other.id(), inst.name()).is_none() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        inst.write_pid(other.id()).unwrap();

        assert_eq!(probe(&inst), Liveness::Stale { pid: Some(other.id()) });
        assert_eq!(inst.read_pid(), None);

        let _ = other.kill();
        let _ = other.wait();
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn probe_matching_cmdline_is_running() {
        if !Path::new("/proc/self/cmdline").exists() {
            return;
        }
        let root = test_root();
        let inst = InstanceDir::new(&root, "kid-owned");
        inst.ensure().unwrap();

        let mut owner = spawn_name_owner("kid-owned");
        inst.write_pid(owner.id()).unwrap();
        assert_eq!(probe(&inst), Liveness::Running { pid: owner.id() });

        assert!(terminate(owner.id()));
        let _ = owner.wait();
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn name_must_match_whole_argument() {
        let args: Vec<String> = ["labrig", "--root", "/srv/lr", "kid", "run", "--name", "kid-e10"]
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert!(names_instance(&args, "kid-e10"));
        assert!(!names_instance(&args, "kid-e1"));
        assert!(!names_instance(&args, "kid"));

        let joined = vec!["labrig".to_string(), "--name=mum".to_string()];
        assert!(names_instance(&joined, "mum"));
        assert!(!names_instance(&joined, "mu"));

        let trailing = vec!["labrig".to_string(), "--name".to_string()];
        assert!(!names_instance(&trailing, "mum"));
    }

    #[test]
    fn prefix_name_does_not_claim_longer_instance() {
        if !Path::new("/proc/self/cmdline").exists() {
            return;
        }
        let root = test_root();
        let inst = InstanceDir::new(&root, "kid-e1");
        inst.ensure().unwrap();

        let mut other = spawn_name_owner("kid-e10");
        inst.write_pid(other.id()).unwrap();
        assert_eq!(probe(&inst), Liveness::Stale { pid: Some(other.id()) });
        assert_eq!(inst.read_pid(), None);

        let _ = other.kill();
        let _ = other.wait();
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn empty_cmdline_is_undecided() {
        if !Path::new("/proc/self/cmdline").exists() {
            return;
        }
        // An unreaped child is a zombie, and zombies have no command line.
        let mut zombie = Command::new("true").spawn().unwrap();
        let stat = format!("/proc/{}/stat", zombie.id());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let state = std::fs::read_to_string(&stat).unwrap_or_default();
            let state = state.rsplit(") ").next().unwrap_or("").chars().next();
            if state == Some('Z') {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "child never became a zombie");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(owns_name(zombie.id(), "kid-e1"), None);

        let root = test_root();
        let inst = InstanceDir::new(&root, "kid-e1");
        inst.ensure().unwrap();
        inst.write_pid(zombie.id()).unwrap();
        assert_eq!(probe(&inst), Liveness::Running { pid: zombie.id() });
        assert_eq!(inst.read_pid(), Some(zombie.id()));

        let _ = zombie.wait();
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn entrypoint_passes_root_and_name() {
        let inst = InstanceDir::new(Path::new("/srv/lr"), "kid-e1");
        let entry = Entrypoint::current("kid", &inst, &["--verbose".into()]).unwrap();
        assert_eq!(
            entry.args,
            vec!["--root", "/srv/lr", "kid", "run", "--name", "kid-e1", "--verbose"]
        );
    }
}
