//! Command runner abstraction for executing local programs.
//!
//! `CommandRunner` is the seam remote execution goes through. `ShellRunner`
//! spawns the program for real; `MockRunner` records calls and returns
//! preset outputs.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;

/// Captured result of one program run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

pub trait CommandRunner: Send {
    /// Run `program args...`, feeding `stdin` if given, and wait for it.
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> std::io::Result<ExecOutput>;
}

/// Production runner.
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> std::io::Result<ExecOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(payload.as_bytes())?;
            // Dropping the pipe closes it so the program sees EOF.
        }

        let output = child.wait_with_output()?;
        Ok(ExecOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// One call seen by a `MockRunner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

/// Test double that records calls and returns pre-configured outputs in
/// order. Once they run out, every call succeeds with empty output.
#[derive(Default)]
pub struct MockRunner {
    responses: Mutex<Vec<ExecOutput>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRunner {
    pub fn new() -> MockRunner {
        MockRunner::default()
    }

    pub fn with_responses(responses: Vec<ExecOutput>) -> MockRunner {
        let mut reversed = responses;
        reversed.reverse();
        MockRunner {
            responses: Mutex::new(reversed),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> std::io::Result<ExecOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
                stdin: stdin.map(str::to_string),
            });
        }
        let next = self.responses.lock().ok().and_then(|mut r| r.pop());
        Ok(next.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_runner_captures_output_and_code() {
        let out = ShellRunner
            .run("sh", &["-c".into(), "echo out; echo err >&2; exit 3".into()], None)
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[test]
    fn shell_runner_feeds_stdin() {
        let out = ShellRunner.run("cat", &[], Some("payload")).unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout, "payload");
    }

    #[test]
    fn shell_runner_missing_program_is_io_error() {
        assert!(ShellRunner.run("/nonexistent/labrig-test", &[], None).is_err());
    }

    #[test]
    fn mock_runner_records_and_replays_in_order() {
        let runner = MockRunner::with_responses(vec![ExecOutput::ok("first"), ExecOutput::failed(2, "nope")]);
        assert_eq!(runner.run("ssh", &["a".into()], None).unwrap().stdout, "first");
        assert_eq!(runner.run("ssh", &["b".into()], Some("in")).unwrap().code, 2);
        assert_eq!(runner.run("ssh", &[], None).unwrap(), ExecOutput::default());

        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].args, vec!["b".to_string()]);
        assert_eq!(calls[1].stdin.as_deref(), Some("in"));
    }
}
