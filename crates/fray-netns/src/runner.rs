//! The command execution capability.
//!
//! Every external tool the helper drives (`tc`, `iptables`, `nsenter`,
//! `crictl`, `docker`, `toxiproxy-cli`) goes through a [`CommandRunner`].
//! Production uses [`SystemRunner`]; tests use [`RecordingRunner`] to assert
//! on the exact invocations and to script failures.

use std::future::Future;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fray_common::FaultError;

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is not an error at this level; only failing to
    /// launch the program is.
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = io::Result<CommandOutput>> + Send;

    /// Start `program` with `args` in the background and return its PID.
    ///
    /// The process outlives the call; stopping it is the caller's job.
    fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = io::Result<u32>> + Send;
}

/// Render a command line for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run a command under `timeout`, returning its output whatever the exit code.
pub async fn run_timed<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, FaultError> {
    match tokio::time::timeout(timeout, runner.run(program, args)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(FaultError::Timeout {
            operation: command_line(program, args),
            after: timeout,
        }),
    }
}

/// Like [`run_timed`], but a non-zero exit becomes [`FaultError::CommandFailed`].
pub async fn run_checked<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, FaultError> {
    let output = run_timed(runner, program, args, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(FaultError::CommandFailed {
            command: command_line(program, args),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

// ── System runner ───────────────────────────────────────────────────

/// Executes real processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        tracing::debug!(command = %command_line(program, args), "exec");
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<u32> {
        tracing::debug!(command = %command_line(program, args), "spawn");
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other(format!("{program} exited before reporting a pid")))?;
        // reap on exit so the pid disappears once the process is gone
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(pid)
    }
}

// ── Recording runner ────────────────────────────────────────────────

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

#[derive(Debug)]
struct Scripted {
    pattern: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Recording {
    calls: Vec<Invocation>,
    script: Vec<Scripted>,
    spawned: u32,
}

/// First PID handed out by [`RecordingRunner::spawn`].
pub const FIRST_SPAWNED_PID: u32 = 40000;

/// Records every invocation and answers from a script.
///
/// Unscripted commands succeed with empty output. Spawned commands are
/// recorded too and get sequential PIDs from [`FIRST_SPAWNED_PID`], unless a
/// failing response is scripted for them. A scripted response
/// applies to any command whose rendered line contains its pattern; the
/// first live match wins. Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every matching command with `output`.
    pub fn respond(&self, pattern: &str, output: CommandOutput) {
        self.lock().script.push(Scripted {
            pattern: pattern.to_string(),
            output,
            remaining: None,
        });
    }

    /// Answer the next `times` matching commands with `output`.
    pub fn respond_times(&self, pattern: &str, output: CommandOutput, times: usize) {
        self.lock().script.push(Scripted {
            pattern: pattern.to_string(),
            output,
            remaining: Some(times),
        });
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.lock().calls.clone()
    }

    /// Rendered command lines, in call order.
    pub fn lines(&self) -> Vec<String> {
        self.lock().calls.iter().map(Invocation::line).collect()
    }

    /// Number of calls whose rendered line contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(pattern)).count()
    }

    pub fn clear(&self) {
        self.lock().calls.clear();
    }
}

impl Recording {
    fn answer(&mut self, program: &str, args: &[String]) -> CommandOutput {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        };
        let line = invocation.line();
        self.calls.push(invocation);
        for scripted in self.script.iter_mut() {
            if scripted.remaining == Some(0) || !line.contains(&scripted.pattern) {
                continue;
            }
            if let Some(n) = scripted.remaining.as_mut() {
                *n -= 1;
            }
            return scripted.output.clone();
        }
        CommandOutput::ok("")
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        Ok(self.lock().answer(program, args))
    }

    async fn spawn(&self, program: &str, args: &[String]) -> io::Result<u32> {
        let mut rec = self.lock();
        let output = rec.answer(program, args);
        if !output.success() {
            return Err(io::Error::other(output.stderr));
        }
        let pid = FIRST_SPAWNED_PID + rec.spawned;
        rec.spawned += 1;
        Ok(pid)
    }
}
