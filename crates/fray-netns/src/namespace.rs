use std::time::Duration;

use fray_common::FaultError;

use crate::runner::{self, CommandOutput, CommandRunner};

/// Default bound on one namespace-entered command.
pub const NS_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs commands inside the network namespace of a target process.
///
/// The namespace is re-entered by PID (`nsenter -t <pid> -n`) on every call
/// rather than through a held file descriptor: the target container may be
/// recreated between calls, and a cached handle would silently point at the
/// old, dead namespace.
#[derive(Debug, Clone)]
pub struct NsExec<R> {
    runner: R,
    pid: u32,
    timeout: Duration,
}

impl<R: CommandRunner> NsExec<R> {
    pub fn new(runner: R, pid: u32) -> Self {
        Self {
            runner,
            pid,
            timeout: NS_EXEC_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn wrap(&self, program: &str, args: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 4);
        full.push("-t".to_string());
        full.push(self.pid.to_string());
        full.push("-n".to_string());
        full.push(program.to_string());
        full.extend(args.iter().cloned());
        full
    }

    /// Run `program args…` in the namespace; any exit code is returned.
    pub async fn exec(&self, program: &str, args: &[String]) -> Result<CommandOutput, FaultError> {
        runner::run_timed(&self.runner, "nsenter", &self.wrap(program, args), self.timeout).await
    }

    /// Run in the namespace, mapping a non-zero exit to `CommandFailed`.
    pub async fn exec_checked(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput, FaultError> {
        runner::run_checked(&self.runner, "nsenter", &self.wrap(program, args), self.timeout).await
    }

    /// Start `program args…` in the namespace without waiting for it.
    ///
    /// `nsenter` only forks when entering a PID namespace, so the returned
    /// PID is the program's own, as seen from the host.
    pub async fn spawn(&self, program: &str, args: &[String]) -> Result<u32, FaultError> {
        let wrapped = self.wrap(program, args);
        self.runner
            .spawn("nsenter", &wrapped)
            .await
            .map_err(|e| FaultError::CommandFailed {
                command: runner::command_line("nsenter", &wrapped),
                status: None,
                stderr: e.to_string(),
            })
    }
}
