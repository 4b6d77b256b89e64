//! Fault workloads run inside a target's cgroup.
//!
//! A workload is spawned **stopped** in its own process group, moved into
//! the target cgroup, and only then resumed with `SIGCONT`, so none of its
//! resource use is billed to the helper's own cgroup. Termination kills the
//! whole process group.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use fray_common::FaultError;
use tokio::process::{Child, Command};

use crate::cgroup::CgroupManager;
use crate::procfs;

/// `argv[0]` of the stop-then-exec shell wrapper, as seen in `ps`.
const WRAPPER_NAME: &str = "fray-workload";

/// How long to wait for a reaped child after `SIGKILL`.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running (or exited but not yet reaped) workload.
#[derive(Debug)]
pub struct Workload {
    child: Child,
    pid: u32,
    exited: bool,
}

/// Knobs for [`Workload::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub proc_root: PathBuf,
    /// Bound on waiting for the stop and on the cgroup join.
    pub join_timeout: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            join_timeout: crate::cgroup::JOIN_TIMEOUT,
        }
    }
}

impl Workload {
    /// Spawn `argv` stopped, join it to `cgroup`, then resume it.
    ///
    /// If the join or resume fails the process group is killed before the
    /// error is returned, so no half-started workload is left behind.
    pub async fn start(
        argv: &[String],
        cgroup: &CgroupManager,
        opts: &StartOptions,
    ) -> Result<Self, FaultError> {
        let mut workload = Self::spawn_stopped(argv)?;
        if let Err(e) = workload.attach_and_resume(cgroup, opts).await {
            if let Err(kill_err) = workload.stop().await {
                tracing::warn!(pid = workload.pid, error = %kill_err, "cleanup of unjoined workload failed");
            }
            return Err(e);
        }
        Ok(workload)
    }

    /// Spawn `argv` behind a shell that stops itself before exec'ing it.
    ///
    /// The child leads a new process group so the whole tree can be
    /// signalled at once.
    pub fn spawn_stopped(argv: &[String]) -> Result<Self, FaultError> {
        if argv.is_empty() {
            return Err(FaultError::ProcessSpawnFailed("empty command".into()));
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("kill -STOP $$ && exec \"$@\"")
            .arg(WRAPPER_NAME)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        tracing::info!(cmd = ?argv, "spawning stopped workload");
        let child = cmd
            .spawn()
            .map_err(|e| FaultError::ProcessSpawnFailed(format!("{}: {e}", argv[0])))?;
        let pid = child
            .id()
            .ok_or_else(|| FaultError::ProcessSpawnFailed("child exited before start".into()))?;
        Ok(Self {
            child,
            pid,
            exited: false,
        })
    }

    async fn attach_and_resume(
        &mut self,
        cgroup: &CgroupManager,
        opts: &StartOptions,
    ) -> Result<(), FaultError> {
        wait_until_stopped(&opts.proc_root, self.pid, opts.join_timeout).await?;
        cgroup.join(self.pid, opts.join_timeout).await?;
        tracing::info!(pid = self.pid, cgroup = %cgroup.describe(), "workload joined cgroup, resuming");
        signal_group(self.pid, libc::SIGCONT)
            .map_err(|e| FaultError::ProcessSpawnFailed(format!("resume pid {}: {e}", self.pid)))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Resolves once the workload exits on its own; yields a description
    /// of how it ended. Cancel safe.
    pub async fn wait_exit(&mut self) -> String {
        if self.exited {
            return std::future::pending().await;
        }
        let desc = match self.child.wait().await {
            Ok(status) => format!("workload exited: {status}"),
            Err(e) => format!("workload wait failed: {e}"),
        };
        self.exited = true;
        desc
    }

    /// Kill the workload's process group and reap the leader.
    ///
    /// A group that no longer exists counts as success, so calling this
    /// again is a no-op.
    pub async fn stop(&mut self) -> Result<(), FaultError> {
        match signal_group(self.pid, libc::SIGKILL) {
            Ok(()) => tracing::info!(pid = self.pid, "killed workload process group"),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                tracing::debug!(pid = self.pid, "workload process group already gone");
            }
            Err(e) => {
                return Err(FaultError::RuleRemoveFailed {
                    rule: format!("workload pgid {}", self.pid),
                    reason: e.to_string(),
                });
            }
        }
        if !self.exited {
            match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
                Ok(Ok(_)) => self.exited = true,
                Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "reaping workload failed"),
                Err(_) => tracing::warn!(pid = self.pid, "workload not reaped after SIGKILL"),
            }
        }
        Ok(())
    }
}

/// Send `signal` to the process group led by `pgid`.
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: killpg only sends a signal; an unknown group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Poll `/proc/<pid>/stat` until the process reports stopped (`T`).
async fn wait_until_stopped(proc_root: &Path, pid: u32, timeout: Duration) -> Result<(), FaultError> {
    let stat_path = proc_root.join(pid.to_string()).join("stat");
    let poll = async {
        loop {
            match tokio::fs::read_to_string(&stat_path).await {
                Ok(stat) => match procfs::stat_state(&stat) {
                    Ok('T') | Ok('t') => return Ok(()),
                    Ok('Z') | Ok('X') => {
                        return Err(FaultError::ProcessSpawnFailed(format!(
                            "pid {pid} exited before it could be joined"
                        )));
                    }
                    _ => {}
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FaultError::ProcessSpawnFailed(format!(
                        "pid {pid} vanished before it could be joined"
                    )));
                }
                Err(e) => return Err(FaultError::Io(e)),
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| FaultError::Timeout {
            operation: format!("waiting for pid {pid} to stop"),
            after: timeout,
        })?
}
