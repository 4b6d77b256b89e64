//! Cgroup membership for injected workloads.
//!
//! The hierarchy flavour is detected once, when a target is resolved, and
//! carried as a [`CgroupManager`] variant from then on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fray_common::FaultError;
use tokio::io::AsyncWriteExt;

use crate::procfs::{self, V1_SUBSYSTEMS};

/// Default bound on a cgroup join.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a target container's processes are accounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupManager {
    /// Per-subsystem hierarchies; `path` is the container's path inside
    /// each `<root>/<subsystem>` mount.
    V1 { root: PathBuf, path: String },
    /// One unified hierarchy; `group` is the path under `root`.
    V2 { root: PathBuf, group: String },
}

impl CgroupManager {
    /// Detect the hierarchy for `pid`, the root process of `container_id`.
    ///
    /// v2 is chosen when `<cgroup_root>/cgroup.controllers` exists. For v1,
    /// `/proc/<pid>/cgroup` is cross-referenced with `/proc/<pid>/mountinfo`
    /// and the first subsystem path naming the container is used.
    pub async fn detect(
        proc_root: &Path,
        cgroup_root: &Path,
        pid: u32,
        container_id: &str,
    ) -> Result<Self, FaultError> {
        let join_err = |reason: String| FaultError::CgroupJoinFailed { pid, reason };
        let proc_dir = proc_root.join(pid.to_string());
        let cgroup_file = tokio::fs::read_to_string(proc_dir.join("cgroup"))
            .await
            .map_err(|e| join_err(format!("read cgroup file: {e}")))?;

        if tokio::fs::try_exists(cgroup_root.join("cgroup.controllers"))
            .await
            .unwrap_or(false)
        {
            let group = procfs::unified_path(&cgroup_file).map_err(|e| join_err(e.to_string()))?;
            return Ok(CgroupManager::V2 {
                root: cgroup_root.to_path_buf(),
                group,
            });
        }

        let paths = procfs::parse_cgroup_file(&cgroup_file).map_err(|e| join_err(e.to_string()))?;
        let mountinfo = tokio::fs::read_to_string(proc_dir.join("mountinfo"))
            .await
            .map_err(|e| join_err(format!("read mountinfo: {e}")))?;
        let rebased = procfs::rebase_on_mounts(&paths, &mountinfo);
        let path = procfs::find_container_path(&rebased, container_id).ok_or_else(|| {
            join_err(format!(
                "no subsystem path contains container id {container_id}"
            ))
        })?;
        Ok(CgroupManager::V1 {
            root: cgroup_root.to_path_buf(),
            path,
        })
    }

    /// Human-readable location for logs.
    pub fn describe(&self) -> String {
        match self {
            CgroupManager::V1 { path, .. } => format!("v1:{path}"),
            CgroupManager::V2 { group, .. } => format!("v2:{group}"),
        }
    }

    /// `cgroup.procs` files a process must be written into.
    pub fn procs_files(&self) -> Vec<PathBuf> {
        match self {
            CgroupManager::V1 { root, path } => V1_SUBSYSTEMS
                .iter()
                .map(|s| join_under(&root.join(s), path).join("cgroup.procs"))
                .collect(),
            CgroupManager::V2 { root, group } => vec![join_under(root, group).join("cgroup.procs")],
        }
    }

    /// Move `pid` into this cgroup, bounded by `timeout`.
    ///
    /// For v1 every subsystem hierarchy that has the container's directory
    /// is joined; at least one must succeed.
    pub async fn join(&self, pid: u32, timeout: Duration) -> Result<(), FaultError> {
        match tokio::time::timeout(timeout, self.join_inner(pid)).await {
            Ok(result) => result,
            Err(_) => Err(FaultError::CgroupJoinFailed {
                pid,
                reason: format!("timed out after {timeout:?}"),
            }),
        }
    }

    async fn join_inner(&self, pid: u32) -> Result<(), FaultError> {
        let mut joined = 0usize;
        let mut last_error = None;
        for file in self.procs_files() {
            let Some(dir) = file.parent() else { continue };
            if matches!(self, CgroupManager::V1 { .. })
                && !tokio::fs::try_exists(dir).await.unwrap_or(false)
            {
                continue;
            }
            match write_pid(&file, pid).await {
                Ok(()) => {
                    tracing::debug!(pid, file = %file.display(), "joined cgroup");
                    joined += 1;
                }
                Err(e) => {
                    tracing::debug!(pid, file = %file.display(), error = %e, "cgroup write failed");
                    last_error = Some(format!("{}: {e}", file.display()));
                }
            }
        }
        if joined == 0 {
            return Err(FaultError::CgroupJoinFailed {
                pid,
                reason: last_error
                    .unwrap_or_else(|| format!("no hierarchy has {}", self.describe())),
            });
        }
        Ok(())
    }
}

/// `base` joined with an absolute cgroup path.
fn join_under(base: &Path, path: &str) -> PathBuf {
    base.join(path.trim_start_matches('/'))
}

async fn write_pid(file: &Path, pid: u32) -> std::io::Result<()> {
    let mut f = tokio::fs::OpenOptions::new()
        .write(true)
        .append(true)
        .open(file)
        .await?;
    f.write_all(format!("{pid}\n").as_bytes()).await?;
    f.flush().await
}
