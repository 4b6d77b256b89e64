//! Target Locator: logical `{namespace, pod, container}` to OS handles.
//!
//! Resolution asks the runtime for the container ID and root PID, then
//! reads procfs to pick the cgroup flavour and path. It has no side effects.

pub mod inspect;

use std::future::Future;
use std::path::PathBuf;

use fray_common::{FaultError, Target};

use crate::cgroup::CgroupManager;
use inspect::RuntimeInspector;

/// A target with its OS-level handles. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target: Target,
    pub container_id: String,
    /// Root process of the container.
    pub pid: u32,
    /// Process owning the pod network namespace, when distinct from `pid`.
    pub sandbox_pid: Option<u32>,
    pub cgroup: CgroupManager,
    pub netns_path: PathBuf,
}

impl ResolvedTarget {
    /// PID to enter for network namespace operations.
    pub fn netns_pid(&self) -> u32 {
        self.sandbox_pid.unwrap_or(self.pid)
    }
}

pub trait Resolve: Send + Sync {
    fn resolve(
        &self,
        target: &Target,
    ) -> impl Future<Output = Result<ResolvedTarget, FaultError>> + Send;
}

/// Runtime-backed [`Resolve`] implementation.
#[derive(Debug, Clone)]
pub struct Locator<I> {
    inspector: I,
    proc_root: PathBuf,
    cgroup_root: PathBuf,
}

impl<I: RuntimeInspector> Locator<I> {
    pub fn new(inspector: I) -> Self {
        Self {
            inspector,
            proc_root: PathBuf::from("/proc"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }

    pub fn with_roots(
        mut self,
        proc_root: impl Into<PathBuf>,
        cgroup_root: impl Into<PathBuf>,
    ) -> Self {
        self.proc_root = proc_root.into();
        self.cgroup_root = cgroup_root.into();
        self
    }

    pub fn inspector(&self) -> &I {
        &self.inspector
    }
}

impl<I: RuntimeInspector> Resolve for Locator<I> {
    async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, FaultError> {
        let container_id = self.inspector.container_id(target).await?;
        let info = self.inspector.inspect(&container_id).await?;
        let cgroup =
            CgroupManager::detect(&self.proc_root, &self.cgroup_root, info.pid, &container_id)
                .await?;
        let netns_pid = info.sandbox_pid.unwrap_or(info.pid);
        let resolved = ResolvedTarget {
            target: target.clone(),
            netns_path: self
                .proc_root
                .join(netns_pid.to_string())
                .join("ns")
                .join("net"),
            container_id,
            pid: info.pid,
            sandbox_pid: info.sandbox_pid,
            cgroup,
        };
        tracing::info!(
            target = %target,
            runtime = %self.inspector.kind(),
            container_id = %resolved.container_id,
            pid = resolved.pid,
            cgroup = %resolved.cgroup.describe(),
            "target resolved"
        );
        Ok(resolved)
    }
}
