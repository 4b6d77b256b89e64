//! Disk fill: write a file of the requested size into the target's rootfs.
//!
//! The file is reached through `/proc/<pid>/root`, so `dd` runs on the host
//! but the bytes land on the container's filesystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fray_common::fault::DiskFillSpec;
use fray_common::{FaultError, Target};
use fray_netns::runner::{self, CommandRunner};

use crate::compose::{self, DISK_FILL_FILE};
use crate::injector::{InjectionHandle, Injector};
use crate::locator::ResolvedTarget;

/// `dd` of a few GiB from urandom takes a while.
pub const FILL_TIMEOUT: Duration = Duration::from_secs(600);

pub struct DiskFillInjector<R> {
    runner: R,
    spec: DiskFillSpec,
    proc_root: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub struct DiskFillHandle {
    target: Target,
    file: PathBuf,
    created: bool,
}

impl DiskFillHandle {
    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl InjectionHandle for DiskFillHandle {
    fn target(&self) -> &Target {
        &self.target
    }
}

impl<R: CommandRunner> DiskFillInjector<R> {
    pub fn new(runner: R, spec: DiskFillSpec) -> Self {
        Self {
            runner,
            spec,
            proc_root: PathBuf::from("/proc"),
            timeout: FILL_TIMEOUT,
        }
    }

    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }
}

impl<R: CommandRunner> Injector for DiskFillInjector<R> {
    type Handle = DiskFillHandle;

    fn prepare(&self, target: &ResolvedTarget) -> Result<DiskFillHandle, FaultError> {
        if self.spec.mebibytes == 0 {
            return Err(FaultError::InvalidConfig("disk fill size must be positive".into()));
        }
        let relative = self.spec.path.trim_start_matches('/');
        let file = self
            .proc_root
            .join(target.pid.to_string())
            .join("root")
            .join(relative)
            .join(DISK_FILL_FILE);
        Ok(DiskFillHandle {
            target: target.target.clone(),
            file,
            created: false,
        })
    }

    async fn inject(&self, handle: &mut DiskFillHandle) -> Result<(), FaultError> {
        let path = handle.file.to_string_lossy().into_owned();
        let args = compose::disk_fill_args(&self.spec, &path);
        handle.created = true;
        runner::run_checked(&self.runner, "dd", &args, self.timeout)
            .await
            .map_err(|e| FaultError::RuleApplyFailed {
                rule: format!("fill {path}"),
                reason: e.to_string(),
            })?;
        tracing::info!(
            target = %handle.target,
            file = %path,
            mebibytes = self.spec.mebibytes,
            "disk filled"
        );
        Ok(())
    }

    async fn revert(&self, handle: &mut DiskFillHandle) -> Result<(), FaultError> {
        if !handle.created {
            return Ok(());
        }
        match tokio::fs::remove_file(&handle.file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(target = %handle.target, file = %handle.file.display(), "fill file already gone");
            }
            Err(e) => {
                return Err(FaultError::RuleRemoveFailed {
                    rule: format!("fill {}", handle.file.display()),
                    reason: e.to_string(),
                });
            }
        }
        handle.created = false;
        Ok(())
    }
}
