//! Resource stress: a `stress-ng` workload billed to the target's cgroup.

use std::time::Duration;

use fray_common::fault::StressSpec;
use fray_common::{FaultError, Target};

use crate::cgroup::CgroupManager;
use crate::compose;
use crate::injector::{InjectionHandle, Injector};
use crate::locator::ResolvedTarget;
use crate::workload::{StartOptions, Workload};

pub struct StressInjector {
    spec: StressSpec,
    duration: Duration,
    opts: StartOptions,
    /// Replaces the composed command; used to run stand-in workloads.
    command_override: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct StressHandle {
    target: Target,
    argv: Vec<String>,
    cgroup: CgroupManager,
    workload: Option<Workload>,
}

impl StressHandle {
    pub fn workload_pid(&self) -> Option<u32> {
        self.workload.as_ref().map(Workload::pid)
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl InjectionHandle for StressHandle {
    fn target(&self) -> &Target {
        &self.target
    }
}

impl StressInjector {
    pub fn new(spec: StressSpec, duration: Duration) -> Self {
        Self {
            spec,
            duration,
            opts: StartOptions::default(),
            command_override: None,
        }
    }

    pub fn with_options(mut self, opts: StartOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_command(mut self, argv: Vec<String>) -> Self {
        self.command_override = Some(argv);
        self
    }
}

impl Injector for StressInjector {
    type Handle = StressHandle;

    fn prepare(&self, target: &ResolvedTarget) -> Result<StressHandle, FaultError> {
        let argv = match &self.command_override {
            Some(argv) => argv.clone(),
            None => compose::stress_argv(&self.spec, target.pid, self.duration),
        };
        Ok(StressHandle {
            target: target.target.clone(),
            argv,
            cgroup: target.cgroup.clone(),
            workload: None,
        })
    }

    async fn inject(&self, handle: &mut StressHandle) -> Result<(), FaultError> {
        let workload = Workload::start(&handle.argv, &handle.cgroup, &self.opts).await?;
        tracing::info!(
            target = %handle.target,
            pid = workload.pid(),
            cgroup = %handle.cgroup.describe(),
            "stress workload running"
        );
        handle.workload = Some(workload);
        Ok(())
    }

    async fn revert(&self, handle: &mut StressHandle) -> Result<(), FaultError> {
        if let Some(workload) = handle.workload.as_mut() {
            workload.stop().await?;
            handle.workload = None;
        }
        Ok(())
    }

    async fn exited(&self, handle: &mut StressHandle) -> String {
        match handle.workload.as_mut() {
            Some(workload) => workload.wait_exit().await,
            None => std::future::pending().await,
        }
    }
}
