//! Process kill through the container runtime.
//!
//! Nothing is left to revert. With a hold interval the kill repeats on
//! every pulse against whichever container currently backs the target.

use fray_common::fault::KillSpec;
use fray_common::{FaultError, RuntimeKind, Target};

use crate::injector::{InjectionHandle, Injector};
use crate::locator::ResolvedTarget;
use crate::locator::inspect::RuntimeInspector;

pub struct ProcessKillInjector<I> {
    inspector: I,
    spec: KillSpec,
}

#[derive(Debug)]
pub struct KillHandle {
    target: Target,
    container_id: String,
    kills: u32,
}

impl KillHandle {
    pub fn kills(&self) -> u32 {
        self.kills
    }
}

impl InjectionHandle for KillHandle {
    fn target(&self) -> &Target {
        &self.target
    }
}

impl<I: RuntimeInspector> ProcessKillInjector<I> {
    pub fn new(inspector: I, spec: KillSpec) -> Self {
        Self { inspector, spec }
    }

    async fn kill(&self, handle: &mut KillHandle) -> Result<(), FaultError> {
        self.inspector
            .kill(&handle.container_id, &self.spec.signal)
            .await?;
        handle.kills += 1;
        tracing::info!(
            target = %handle.target,
            container_id = %handle.container_id,
            signal = %self.spec.signal,
            "container signalled"
        );
        Ok(())
    }
}

impl<I: RuntimeInspector> Injector for ProcessKillInjector<I> {
    type Handle = KillHandle;

    fn prepare(&self, target: &ResolvedTarget) -> Result<KillHandle, FaultError> {
        let kind = self.inspector.kind();
        if kind != RuntimeKind::Docker && !matches!(self.spec.signal.as_str(), "SIGKILL" | "SIGTERM")
        {
            return Err(FaultError::InvalidConfig(format!(
                "unsupported signal {} for {kind}, use either SIGTERM or SIGKILL",
                self.spec.signal
            )));
        }
        Ok(KillHandle {
            target: target.target.clone(),
            container_id: target.container_id.clone(),
            kills: 0,
        })
    }

    async fn inject(&self, handle: &mut KillHandle) -> Result<(), FaultError> {
        self.kill(handle).await
    }

    async fn revert(&self, _handle: &mut KillHandle) -> Result<(), FaultError> {
        Ok(())
    }

    async fn pulse(&self, handle: &mut KillHandle) -> Result<(), FaultError> {
        match self.inspector.container_id(&handle.target).await {
            Ok(id) => handle.container_id = id,
            Err(e) => {
                // restarting; try again next interval
                tracing::warn!(target = %handle.target, error = %e, "no running container to kill");
                return Ok(());
            }
        }
        self.kill(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupManager;
    use crate::locator::inspect::AnyInspector;
    use fray_netns::runner::{CommandOutput, RecordingRunner};
    use std::path::PathBuf;

    fn resolved(container_id: &str) -> ResolvedTarget {
        ResolvedTarget {
            target: Target::new("shop", "db-0", "postgres"),
            container_id: container_id.into(),
            pid: 10,
            sandbox_pid: None,
            cgroup: CgroupManager::V2 {
                root: PathBuf::from("/sys/fs/cgroup"),
                group: "/x".into(),
            },
            netns_path: PathBuf::from("/proc/10/ns/net"),
        }
    }

    fn kill(signal: &str) -> KillSpec {
        KillSpec {
            signal: signal.into(),
        }
    }

    #[tokio::test]
    async fn docker_kill_passes_the_signal() {
        let runner = RecordingRunner::new();
        let inspector = AnyInspector::for_runtime(RuntimeKind::Docker, runner.clone(), "/run/docker.sock");
        let inj = ProcessKillInjector::new(inspector, kill("SIGUSR1"));
        let mut h = inj.prepare(&resolved("d0c")).unwrap();
        inj.inject(&mut h).await.unwrap();
        assert_eq!(
            runner.lines(),
            vec!["docker --host unix:///run/docker.sock kill --signal SIGUSR1 d0c"]
        );
        inj.revert(&mut h).await.unwrap();
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn cri_sigkill_stops_without_grace() {
        let runner = RecordingRunner::new();
        let inspector = AnyInspector::for_runtime(
            RuntimeKind::Containerd,
            runner.clone(),
            "/run/containerd/containerd.sock",
        );
        let inj = ProcessKillInjector::new(inspector, kill("SIGKILL"));
        let mut h = inj.prepare(&resolved("abc")).unwrap();
        inj.inject(&mut h).await.unwrap();
        assert_eq!(runner.count("stop --timeout=0 abc"), 1);
    }

    #[test]
    fn cri_rejects_other_signals_before_touching_anything() {
        let runner = RecordingRunner::new();
        let inspector =
            AnyInspector::for_runtime(RuntimeKind::Crio, runner.clone(), "/run/crio/crio.sock");
        let inj = ProcessKillInjector::new(inspector, kill("SIGHUP"));
        let err = inj.prepare(&resolved("abc")).unwrap_err();
        assert!(matches!(err, FaultError::InvalidConfig(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn pulse_kills_the_replacement_container() {
        let runner = RecordingRunner::new();
        runner.respond("ps -q", CommandOutput::ok("second\n"));
        let inspector = AnyInspector::for_runtime(RuntimeKind::Docker, runner.clone(), "/run/docker.sock");
        let inj = ProcessKillInjector::new(inspector, kill("SIGKILL"));
        let mut h = inj.prepare(&resolved("first")).unwrap();
        inj.inject(&mut h).await.unwrap();
        inj.pulse(&mut h).await.unwrap();
        assert_eq!(h.kills(), 2);
        assert_eq!(runner.count("kill --signal SIGKILL first"), 1);
        assert_eq!(runner.count("kill --signal SIGKILL second"), 1);
    }

    #[tokio::test]
    async fn pulse_tolerates_a_restarting_target() {
        let runner = RecordingRunner::new();
        runner.respond("ps -q", CommandOutput::ok(""));
        let inspector = AnyInspector::for_runtime(RuntimeKind::Docker, runner.clone(), "/run/docker.sock");
        let inj = ProcessKillInjector::new(inspector, kill("SIGKILL"));
        let mut h = inj.prepare(&resolved("first")).unwrap();
        inj.pulse(&mut h).await.unwrap();
        assert_eq!(h.kills(), 0);
    }
}
