//! Stress workloads run in series, each joined to its target's cgroup.
//!
//! Cgroup trees are laid out under a scratch directory, so no privileges
//! are needed; the workloads are real `sleep` processes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fray_common::fault::{StressKind, StressSpec};
use fray_common::{FaultError, LifecycleState, Phase, Target};
use fray_helper::abort::AbortNotifier;
use fray_helper::cgroup::CgroupManager;
use fray_helper::controller::{Controller, ControllerConfig, ExecutionMode};
use fray_helper::injector::StressInjector;
use fray_helper::locator::{Resolve, ResolvedTarget};
use fray_helper::reporter::{Annotation, ResultReporter};
use fray_netns::test_util::scratch_dir;

struct ScratchLocator {
    root: PathBuf,
}

impl Resolve for ScratchLocator {
    async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, FaultError> {
        Ok(ResolvedTarget {
            target: target.clone(),
            container_id: format!("cid-{}", target.pod),
            pid: std::process::id(),
            sandbox_pid: None,
            cgroup: CgroupManager::V2 {
                root: self.root.clone(),
                group: format!("/kubepods/{}", target.pod),
            },
            netns_path: PathBuf::from("/proc/self/ns/net"),
        })
    }
}

/// At each checkpoint, records which workload PIDs sit in the target's cgroup.
#[derive(Clone)]
struct MembershipReporter {
    root: PathBuf,
    seen: Arc<Mutex<Vec<(String, Phase, Vec<u32>)>>>,
}

fn members(root: &Path, pod: &str) -> Vec<u32> {
    std::fs::read_to_string(root.join("kubepods").join(pod).join("cgroup.procs"))
        .unwrap_or_default()
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect()
}

fn alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

impl ResultReporter for MembershipReporter {
    async fn annotate(&self, annotation: &Annotation) -> Result<(), FaultError> {
        let pids = members(&self.root, &annotation.target_name);
        self.seen
            .lock()
            .unwrap()
            .push((annotation.target_name.clone(), annotation.phase, pids));
        Ok(())
    }
}

#[tokio::test]
async fn serial_cpu_stress_joins_each_target_cgroup() {
    let root = scratch_dir("stress_cg").unwrap();
    let pods = ["web-0", "web-1", "web-2"];
    for pod in pods {
        let dir = root.join("kubepods").join(pod);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("cgroup.procs"), "").unwrap();
    }

    let spec = StressSpec {
        kind: StressKind::Cpu,
        workers: 2,
        intensity: 100,
        volume_path: None,
    };
    let duration = Duration::from_millis(500);
    // stand-in for the stressor so the test needs no stress-ng
    let injector =
        StressInjector::new(spec, duration).with_command(vec!["sleep".into(), "30".into()]);

    let reporter = MembershipReporter {
        root: root.clone(),
        seen: Arc::default(),
    };
    let mut cfg = ControllerConfig::new(duration);
    cfg.mode = ExecutionMode::Serial;
    cfg.retry.backoff = Duration::from_millis(50);

    let controller = Controller::new(
        ScratchLocator { root: root.clone() },
        injector,
        reporter.clone(),
        cfg,
        AbortNotifier::never(),
    );
    let targets: Vec<Target> = pods.iter().map(|p| Target::new("shop", *p, "app")).collect();
    let report = controller.run(&targets).await;

    assert_eq!(report.exit_code(), 0, "{report:?}");
    assert!(
        report
            .episodes
            .iter()
            .all(|e| e.state == LifecycleState::Reverted)
    );

    let seen = reporter.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 6);
    let mut previous: Option<u32> = None;
    for (i, pod) in pods.iter().enumerate() {
        let (name, phase, pids) = &seen[i * 2];
        assert_eq!(name, pod);
        assert_eq!(*phase, Phase::Injected);
        // exactly one workload, billed to this target only
        assert_eq!(pids.len(), 1, "{pod}: {pids:?}");
        let pid = pids[0];
        for other in pods.iter().filter(|p| *p != pod) {
            assert!(!members(&root, other).contains(&pid));
        }
        // the prior target's workload is gone before this one started
        if let Some(prev) = previous {
            assert!(!alive(prev), "workload {prev} outlived its episode");
        }
        previous = Some(pid);

        let (_, phase, _) = &seen[i * 2 + 1];
        assert_eq!(*phase, Phase::Reverted);
    }
    for (_, _, pids) in &seen {
        for pid in pids {
            assert!(!alive(*pid), "workload {pid} still running after the run");
        }
    }

    std::fs::remove_dir_all(root).unwrap();
}

#[tokio::test]
async fn missing_cgroup_fails_without_leaking_a_workload() {
    let root = scratch_dir("stress_nocg").unwrap();
    let spec = StressSpec {
        kind: StressKind::Memory,
        workers: 1,
        intensity: 64,
        volume_path: None,
    };
    let injector = StressInjector::new(spec, Duration::from_secs(1))
        .with_command(vec!["sleep".into(), "30".into()]);
    let mut cfg = ControllerConfig::new(Duration::from_secs(1));
    cfg.mode = ExecutionMode::Serial;
    cfg.retry.backoff = Duration::from_millis(10);

    let reporter = MembershipReporter {
        root: root.clone(),
        seen: Arc::default(),
    };
    let controller = Controller::new(
        ScratchLocator { root: root.clone() },
        injector,
        reporter.clone(),
        cfg,
        AbortNotifier::never(),
    );
    let report = controller.run(&[Target::new("shop", "ghost", "app")]).await;

    let ep = &report.episodes[0];
    assert_eq!(ep.state, LifecycleState::Failed);
    assert!(ep.error.as_deref().unwrap().contains("cgroup"));
    assert!(reporter.seen.lock().unwrap().is_empty());
    assert_eq!(report.exit_code(), 1);

    std::fs::remove_dir_all(root).unwrap();
}
