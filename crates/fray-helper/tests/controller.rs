//! Lifecycle controller behaviour with in-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use fray_common::{FaultError, LifecycleState, Phase, Target};
use fray_helper::abort::{AbortNotifier, abort_channel};
use fray_helper::cgroup::CgroupManager;
use fray_helper::controller::{Controller, ControllerConfig, ExecutionMode, HoldEnd, RetryPolicy};
use fray_helper::injector::{InjectionHandle, Injector};
use fray_helper::locator::{Resolve, ResolvedTarget};
use fray_helper::probe::HealthProbe;
use fray_helper::reporter::{Annotation, ResultReporter};

type Events = Arc<Mutex<Vec<String>>>;

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeLocator {
    missing: HashSet<String>,
}

impl Resolve for FakeLocator {
    async fn resolve(&self, target: &Target) -> Result<ResolvedTarget, FaultError> {
        if self.missing.contains(&target.pod) {
            return Err(FaultError::TargetUnavailable {
                target: target.to_string(),
                reason: "no running container found".into(),
            });
        }
        Ok(ResolvedTarget {
            target: target.clone(),
            container_id: format!("cid-{}", target.pod),
            pid: 100,
            sandbox_pid: None,
            cgroup: CgroupManager::V2 {
                root: PathBuf::from("/sys/fs/cgroup"),
                group: format!("/{}", target.pod),
            },
            netns_path: PathBuf::from("/proc/100/ns/net"),
        })
    }
}

#[derive(Default, Clone)]
struct FakeInjector {
    events: Events,
    fail_inject: HashSet<String>,
    /// Revert failures to return before succeeding.
    revert_failures: Arc<Mutex<HashMap<String, u32>>>,
    /// Per-pod delay after inject at which the workload exits on its own.
    exit_after: HashMap<String, Duration>,
}

struct FakeHandle {
    target: Target,
    installed: bool,
    exit_at: Option<Instant>,
    exit_seen: bool,
}

impl InjectionHandle for FakeHandle {
    fn target(&self) -> &Target {
        &self.target
    }
}

impl FakeInjector {
    fn new(events: &Events) -> Self {
        Self {
            events: events.clone(),
            ..Default::default()
        }
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn exiting(mut self, pod: &str, after: Duration) -> Self {
        self.exit_after.insert(pod.to_string(), after);
        self
    }

    fn failing_reverts(self, pod: &str, times: u32) -> Self {
        self.revert_failures
            .lock()
            .unwrap()
            .insert(pod.to_string(), times);
        self
    }
}

impl Injector for FakeInjector {
    type Handle = FakeHandle;

    fn prepare(&self, target: &ResolvedTarget) -> Result<FakeHandle, FaultError> {
        Ok(FakeHandle {
            target: target.target.clone(),
            installed: false,
            exit_at: None,
            exit_seen: false,
        })
    }

    async fn inject(&self, handle: &mut FakeHandle) -> Result<(), FaultError> {
        self.record(format!("inject:{}", handle.target.pod));
        handle.installed = true;
        handle.exit_at = self
            .exit_after
            .get(&handle.target.pod)
            .map(|after| Instant::now() + *after);
        if self.fail_inject.contains(&handle.target.pod) {
            return Err(FaultError::RuleApplyFailed {
                rule: "netem".into(),
                reason: "RTNETLINK answers: Operation not permitted".into(),
            });
        }
        Ok(())
    }

    async fn revert(&self, handle: &mut FakeHandle) -> Result<(), FaultError> {
        if !handle.installed {
            return Ok(());
        }
        self.record(format!("revert:{}", handle.target.pod));
        let mut failures = self.revert_failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&handle.target.pod)
            && *left > 0
        {
            *left -= 1;
            return Err(FaultError::RuleRemoveFailed {
                rule: "netem".into(),
                reason: "device busy".into(),
            });
        }
        handle.installed = false;
        Ok(())
    }

    async fn pulse(&self, handle: &mut FakeHandle) -> Result<(), FaultError> {
        self.record(format!("pulse:{}", handle.target.pod));
        Ok(())
    }

    /// Resolves once per handle, like a reaped child.
    async fn exited(&self, handle: &mut FakeHandle) -> String {
        match handle.exit_at {
            Some(at) if !handle.exit_seen => {
                tokio::time::sleep_until(at).await;
                handle.exit_seen = true;
                format!("{} killed by OOM", handle.target.pod)
            }
            _ => std::future::pending().await,
        }
    }
}

#[derive(Default, Clone)]
struct RecordingReporter {
    annotations: Arc<Mutex<Vec<Annotation>>>,
    fail: bool,
}

impl RecordingReporter {
    fn phases(&self) -> Vec<(String, Phase)> {
        self.annotations
            .lock()
            .unwrap()
            .iter()
            .map(|a| (a.target_name.clone(), a.phase))
            .collect()
    }
}

impl ResultReporter for RecordingReporter {
    async fn annotate(&self, annotation: &Annotation) -> Result<(), FaultError> {
        self.annotations.lock().unwrap().push(annotation.clone());
        if self.fail {
            return Err(FaultError::InvalidConfig("result record not found".into()));
        }
        Ok(())
    }
}

struct DownProbe;

/// Answers healthy after a minute.
struct SlowProbe;

impl HealthProbe for SlowProbe {
    async fn check(&self, _target: &ResolvedTarget) -> Result<(), FaultError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

impl HealthProbe for DownProbe {
    async fn check(&self, _target: &ResolvedTarget) -> Result<(), FaultError> {
        Err(FaultError::Timeout {
            operation: "connect web:80".into(),
            after: Duration::from_secs(1),
        })
    }
}

fn targets(pods: &[&str]) -> Vec<Target> {
    pods.iter().map(|p| Target::new("shop", *p, "app")).collect()
}

fn config(mode: ExecutionMode, duration_secs: u64) -> ControllerConfig {
    let mut cfg = ControllerConfig::new(Duration::from_secs(duration_secs));
    cfg.mode = mode;
    cfg.result_id = "shop-chaos".into();
    cfg.chaos_namespace = "litmus".into();
    cfg
}

/// Paused-clock timers fire on millisecond ticks.
fn assert_about(elapsed: Duration, secs: u64) {
    let expected = Duration::from_secs(secs);
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "elapsed {elapsed:?}, expected about {expected:?}"
    );
}

fn events(e: &Events) -> Vec<String> {
    e.lock().unwrap().clone()
}

// ── Serial ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn serial_targets_never_overlap() {
    let log = Events::default();
    let reporter = RecordingReporter::default();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        reporter.clone(),
        config(ExecutionMode::Serial, 10),
        AbortNotifier::never(),
    );

    let report = controller.run(&targets(&["a", "b", "c"])).await;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        events(&log),
        vec!["inject:a", "revert:a", "inject:b", "revert:b", "inject:c", "revert:c"]
    );
    for ep in &report.episodes {
        assert_eq!(ep.state, LifecycleState::Reverted);
        assert_eq!(ep.hold_end, Some(HoldEnd::Elapsed));
        assert_eq!(ep.revert_attempts, 1);
    }
    assert_eq!(
        reporter.phases(),
        vec![
            ("a".to_string(), Phase::Injected),
            ("a".to_string(), Phase::Reverted),
            ("b".to_string(), Phase::Injected),
            ("b".to_string(), Phase::Reverted),
            ("c".to_string(), Phase::Injected),
            ("c".to_string(), Phase::Reverted),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn serial_unresolvable_target_fails_alone() {
    let log = Events::default();
    let locator = FakeLocator {
        missing: HashSet::from(["b".to_string()]),
    };
    let controller = Controller::new(
        locator,
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 5),
        AbortNotifier::never(),
    );

    let report = controller.run(&targets(&["a", "b", "c"])).await;
    assert_eq!(report.exit_code(), 1);
    assert_eq!(events(&log), vec!["inject:a", "revert:a", "inject:c", "revert:c"]);
    let b = report.outcome(&Target::new("shop", "b", "app")).unwrap();
    assert_eq!(b.state, LifecycleState::Failed);
    assert_eq!(b.revert_attempts, 0);
    assert!(b.error.as_deref().unwrap().contains("unavailable"));
}

#[tokio::test(start_paused = true)]
async fn failed_probe_is_recorded_and_revert_still_runs() {
    let log = Events::default();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 5),
        AbortNotifier::never(),
    )
    .with_probe(DownProbe);

    let report = controller.run(&targets(&["a"])).await;
    let ep = &report.episodes[0];
    assert!(matches!(ep.probe, Some(Err(_))));
    assert_eq!(ep.state, LifecycleState::Reverted);
    assert_eq!(events(&log), vec!["inject:a", "revert:a"]);
}

// ── Parallel ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn parallel_inject_failure_is_isolated() {
    let log = Events::default();
    let mut injector = FakeInjector::new(&log);
    injector.fail_inject.insert("b".into());
    let controller = Controller::new(
        FakeLocator::default(),
        injector,
        RecordingReporter::default(),
        config(ExecutionMode::Parallel, 10),
        AbortNotifier::never(),
    );

    let report = controller.run(&targets(&["a", "b", "c"])).await;
    assert_eq!(report.exit_code(), 1);

    let log = events(&log);
    let pos = |e: &str| log.iter().position(|l| l == e).unwrap();
    // all injects before any post-hold revert
    assert!(pos("inject:a") < pos("revert:a"));
    assert!(pos("inject:c") < pos("revert:a"));
    assert!(pos("inject:c") < pos("revert:c"));
    // the broken target is cleaned up
    assert!(log.contains(&"revert:b".to_string()));

    let state = |pod: &str| report.outcome(&Target::new("shop", pod, "app")).unwrap().state;
    assert_eq!(state("a"), LifecycleState::Reverted);
    assert_eq!(state("b"), LifecycleState::Failed);
    assert_eq!(state("c"), LifecycleState::Reverted);
    assert_eq!(report.episodes[1].target.pod, "b");
    assert!(report.episodes[1].hold_end.is_none());
}

#[tokio::test(start_paused = true)]
async fn parallel_targets_share_one_hold() {
    let log = Events::default();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Parallel, 20),
        AbortNotifier::never(),
    );

    let start = tokio::time::Instant::now();
    let report = controller.run(&targets(&["a", "b"])).await;
    assert_about(start.elapsed(), 20);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(events(&log), vec!["inject:a", "inject:b", "revert:a", "revert:b"]);
}

// ── Abort ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn abort_mid_hold_reverts_like_a_timeout() {
    let timeout_log = Events::default();
    let finished = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&timeout_log),
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 30),
        AbortNotifier::never(),
    )
    .run(&targets(&["a"]))
    .await;

    let abort_log = Events::default();
    let (handle, notifier) = abort_channel();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&abort_log),
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 30),
        notifier,
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.abort();
    });

    let start = tokio::time::Instant::now();
    let aborted = controller.run(&targets(&["a"])).await;
    assert!(start.elapsed() < Duration::from_secs(4));

    assert_eq!(events(&abort_log), events(&timeout_log));
    assert_eq!(aborted.episodes[0].state, finished.episodes[0].state);
    assert_eq!(aborted.episodes[0].hold_end, Some(HoldEnd::Aborted));
    assert_eq!(finished.exit_code(), 0);
    assert_eq!(aborted.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn abort_skips_remaining_serial_targets() {
    let log = Events::default();
    let (handle, notifier) = abort_channel();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 10),
        notifier,
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.abort();
    });

    let report = controller.run(&targets(&["a", "b", "c"])).await;
    assert_eq!(events(&log), vec!["inject:a", "revert:a"]);
    assert_eq!(report.skipped, targets(&["b", "c"]));
    assert!(report.aborted);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn abort_before_start_touches_nothing() {
    let log = Events::default();
    let (handle, notifier) = abort_channel();
    handle.abort();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Parallel, 10),
        notifier,
    );

    let report = controller.run(&targets(&["a", "b"])).await;
    assert!(events(&log).is_empty());
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.exit_code(), 1);
}

// ── Revert retry ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn revert_is_retried_within_budget() {
    let log = Events::default();
    let mut cfg = config(ExecutionMode::Serial, 5);
    cfg.retry = RetryPolicy {
        attempts: 3,
        backoff: Duration::from_secs(1),
    };
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log).failing_reverts("a", 2),
        RecordingReporter::default(),
        cfg,
        AbortNotifier::never(),
    );

    let start = tokio::time::Instant::now();
    let report = controller.run(&targets(&["a"])).await;
    // hold plus two fixed backoffs
    assert_about(start.elapsed(), 7);
    assert_eq!(report.episodes[0].state, LifecycleState::Reverted);
    assert_eq!(report.episodes[0].revert_attempts, 3);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_revert_fails_the_episode_without_hanging() {
    let log = Events::default();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log).failing_reverts("a", 100),
        RecordingReporter::default(),
        config(ExecutionMode::Parallel, 5),
        AbortNotifier::never(),
    );

    let report = controller.run(&targets(&["a", "b"])).await;
    let a = report.outcome(&Target::new("shop", "a", "app")).unwrap();
    assert_eq!(a.state, LifecycleState::Failed);
    assert_eq!(a.revert_attempts, 3);
    assert!(a.error.as_deref().unwrap().contains("after 3 attempts"));
    let b = report.outcome(&Target::new("shop", "b", "app")).unwrap();
    assert_eq!(b.state, LifecycleState::Reverted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        events(&log).iter().filter(|e| *e == "revert:a").count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn reporter_failure_never_blocks_teardown() {
    let log = Events::default();
    let reporter = RecordingReporter {
        fail: true,
        ..Default::default()
    };
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        reporter.clone(),
        config(ExecutionMode::Serial, 5),
        AbortNotifier::never(),
    );

    let report = controller.run(&targets(&["a"])).await;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(reporter.phases().len(), 2);
}

// ── Hold ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn duplicate_targets_get_one_episode() {
    let log = Events::default();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Parallel, 5),
        AbortNotifier::never(),
    );

    let report = controller.run(&targets(&["a", "a", "b"])).await;
    assert_eq!(report.episodes.len(), 2);
    assert_eq!(events(&log).iter().filter(|e| *e == "inject:a").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn pulses_fire_every_interval() {
    let log = Events::default();
    let mut cfg = config(ExecutionMode::Serial, 9);
    cfg.hold_interval = Some(Duration::from_secs(2));
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        cfg,
        AbortNotifier::never(),
    );

    controller.run(&targets(&["a"])).await;
    assert_eq!(
        events(&log),
        vec!["inject:a", "pulse:a", "pulse:a", "pulse:a", "pulse:a", "revert:a"]
    );
}

#[tokio::test(start_paused = true)]
async fn workload_exit_ends_the_hold() {
    let log = Events::default();
    let injector = FakeInjector::new(&log).exiting("a", Duration::from_secs(4));
    let controller = Controller::new(
        FakeLocator::default(),
        injector,
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 30),
        AbortNotifier::never(),
    );

    let start = tokio::time::Instant::now();
    let report = controller.run(&targets(&["a"])).await;
    assert_about(start.elapsed(), 4);
    let ep = &report.episodes[0];
    assert_eq!(ep.hold_end, Some(HoldEnd::WorkloadExited("a killed by OOM".into())));
    assert_eq!(ep.state, LifecycleState::Reverted);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn parallel_hold_ends_when_the_last_workload_exits_between_pulses() {
    let log = Events::default();
    let injector = FakeInjector::new(&log)
        .exiting("a", Duration::from_secs(1))
        .exiting("b", Duration::from_secs(5));
    let mut cfg = config(ExecutionMode::Parallel, 60);
    cfg.hold_interval = Some(Duration::from_secs(2));
    let controller = Controller::new(
        FakeLocator::default(),
        injector,
        RecordingReporter::default(),
        cfg,
        AbortNotifier::never(),
    );

    let start = Instant::now();
    let report = controller.run(&targets(&["a", "b"])).await;
    assert_about(start.elapsed(), 5);
    for ep in &report.episodes {
        assert_eq!(
            ep.hold_end,
            Some(HoldEnd::WorkloadExited("a killed by OOM; b killed by OOM".into()))
        );
        assert_eq!(ep.state, LifecycleState::Reverted);
    }
    // ticks at 2s and 4s still pulse both targets
    let pulses = events(&log).iter().filter(|e| e.starts_with("pulse:")).count();
    assert_eq!(pulses, 4);
}

#[tokio::test(start_paused = true)]
async fn one_exited_workload_does_not_end_a_parallel_hold() {
    let log = Events::default();
    let injector = FakeInjector::new(&log).exiting("a", Duration::from_secs(1));
    let controller = Controller::new(
        FakeLocator::default(),
        injector,
        RecordingReporter::default(),
        config(ExecutionMode::Parallel, 10),
        AbortNotifier::never(),
    );

    let start = Instant::now();
    let report = controller.run(&targets(&["a", "b"])).await;
    assert_about(start.elapsed(), 10);
    assert!(
        report
            .episodes
            .iter()
            .all(|e| e.hold_end == Some(HoldEnd::Elapsed))
    );
}

#[tokio::test(start_paused = true)]
async fn abort_during_a_slow_health_check_reverts_promptly() {
    let log = Events::default();
    let (handle, abort) = abort_channel();
    let controller = Controller::new(
        FakeLocator::default(),
        FakeInjector::new(&log),
        RecordingReporter::default(),
        config(ExecutionMode::Serial, 120),
        abort,
    )
    .with_probe(SlowProbe);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.abort();
    });

    let start = Instant::now();
    let report = controller.run(&targets(&["a"])).await;
    assert_about(start.elapsed(), 2);
    let ep = &report.episodes[0];
    assert_eq!(ep.probe, None);
    assert_eq!(ep.hold_end, Some(HoldEnd::Aborted));
    assert_eq!(ep.state, LifecycleState::Reverted);
    assert_eq!(events(&log), vec!["inject:a", "revert:a"]);
}
