//! Fault Lifecycle Controller.
//!
//! Drives each target through `Idle → Injecting → Holding → Reverting →
//! Reverted | Failed`, one target at a time or all together. The hold is a
//! race between the duration timer, the abort notifier and the injected
//! workload's own exit; whichever wins, teardown runs the same revert path.
//! Reverts are retried a fixed number of times with a fixed backoff and are
//! never cut short by abort.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use fray_common::{FaultError, LifecycleState, Phase, Target, ids};

use crate::abort::AbortNotifier;
use crate::injector::{InjectionHandle, Injector};
use crate::locator::{Resolve, ResolvedTarget};
use crate::probe::{HealthProbe, NoProbe};
use crate::reporter::{Annotation, ResultReporter};

// ── Configuration ───────────────────────────────────────────────────

/// Fixed-attempt, fixed-backoff revert retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    Serial,
    #[default]
    Parallel,
}

impl FromStr for ExecutionMode {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(ExecutionMode::Serial),
            "parallel" => Ok(ExecutionMode::Parallel),
            other => Err(FaultError::InvalidConfig(format!(
                "'{other}' sequence is not supported, use serial or parallel"
            ))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Serial => f.write_str("serial"),
            ExecutionMode::Parallel => f.write_str("parallel"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long each fault is held.
    pub duration: Duration,
    /// Pulse period during the hold.
    pub hold_interval: Option<Duration>,
    pub mode: ExecutionMode,
    pub retry: RetryPolicy,
    /// Result record annotated at checkpoints.
    pub result_id: String,
    pub chaos_namespace: String,
}

impl ControllerConfig {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            hold_interval: None,
            mode: ExecutionMode::default(),
            retry: RetryPolicy::default(),
            result_id: String::new(),
            chaos_namespace: String::new(),
        }
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// What ended the hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HoldEnd {
    Elapsed,
    Aborted,
    /// The injected workload exited on its own.
    WorkloadExited(String),
}

#[derive(Debug, Clone)]
pub struct EpisodeOutcome {
    pub episode_id: String,
    pub target: Target,
    pub state: LifecycleState,
    pub error: Option<String>,
    pub probe: Option<Result<(), String>>,
    pub revert_attempts: u32,
    pub hold_end: Option<HoldEnd>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub episodes: Vec<EpisodeOutcome>,
    /// Targets never started because abort arrived first.
    pub skipped: Vec<Target>,
    pub aborted: bool,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        let clean = self
            .episodes
            .iter()
            .all(|e| e.state == LifecycleState::Reverted);
        if clean && self.skipped.is_empty() && !self.aborted {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, target: &Target) -> Option<&EpisodeOutcome> {
        self.episodes.iter().find(|e| &e.target == target)
    }
}

// ── Episodes ────────────────────────────────────────────────────────

struct Episode {
    id: String,
    target: Target,
    state: LifecycleState,
    error: Option<String>,
    probe: Option<Result<(), String>>,
    revert_attempts: u32,
    hold_end: Option<HoldEnd>,
}

impl Episode {
    fn new(target: &Target) -> Self {
        Self {
            id: ids::episode_id(),
            target: target.clone(),
            state: LifecycleState::Idle,
            error: None,
            probe: None,
            revert_attempts: 0,
            hold_end: None,
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal transition {} -> {next}",
            self.state
        );
        tracing::info!(
            episode = %self.id,
            target = %self.target,
            from = %self.state,
            to = %next,
            "episode state"
        );
        self.state = next;
    }

    /// Fail before anything was mutated.
    fn fail(mut self, err: FaultError) -> EpisodeOutcome {
        tracing::error!(episode = %self.id, target = %self.target, error = %err, "episode failed");
        self.error = Some(err.to_string());
        self.transition(LifecycleState::Failed);
        self.into_outcome()
    }

    fn into_outcome(self) -> EpisodeOutcome {
        EpisodeOutcome {
            episode_id: self.id,
            target: self.target,
            state: self.state,
            error: self.error,
            probe: self.probe,
            revert_attempts: self.revert_attempts,
            hold_end: self.hold_end,
        }
    }
}

/// Drop repeated targets, keeping first occurrences in order.
fn dedupe(targets: &[Target]) -> Vec<Target> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(targets.len());
    for t in targets {
        if seen.insert(t) {
            out.push(t.clone());
        } else {
            tracing::warn!(target = %t, "duplicate target ignored");
        }
    }
    out
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ── Controller ──────────────────────────────────────────────────────

pub struct Controller<L, I, R, P = NoProbe> {
    locator: L,
    injector: I,
    reporter: R,
    probe: P,
    config: ControllerConfig,
    abort: AbortNotifier,
}

impl<L, I, R> Controller<L, I, R, NoProbe>
where
    L: Resolve,
    I: Injector,
    R: ResultReporter,
{
    pub fn new(
        locator: L,
        injector: I,
        reporter: R,
        config: ControllerConfig,
        abort: AbortNotifier,
    ) -> Self {
        Self {
            locator,
            injector,
            reporter,
            probe: NoProbe,
            config,
            abort,
        }
    }
}

impl<L, I, R, P> Controller<L, I, R, P>
where
    L: Resolve,
    I: Injector,
    R: ResultReporter,
    P: HealthProbe,
{
    /// Probe each target mid-injection. Serial mode only.
    pub fn with_probe<Q: HealthProbe>(self, probe: Q) -> Controller<L, I, R, Q> {
        Controller {
            locator: self.locator,
            injector: self.injector,
            reporter: self.reporter,
            probe,
            config: self.config,
            abort: self.abort,
        }
    }

    pub fn injector(&self) -> &I {
        &self.injector
    }

    pub async fn run(&self, targets: &[Target]) -> RunReport {
        let targets = dedupe(targets);
        let run_id = ids::run_id();
        tracing::info!(
            run = %run_id,
            targets = targets.len(),
            mode = %self.config.mode,
            duration = ?self.config.duration,
            interval = ?self.config.hold_interval,
            "run starting"
        );

        let (mut episodes, skipped) = match self.config.mode {
            ExecutionMode::Serial => self.run_serial(&targets).await,
            ExecutionMode::Parallel => self.run_parallel(&targets).await,
        };
        episodes.sort_by_key(|e| targets.iter().position(|t| t == &e.target));

        let report = RunReport {
            run_id,
            episodes,
            skipped,
            aborted: self.abort.is_aborted(),
        };
        let reverted = report
            .episodes
            .iter()
            .filter(|e| e.state == LifecycleState::Reverted)
            .count();
        tracing::info!(
            run = %report.run_id,
            reverted,
            failed = report.episodes.len() - reverted,
            skipped = report.skipped.len(),
            aborted = report.aborted,
            "run finished"
        );
        report
    }

    async fn run_serial(&self, targets: &[Target]) -> (Vec<EpisodeOutcome>, Vec<Target>) {
        let mut episodes = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            if self.abort.is_aborted() {
                tracing::warn!(remaining = targets.len() - i, "aborted, skipping remaining targets");
                return (episodes, targets[i..].to_vec());
            }
            episodes.push(self.serial_episode(target).await);
        }
        (episodes, Vec::new())
    }

    async fn serial_episode(&self, target: &Target) -> EpisodeOutcome {
        let mut ep = Episode::new(target);
        let resolved = match self.locator.resolve(target).await {
            Ok(r) => r,
            Err(e) => return ep.fail(e),
        };
        let mut handle = match self.injector.prepare(&resolved) {
            Ok(h) => h,
            Err(e) => return ep.fail(e),
        };

        ep.transition(LifecycleState::Injecting);
        if let Err(e) = self.injector.inject(&mut handle).await {
            return self.abandon(ep, handle, e).await;
        }
        self.annotate(Phase::Injected, target).await;

        ep.transition(LifecycleState::Holding);
        // an abort during a slow check goes straight to the hold, which sees it
        ep.probe = tokio::select! {
            res = self.check_health(&ep, &resolved) => Some(res),
            _ = self.abort.aborted() => None,
        };
        ep.hold_end = Some(self.hold(std::slice::from_mut(&mut handle)).await);

        self.finish(ep, handle).await
    }

    async fn run_parallel(&self, targets: &[Target]) -> (Vec<EpisodeOutcome>, Vec<Target>) {
        if self.abort.is_aborted() {
            return (Vec::new(), targets.to_vec());
        }

        let resolved = join_all(targets.iter().map(|t| self.locator.resolve(t))).await;
        let mut outcomes = Vec::new();
        let mut prepared = Vec::new();
        for (target, res) in targets.iter().zip(resolved) {
            let ep = Episode::new(target);
            match res.and_then(|r| self.injector.prepare(&r)) {
                Ok(handle) => prepared.push((ep, handle)),
                Err(e) => outcomes.push(ep.fail(e)),
            }
        }

        if self.abort.is_aborted() {
            tracing::warn!("aborted before injection, skipping all targets");
            let skipped = prepared.into_iter().map(|(ep, _)| ep.target).collect();
            return (outcomes, skipped);
        }

        let results = join_all(prepared.iter_mut().map(|(ep, handle)| async move {
            ep.transition(LifecycleState::Injecting);
            self.injector.inject(handle).await
        }))
        .await;

        let mut live = Vec::new();
        let mut handles = Vec::new();
        let mut broken = Vec::new();
        for ((ep, handle), res) in prepared.into_iter().zip(results) {
            match res {
                Ok(()) => {
                    live.push(ep);
                    handles.push(handle);
                }
                Err(e) => broken.push((ep, handle, e)),
            }
        }
        outcomes.extend(
            join_all(
                broken
                    .into_iter()
                    .map(|(ep, handle, e)| self.abandon(ep, handle, e)),
            )
            .await,
        );

        if live.is_empty() {
            return (outcomes, Vec::new());
        }

        join_all(live.iter().map(|ep| self.annotate(Phase::Injected, &ep.target))).await;
        for ep in &mut live {
            ep.transition(LifecycleState::Holding);
        }
        let end = self.hold(&mut handles).await;
        for ep in &mut live {
            ep.hold_end = Some(end.clone());
        }

        outcomes.extend(
            join_all(
                live.into_iter()
                    .zip(handles)
                    .map(|(ep, handle)| self.finish(ep, handle)),
            )
            .await,
        );
        (outcomes, Vec::new())
    }

    /// Hold the installed faults until the duration elapses, abort arrives,
    /// or every injected workload has exited. Pulses every hold interval.
    async fn hold(&self, handles: &mut [I::Handle]) -> HoldEnd {
        let start = Instant::now();
        let deadline = start + self.config.duration;
        let mut ticker = self.config.hold_interval.filter(|p| !p.is_zero()).map(|p| {
            let mut t = tokio::time::interval_at(start + p, p);
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        // exit reasons persist across passes; each workload reports once
        let mut exited: Vec<Option<String>> = vec![None; handles.len()];

        loop {
            let mut exits: FuturesUnordered<_> = handles
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| exited[*i].is_none())
                .map(|(i, h)| async move { (i, self.injector.exited(h).await) })
                .collect();
            let watch_exits = !exits.is_empty();
            let exit = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!("hold elapsed");
                    return HoldEnd::Elapsed;
                }
                _ = self.abort.aborted() => {
                    tracing::warn!(held = ?start.elapsed(), "hold aborted");
                    return HoldEnd::Aborted;
                }
                Some(exit) = exits.next(), if watch_exits => Some(exit),
                _ = tick(&mut ticker) => None,
            };
            drop(exits);

            if let Some((i, reason)) = exit {
                tracing::info!(target = %handles[i].target(), reason = %reason, "injected workload exited");
                exited[i] = Some(reason);
                if exited.iter().all(Option::is_some) {
                    let reason = exited.into_iter().flatten().collect::<Vec<_>>().join("; ");
                    tracing::warn!(reason = %reason, "every injected workload exited during hold");
                    return HoldEnd::WorkloadExited(reason);
                }
                continue;
            }

            let results = join_all(handles.iter_mut().map(|h| self.injector.pulse(h))).await;
            for (handle, res) in handles.iter().zip(results) {
                if let Err(e) = res {
                    tracing::warn!(target = %handle.target(), error = %e, "pulse failed");
                }
            }
        }
    }

    async fn check_health(&self, ep: &Episode, resolved: &ResolvedTarget) -> Result<(), String> {
        match self.probe.check(resolved).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(episode = %ep.id, target = %ep.target, error = %e, "health probe failed");
                Err(e.to_string())
            }
        }
    }

    /// Revert after a completed hold.
    async fn finish(&self, mut ep: Episode, mut handle: I::Handle) -> EpisodeOutcome {
        ep.transition(LifecycleState::Reverting);
        match self.revert_with_retry(&mut ep, &mut handle).await {
            Ok(()) => {
                ep.transition(LifecycleState::Reverted);
                self.annotate(Phase::Reverted, &ep.target).await;
            }
            Err(e) => {
                tracing::error!(episode = %ep.id, target = %ep.target, error = %e, "revert exhausted");
                ep.error = Some(e.to_string());
                ep.transition(LifecycleState::Failed);
            }
        }
        ep.into_outcome()
    }

    /// Clean up after a failed inject. The episode fails either way.
    async fn abandon(
        &self,
        mut ep: Episode,
        mut handle: I::Handle,
        err: FaultError,
    ) -> EpisodeOutcome {
        tracing::error!(
            episode = %ep.id,
            target = %ep.target,
            error = %err,
            mutated = err.mutated(),
            "injection failed"
        );
        ep.error = Some(err.to_string());
        ep.transition(LifecycleState::Reverting);
        if let Err(revert) = self.revert_with_retry(&mut ep, &mut handle).await {
            tracing::error!(episode = %ep.id, target = %ep.target, error = %revert, "revert exhausted");
            ep.error = Some(format!("{err}; {revert}"));
        }
        ep.transition(LifecycleState::Failed);
        ep.into_outcome()
    }

    async fn revert_with_retry(
        &self,
        ep: &mut Episode,
        handle: &mut I::Handle,
    ) -> Result<(), FaultError> {
        let attempts = self.config.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            ep.revert_attempts = attempt;
            match self.injector.revert(handle).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => {
                    return Err(FaultError::RevertExhausted {
                        target: ep.target.to_string(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        episode = %ep.id,
                        target = %ep.target,
                        attempt,
                        attempts,
                        error = %e,
                        "revert failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry.backoff).await;
                }
            }
        }
    }

    async fn annotate(&self, phase: Phase, target: &Target) {
        let annotation = Annotation::new(
            &self.config.result_id,
            &self.config.chaos_namespace,
            phase,
            target,
        );
        if let Err(e) = self.reporter.annotate(&annotation).await {
            tracing::warn!(target = %target, phase = phase.as_str(), error = %e, "result annotation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(pod: &str) -> Target {
        Target::new("ns", pod, "c")
    }

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        let out = dedupe(&[t("a"), t("b"), t("a"), t("c"), t("b")]);
        assert_eq!(out, vec![t("a"), t("b"), t("c")]);
    }

    #[test]
    fn exit_code_requires_every_episode_reverted() {
        let outcome = |state| EpisodeOutcome {
            episode_id: "ep".into(),
            target: t("a"),
            state,
            error: None,
            probe: None,
            revert_attempts: 1,
            hold_end: Some(HoldEnd::Elapsed),
        };
        let mut report = RunReport {
            run_id: "run".into(),
            episodes: vec![outcome(LifecycleState::Reverted)],
            skipped: vec![],
            aborted: false,
        };
        assert_eq!(report.exit_code(), 0);

        report.aborted = true;
        assert_eq!(report.exit_code(), 1);

        report.aborted = false;
        report.episodes.push(outcome(LifecycleState::Failed));
        assert_eq!(report.exit_code(), 1);

        report.episodes.pop();
        report.skipped.push(t("b"));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn execution_mode_parsing() {
        assert_eq!("Serial".parse::<ExecutionMode>().unwrap(), ExecutionMode::Serial);
        assert_eq!("parallel".parse::<ExecutionMode>().unwrap(), ExecutionMode::Parallel);
        assert!("random".parse::<ExecutionMode>().is_err());
    }
}
