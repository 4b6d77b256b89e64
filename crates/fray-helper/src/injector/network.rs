//! Namespace Rule Installer: netem shaping and partition drops.
//!
//! Every command re-enters the target's network namespace by PID.

use fray_common::fault::NetworkRuleSpec;
use fray_common::{FaultError, Target};
use fray_netns::iptables::{self, DropRule, RuleOp};
use fray_netns::netem;
use fray_netns::runner::{CommandOutput, CommandRunner};
use fray_netns::NsExec;

use crate::compose::{self, RulePlan};
use crate::injector::{InjectionHandle, Injector};
use crate::locator::ResolvedTarget;

pub struct NetworkRuleInjector<R> {
    runner: R,
    spec: NetworkRuleSpec,
}

#[derive(Debug)]
pub struct NetworkHandle {
    target: Target,
    pid: u32,
    interface: String,
    plan: RulePlan,
    /// A root qdisc may be present.
    qdisc_installed: bool,
    /// Drop rules that may be present.
    drops_installed: Vec<DropRule>,
}

impl NetworkHandle {
    pub fn plan(&self) -> &RulePlan {
        &self.plan
    }

    /// Whether anything may still be installed.
    pub fn is_clean(&self) -> bool {
        !self.qdisc_installed && self.drops_installed.is_empty()
    }
}

impl InjectionHandle for NetworkHandle {
    fn target(&self) -> &Target {
        &self.target
    }
}

impl<R: CommandRunner + Clone> NetworkRuleInjector<R> {
    pub fn new(runner: R, spec: NetworkRuleSpec) -> Self {
        Self { runner, spec }
    }

    fn ns(&self, pid: u32) -> NsExec<R> {
        NsExec::new(self.runner.clone(), pid)
    }

    async fn apply(
        &self,
        pid: u32,
        program: &str,
        args: Vec<String>,
        rule: &str,
    ) -> Result<(), FaultError> {
        let out = self
            .ns(pid)
            .exec(program, &args)
            .await
            .map_err(|e| FaultError::RuleApplyFailed {
                rule: rule.to_string(),
                reason: e.to_string(),
            })?;
        if !out.success() {
            return Err(FaultError::RuleApplyFailed {
                rule: rule.to_string(),
                reason: format!("{program} {}: {}", args.join(" "), out.stderr.trim()),
            });
        }
        Ok(())
    }

    /// Run a removal; `Ok(true)` if removed, `Ok(false)` if already absent.
    async fn remove(
        &self,
        pid: u32,
        program: &str,
        args: Vec<String>,
        rule: &str,
        absent: fn(&str) -> bool,
    ) -> Result<bool, FaultError> {
        let out: CommandOutput = self
            .ns(pid)
            .exec(program, &args)
            .await
            .map_err(|e| FaultError::RuleRemoveFailed {
                rule: rule.to_string(),
                reason: e.to_string(),
            })?;
        if out.success() {
            return Ok(true);
        }
        if absent(&out.stderr) {
            return Ok(false);
        }
        Err(FaultError::RuleRemoveFailed {
            rule: rule.to_string(),
            reason: out.stderr.trim().to_string(),
        })
    }
}

impl<R: CommandRunner + Clone> Injector for NetworkRuleInjector<R> {
    type Handle = NetworkHandle;

    fn prepare(&self, target: &ResolvedTarget) -> Result<NetworkHandle, FaultError> {
        Ok(NetworkHandle {
            target: target.target.clone(),
            pid: target.netns_pid(),
            interface: self.spec.interface.clone(),
            plan: compose::network_plan(&self.spec),
            qdisc_installed: false,
            drops_installed: Vec::new(),
        })
    }

    async fn inject(&self, handle: &mut NetworkHandle) -> Result<(), FaultError> {
        let iface = handle.interface.clone();
        let rule = format!("netem on {iface}");
        match handle.plan.clone() {
            RulePlan::RootNetem(cfg) => {
                handle.qdisc_installed = true;
                self.apply(handle.pid, "tc", netem::root_netem_args(&iface, &cfg), &rule)
                    .await?;
            }
            RulePlan::Classful { netem: cfg, filters } => {
                handle.qdisc_installed = true;
                self.apply(handle.pid, "tc", netem::prio_root_args(&iface), &rule).await?;
                self.apply(handle.pid, "tc", netem::band_netem_args(&iface, &cfg), &rule)
                    .await?;
                for (band, matcher) in &filters {
                    let filter_rule = format!("tc filter {matcher:?} on {iface}");
                    let args = netem::filter_args(&iface, *band, matcher);
                    self.apply(handle.pid, "tc", args, &filter_rule).await?;
                }
            }
            RulePlan::Drop(rules) => {
                for drop in rules {
                    handle.drops_installed.push(drop.clone());
                    let drop_rule = format!("{} drop {}", drop.program(), drop.peer);
                    self.apply(handle.pid, drop.program(), drop.args(RuleOp::Insert), &drop_rule)
                        .await?;
                }
            }
        }
        tracing::info!(
            target = %handle.target,
            pid = handle.pid,
            interface = %iface,
            "network rules installed"
        );
        Ok(())
    }

    async fn revert(&self, handle: &mut NetworkHandle) -> Result<(), FaultError> {
        let mut errors = Vec::new();

        if handle.qdisc_installed {
            let rule = format!("netem on {}", handle.interface);
            match self
                .remove(
                    handle.pid,
                    "tc",
                    netem::delete_root_args(&handle.interface),
                    &rule,
                    netem::is_already_absent,
                )
                .await
            {
                Ok(removed) => {
                    if !removed {
                        tracing::warn!(target = %handle.target, "qdisc already removed");
                    }
                    handle.qdisc_installed = false;
                }
                Err(e) => errors.push(e),
            }
        }

        let mut remaining = Vec::new();
        for drop in std::mem::take(&mut handle.drops_installed) {
            let rule = format!("{} drop {}", drop.program(), drop.peer);
            match self
                .remove(
                    handle.pid,
                    drop.program(),
                    drop.args(RuleOp::Delete),
                    &rule,
                    iptables::is_already_absent,
                )
                .await
            {
                Ok(removed) => {
                    if !removed {
                        tracing::warn!(target = %handle.target, rule = %rule, "rule already removed");
                    }
                }
                Err(e) => {
                    errors.push(e);
                    remaining.push(drop);
                }
            }
        }
        handle.drops_installed = remaining;

        match FaultError::aggregate(errors) {
            Some(err) => Err(err),
            None => {
                tracing::info!(target = %handle.target, pid = handle.pid, "network rules removed");
                Ok(())
            }
        }
    }
}
