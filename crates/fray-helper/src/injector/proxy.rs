//! Traffic Redirector: an in-namespace toxiproxy fronting the target port.
//!
//! Inbound TCP on the target port is redirected via `iptables` to the proxy
//! listener; the proxy forwards to the real service with toxics applied.

use std::time::Duration;

use fray_common::fault::RedirectSpec;
use fray_common::{FaultError, Target};
use fray_netns::NsExec;
use fray_netns::iptables::{self, Redirect, RuleOp};
use fray_netns::namespace::NS_EXEC_TIMEOUT;
use fray_netns::runner::{self, CommandRunner};

use crate::compose;
use crate::injector::{InjectionHandle, Injector};
use crate::locator::ResolvedTarget;

const SERVER: [&str; 2] = ["toxiproxy-server", "-host=0.0.0.0"];
const READY_ATTEMPTS: u32 = 20;
const READY_INTERVAL: Duration = Duration::from_millis(250);

pub struct TrafficRedirectInjector<R> {
    runner: R,
    spec: RedirectSpec,
    ready_interval: Duration,
    proxy_command: Vec<String>,
}

#[derive(Debug)]
pub struct RedirectHandle {
    target: Target,
    pid: u32,
    /// Host PID of the proxy this handle started.
    proxy_pid: Option<u32>,
    redirect: Option<Redirect>,
}

impl RedirectHandle {
    pub fn is_clean(&self) -> bool {
        self.proxy_pid.is_none() && self.redirect.is_none()
    }

    pub fn proxy_pid(&self) -> Option<u32> {
        self.proxy_pid
    }
}

impl InjectionHandle for RedirectHandle {
    fn target(&self) -> &Target {
        &self.target
    }
}

fn apply_failed(rule: &str, err: FaultError) -> FaultError {
    FaultError::RuleApplyFailed {
        rule: rule.to_string(),
        reason: err.to_string(),
    }
}

impl<R: CommandRunner + Clone> TrafficRedirectInjector<R> {
    pub fn new(runner: R, spec: RedirectSpec) -> Self {
        Self {
            runner,
            spec,
            ready_interval: READY_INTERVAL,
            proxy_command: SERVER.map(String::from).to_vec(),
        }
    }

    /// Replace the proxy server command line.
    pub fn with_proxy_command(mut self, command: Vec<String>) -> Self {
        self.proxy_command = command;
        self
    }

    pub fn with_ready_interval(mut self, interval: Duration) -> Self {
        self.ready_interval = interval;
        self
    }

    fn ns(&self, pid: u32) -> NsExec<R> {
        NsExec::new(self.runner.clone(), pid)
    }

    async fn wait_ready(&self, ns: &NsExec<R>) -> Result<(), FaultError> {
        let list = vec!["list".to_string()];
        for _ in 0..READY_ATTEMPTS {
            if let Ok(out) = ns.exec("toxiproxy-cli", &list).await
                && out.success()
            {
                return Ok(());
            }
            tokio::time::sleep(self.ready_interval).await;
        }
        Err(FaultError::Timeout {
            operation: "toxiproxy-server startup".into(),
            after: self.ready_interval * READY_ATTEMPTS,
        })
    }

    /// SIGKILL the proxy by PID from the host. A process that is already
    /// gone counts as stopped.
    async fn kill_proxy(&self, pid: u32) -> Result<(), FaultError> {
        let args = vec!["-9".to_string(), pid.to_string()];
        let failed = |reason: String| FaultError::RuleRemoveFailed {
            rule: "toxiproxy-server".into(),
            reason,
        };
        let out = runner::run_timed(&self.runner, "kill", &args, NS_EXEC_TIMEOUT)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if out.success() {
            return Ok(());
        }
        if out.stderr.contains("No such process") {
            tracing::warn!(proxy_pid = pid, "proxy already exited");
            return Ok(());
        }
        Err(failed(format!(
            "kill exited with {:?}: {}",
            out.status,
            out.stderr.trim()
        )))
    }
}

impl<R: CommandRunner + Clone> Injector for TrafficRedirectInjector<R> {
    type Handle = RedirectHandle;

    fn prepare(&self, target: &ResolvedTarget) -> Result<RedirectHandle, FaultError> {
        if self.spec.listen_port == self.spec.target_port {
            return Err(FaultError::InvalidConfig(format!(
                "proxy port {} must differ from target port",
                self.spec.listen_port
            )));
        }
        Ok(RedirectHandle {
            target: target.target.clone(),
            pid: target.netns_pid(),
            proxy_pid: None,
            redirect: None,
        })
    }

    async fn inject(&self, handle: &mut RedirectHandle) -> Result<(), FaultError> {
        let ns = self.ns(handle.pid);

        let Some((program, args)) = self.proxy_command.split_first() else {
            return Err(FaultError::InvalidConfig("empty proxy command".into()));
        };
        let proxy_pid = ns
            .spawn(program, args)
            .await
            .map_err(|e| apply_failed("toxiproxy-server", e))?;
        handle.proxy_pid = Some(proxy_pid);
        tracing::debug!(target = %handle.target, proxy_pid, "proxy started");
        self.wait_ready(&ns)
            .await
            .map_err(|e| apply_failed("toxiproxy-server", e))?;

        ns.exec_checked("toxiproxy-cli", &compose::proxy_create_args(&self.spec))
            .await
            .map_err(|e| apply_failed("proxy", e))?;
        for toxic in &self.spec.toxics {
            ns.exec_checked("toxiproxy-cli", &compose::toxic_args(toxic, self.spec.toxicity))
                .await
                .map_err(|e| apply_failed(&format!("{} toxic", toxic.type_name()), e))?;
        }

        let redirect = Redirect {
            interface: self.spec.interface.clone(),
            from_port: self.spec.target_port,
            to_port: self.spec.listen_port,
        };
        handle.redirect = Some(redirect.clone());
        ns.exec_checked("iptables", &redirect.args(RuleOp::Insert))
            .await
            .map_err(|e| apply_failed("redirect", e))?;

        tracing::info!(
            target = %handle.target,
            pid = handle.pid,
            from = self.spec.target_port,
            to = self.spec.listen_port,
            toxics = self.spec.toxics.len(),
            "traffic redirected through proxy"
        );
        Ok(())
    }

    /// Drops the redirect, then kills the proxy this handle started. Both
    /// steps always run.
    async fn revert(&self, handle: &mut RedirectHandle) -> Result<(), FaultError> {
        let ns = self.ns(handle.pid);
        let mut errors = Vec::new();

        if let Some(redirect) = handle.redirect.clone() {
            match ns.exec("iptables", &redirect.args(RuleOp::Delete)).await {
                Ok(out) if out.success() || iptables::is_already_absent(&out.stderr) => {
                    handle.redirect = None;
                }
                Ok(out) => errors.push(FaultError::RuleRemoveFailed {
                    rule: "redirect".into(),
                    reason: out.stderr.trim().to_string(),
                }),
                Err(e) => errors.push(FaultError::RuleRemoveFailed {
                    rule: "redirect".into(),
                    reason: e.to_string(),
                }),
            }
        }

        if let Some(proxy_pid) = handle.proxy_pid {
            match self.kill_proxy(proxy_pid).await {
                Ok(()) => handle.proxy_pid = None,
                Err(e) => errors.push(e),
            }
        }

        match FaultError::aggregate(errors) {
            Some(err) => Err(err),
            None => {
                tracing::info!(target = %handle.target, pid = handle.pid, "proxy removed");
                Ok(())
            }
        }
    }
}
