//! Container runtime inspection.
//!
//! Each runtime flavour has its own CLI transport and JSON shape; every
//! [`RuntimeInspector`] normalises them into [`NormalizedInfo`].

use std::future::Future;
use std::time::Duration;

use fray_common::{FaultError, RuntimeKind, Target};
use fray_netns::runner::{self, CommandRunner};
use serde::Deserialize;

/// Bound on one runtime CLI call.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What the locator needs from a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedInfo {
    /// Root process of the container.
    pub pid: u32,
    /// Process owning the pod's network namespace, when the runtime
    /// reports it separately (the sandbox/pause container).
    pub sandbox_pid: Option<u32>,
}

pub trait RuntimeInspector: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Look up the runtime's container ID for a logical target.
    fn container_id(&self, target: &Target)
    -> impl Future<Output = Result<String, FaultError>> + Send;

    fn inspect(
        &self,
        container_id: &str,
    ) -> impl Future<Output = Result<NormalizedInfo, FaultError>> + Send;

    /// Kill the container with `signal` through the runtime.
    fn kill(
        &self,
        container_id: &str,
        signal: &str,
    ) -> impl Future<Output = Result<(), FaultError>> + Send;
}

/// Strip a `<runtime>://` prefix from a container ID.
pub fn normalize_container_id(raw: &str) -> String {
    match raw.split_once("://") {
        Some((_, id)) => id.trim().to_string(),
        None => raw.trim().to_string(),
    }
}

fn first_id(stdout: &str, target: &Target) -> Result<String, FaultError> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(normalize_container_id)
        .ok_or_else(|| FaultError::TargetUnavailable {
            target: target.to_string(),
            reason: "no running container found".into(),
        })
}

fn non_zero(pid: u32, container_id: &str) -> Result<u32, FaultError> {
    if pid == 0 {
        return Err(FaultError::PidExtractionFailed {
            container_id: container_id.to_string(),
            reason: "no running target container found".into(),
        });
    }
    Ok(pid)
}

fn parse_err(container_id: &str, e: serde_json::Error) -> FaultError {
    FaultError::PidExtractionFailed {
        container_id: container_id.to_string(),
        reason: format!("failed to parse inspect output: {e}"),
    }
}

fn unix_socket(socket: &str) -> String {
    format!("unix://{socket}")
}

// ── JSON shapes ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DockerInspect {
    #[serde(rename = "State", alias = "state")]
    state: DockerState,
}

#[derive(Debug, Deserialize)]
struct DockerState {
    #[serde(rename = "Pid", alias = "pid", default)]
    pid: u32,
}

#[derive(Debug, Default, Deserialize)]
struct CrictlInspect {
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    info: CrictlInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrictlInfo {
    #[serde(default)]
    pid: u32,
    #[serde(default)]
    runtime_spec: RuntimeSpec,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeSpec {
    #[serde(default)]
    linux: LinuxSpec,
}

#[derive(Debug, Default, Deserialize)]
struct LinuxSpec {
    #[serde(default)]
    namespaces: Vec<NamespaceSpec>,
}

#[derive(Debug, Deserialize)]
struct NamespaceSpec {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: String,
}

/// `docker inspect` output: `[ { "State": { "Pid": N } } ]`.
pub fn parse_docker_inspect(container_id: &str, json: &str) -> Result<NormalizedInfo, FaultError> {
    let resp: Vec<DockerInspect> =
        serde_json::from_str(json).map_err(|e| parse_err(container_id, e))?;
    let first = resp.first().ok_or_else(|| FaultError::PidExtractionFailed {
        container_id: container_id.to_string(),
        reason: "empty inspect output".into(),
    })?;
    Ok(NormalizedInfo {
        pid: non_zero(first.state.pid, container_id)?,
        sandbox_pid: None,
    })
}

/// PID from a `/proc/<pid>/ns/net` namespace path.
fn pid_from_ns_path(path: &str) -> Option<u32> {
    path.split('/').nth(2).and_then(|p| p.parse().ok())
}

/// containerd `crictl inspect` output: `info.pid`, with the network
/// namespace owner read from `info.runtimeSpec.linux.namespaces`.
pub fn parse_containerd_inspect(
    container_id: &str,
    json: &str,
) -> Result<NormalizedInfo, FaultError> {
    let resp: CrictlInspect = serde_json::from_str(json).map_err(|e| parse_err(container_id, e))?;
    let sandbox_pid = resp
        .info
        .runtime_spec
        .linux
        .namespaces
        .iter()
        .find(|ns| ns.kind == "network")
        .and_then(|ns| pid_from_ns_path(&ns.path))
        .filter(|pid| *pid != 0);
    Ok(NormalizedInfo {
        pid: non_zero(resp.info.pid, container_id)?,
        sandbox_pid,
    })
}

/// CRI-O `crictl inspect` output: top-level `pid`, falling back to `info.pid`.
pub fn parse_crio_inspect(container_id: &str, json: &str) -> Result<NormalizedInfo, FaultError> {
    let resp: CrictlInspect = serde_json::from_str(json).map_err(|e| parse_err(container_id, e))?;
    let pid = if resp.pid != 0 { resp.pid } else { resp.info.pid };
    Ok(NormalizedInfo {
        pid: non_zero(pid, container_id)?,
        sandbox_pid: None,
    })
}

// ── Docker ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DockerInspector<R> {
    runner: R,
    socket: String,
}

impl<R: CommandRunner> DockerInspector<R> {
    pub fn new(runner: R, socket: impl Into<String>) -> Self {
        Self {
            runner,
            socket: socket.into(),
        }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["--host".to_string(), unix_socket(&self.socket)];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }
}

impl<R: CommandRunner> RuntimeInspector for DockerInspector<R> {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn container_id(&self, target: &Target) -> Result<String, FaultError> {
        let filter = format!(
            "name=k8s_{}_{}_{}_",
            target.container, target.pod, target.namespace
        );
        let args = self.args(&["ps", "-q", "--filter", &filter]);
        let out = runner::run_checked(&self.runner, "docker", &args, INSPECT_TIMEOUT)
            .await
            .map_err(|e| FaultError::TargetUnavailable {
                target: target.to_string(),
                reason: e.to_string(),
            })?;
        first_id(&out.stdout, target)
    }

    async fn inspect(&self, container_id: &str) -> Result<NormalizedInfo, FaultError> {
        let args = self.args(&["inspect", container_id]);
        let out = runner::run_checked(&self.runner, "docker", &args, INSPECT_TIMEOUT)
            .await
            .map_err(|e| FaultError::PidExtractionFailed {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            })?;
        parse_docker_inspect(container_id, &out.stdout)
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<(), FaultError> {
        let args = self.args(&["kill", "--signal", signal, container_id]);
        runner::run_checked(&self.runner, "docker", &args, INSPECT_TIMEOUT).await?;
        Ok(())
    }
}

// ── CRI (containerd, CRI-O) ─────────────────────────────────────────

/// `crictl`-based inspector shared by containerd and CRI-O; they differ
/// only in where the PID sits in the inspect output.
#[derive(Debug, Clone)]
pub struct CriInspector<R> {
    runner: R,
    socket: String,
    kind: RuntimeKind,
}

impl<R: CommandRunner> CriInspector<R> {
    pub fn containerd(runner: R, socket: impl Into<String>) -> Self {
        Self {
            runner,
            socket: socket.into(),
            kind: RuntimeKind::Containerd,
        }
    }

    pub fn crio(runner: R, socket: impl Into<String>) -> Self {
        Self {
            runner,
            socket: socket.into(),
            kind: RuntimeKind::Crio,
        }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let endpoint = unix_socket(&self.socket);
        let mut args = vec![
            "-i".to_string(),
            endpoint.clone(),
            "-r".to_string(),
            endpoint,
        ];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }
}

impl<R: CommandRunner> RuntimeInspector for CriInspector<R> {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn container_id(&self, target: &Target) -> Result<String, FaultError> {
        let name = format!("^{}$", target.container);
        let pod_label = format!("io.kubernetes.pod.name={}", target.pod);
        let ns_label = format!("io.kubernetes.pod.namespace={}", target.namespace);
        let args = self.args(&[
            "ps", "-q", "--name", &name, "--label", &pod_label, "--label", &ns_label,
        ]);
        let out = runner::run_checked(&self.runner, "crictl", &args, INSPECT_TIMEOUT)
            .await
            .map_err(|e| FaultError::TargetUnavailable {
                target: target.to_string(),
                reason: e.to_string(),
            })?;
        first_id(&out.stdout, target)
    }

    async fn inspect(&self, container_id: &str) -> Result<NormalizedInfo, FaultError> {
        let args = self.args(&["inspect", container_id]);
        let out = runner::run_checked(&self.runner, "crictl", &args, INSPECT_TIMEOUT)
            .await
            .map_err(|e| FaultError::PidExtractionFailed {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            })?;
        match self.kind {
            RuntimeKind::Crio => parse_crio_inspect(container_id, &out.stdout),
            _ => parse_containerd_inspect(container_id, &out.stdout),
        }
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<(), FaultError> {
        let mut rest = vec!["stop"];
        match signal {
            "SIGKILL" => rest.push("--timeout=0"),
            "SIGTERM" => {}
            other => {
                return Err(FaultError::InvalidConfig(format!(
                    "unsupported signal {other} for {}, use either SIGTERM or SIGKILL",
                    self.kind
                )));
            }
        }
        rest.push(container_id);
        runner::run_checked(&self.runner, "crictl", &self.args(&rest), INSPECT_TIMEOUT).await?;
        Ok(())
    }
}

// ── Runtime selection ───────────────────────────────────────────────

/// The inspector for a configured runtime.
#[derive(Debug, Clone)]
pub enum AnyInspector<R> {
    Docker(DockerInspector<R>),
    Cri(CriInspector<R>),
}

impl<R: CommandRunner> AnyInspector<R> {
    pub fn for_runtime(kind: RuntimeKind, runner: R, socket: &str) -> Self {
        match kind {
            RuntimeKind::Docker => AnyInspector::Docker(DockerInspector::new(runner, socket)),
            RuntimeKind::Containerd => AnyInspector::Cri(CriInspector::containerd(runner, socket)),
            RuntimeKind::Crio => AnyInspector::Cri(CriInspector::crio(runner, socket)),
        }
    }
}

impl<R: CommandRunner> RuntimeInspector for AnyInspector<R> {
    fn kind(&self) -> RuntimeKind {
        match self {
            AnyInspector::Docker(i) => i.kind(),
            AnyInspector::Cri(i) => i.kind(),
        }
    }

    async fn container_id(&self, target: &Target) -> Result<String, FaultError> {
        match self {
            AnyInspector::Docker(i) => i.container_id(target).await,
            AnyInspector::Cri(i) => i.container_id(target).await,
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<NormalizedInfo, FaultError> {
        match self {
            AnyInspector::Docker(i) => i.inspect(container_id).await,
            AnyInspector::Cri(i) => i.inspect(container_id).await,
        }
    }

    async fn kill(&self, container_id: &str, signal: &str) -> Result<(), FaultError> {
        match self {
            AnyInspector::Docker(i) => i.kill(container_id, signal).await,
            AnyInspector::Cri(i) => i.kill(container_id, signal).await,
        }
    }
}
