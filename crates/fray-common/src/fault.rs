//! Fault specifications.
//!
//! A [`FaultSpec`] says *what* to inject and for how long. Turning it into a
//! concrete command line or rule set is the job of the helper's composition
//! functions; nothing here touches the OS.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FaultError;

/// One fault, applied identically to every target of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultSpec {
    pub kind: FaultKind,
    /// How long each episode holds the fault.
    pub duration: Duration,
    /// Pulse period during the hold (re-kill, re-apply), if any.
    pub hold_interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind {
    ResourceStress(StressSpec),
    NetworkRule(NetworkRuleSpec),
    TrafficRedirect(RedirectSpec),
    ProcessKill(KillSpec),
    DiskFill(DiskFillSpec),
}

impl FaultSpec {
    pub fn new(kind: FaultKind, duration: Duration) -> Self {
        Self {
            kind,
            duration,
            hold_interval: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.hold_interval = Some(interval);
        self
    }

    /// Short experiment-style name used in logs and result records.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            FaultKind::ResourceStress(s) => match s.kind {
                StressKind::Cpu => "pod-cpu-stress",
                StressKind::Memory => "pod-memory-stress",
                StressKind::Io => "pod-io-stress",
            },
            FaultKind::NetworkRule(n) => match n.kind {
                NetworkRuleKind::Latency { .. } => "pod-network-latency",
                NetworkRuleKind::Loss { .. } => "pod-network-loss",
                NetworkRuleKind::Duplication { .. } => "pod-network-duplication",
                NetworkRuleKind::Corruption { .. } => "pod-network-corruption",
                NetworkRuleKind::Rate { .. } => "pod-network-rate-limit",
                NetworkRuleKind::Partition => "pod-network-partition",
            },
            FaultKind::TrafficRedirect(_) => "pod-http-chaos",
            FaultKind::ProcessKill(_) => "container-kill",
            FaultKind::DiskFill(_) => "disk-fill",
        }
    }
}

// ── Resource stress ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressKind {
    Cpu,
    Memory,
    Io,
}

/// A `stress-ng` workload run inside the target's cgroup.
///
/// `intensity` is interpreted per kind: CPU load percent, MiB per memory
/// worker, or filesystem utilisation percent for io (0 means 10%).
#[derive(Debug, Clone, PartialEq)]
pub struct StressSpec {
    pub kind: StressKind,
    pub workers: u32,
    pub intensity: u32,
    /// Directory inside the container that io workers write to.
    pub volume_path: Option<String>,
}

// ── Network rules ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkRuleKind {
    Latency { latency_ms: u32, jitter_ms: u32 },
    Loss { percent: f32 },
    Duplication { percent: f32 },
    Corruption { percent: f32 },
    Rate { kbit: u64 },
    Partition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRuleSpec {
    pub kind: NetworkRuleKind,
    pub interface: String,
    pub filter: TrafficFilter,
}

/// Restricts a shaping rule to part of the traffic.
///
/// An empty filter shapes everything leaving the interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficFilter {
    pub destination_ips: Vec<String>,
    pub destination_ports: PortFilter,
    pub source_ports: PortFilter,
}

impl TrafficFilter {
    pub fn is_empty(&self) -> bool {
        self.destination_ips.is_empty()
            && self.destination_ports.ports.is_empty()
            && self.source_ports.ports.is_empty()
    }

    /// Parse a comma separated destination list, dropping blanks and duplicates.
    pub fn parse_ips(input: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for ip in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if !out.iter().any(|seen| seen == ip) {
                out.push(ip.to_string());
            }
        }
        out
    }
}

/// A port list. With `exclude` set, the listed ports are spared and
/// everything else is shaped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub ports: Vec<u16>,
    pub exclude: bool,
}

impl FromStr for PortFilter {
    type Err = FaultError;

    /// `"80,443"` selects ports; `"!22,53"` excludes them.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(PortFilter::default());
        }
        let (exclude, list) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let mut ports = Vec::new();
        for raw in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let port = raw
                .parse::<u16>()
                .map_err(|_| FaultError::InvalidConfig(format!("invalid port '{raw}'")))?;
            ports.push(port);
        }
        Ok(PortFilter { ports, exclude })
    }
}

// ── HTTP traffic redirect ───────────────────────────────────────────

/// Redirect a service port to an in-namespace proxy that mutates traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectSpec {
    pub interface: String,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// Percentage of connections the toxics apply to (0..=100).
    pub toxicity: u8,
    pub toxics: Vec<Toxic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStream {
    Upstream,
    Downstream,
}

impl fmt::Display for HeaderStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderStream::Upstream => write!(f, "upstream"),
            HeaderStream::Downstream => write!(f, "downstream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Toxic {
    Latency {
        latency_ms: u32,
    },
    StatusCode {
        code: u16,
        /// Replace the response body as well as the status line.
        modify_body: bool,
        body: String,
        content_type: String,
        content_encoding: String,
    },
    ModifyBody {
        body: String,
        content_type: String,
        content_encoding: String,
    },
    Header {
        stream: HeaderStream,
        /// JSON object of header name to value.
        headers: String,
        /// `add` or `replace`.
        mode: String,
    },
    ResetPeer {
        timeout_ms: u32,
    },
}

impl Toxic {
    pub fn type_name(&self) -> &'static str {
        match self {
            Toxic::Latency { .. } => "latency",
            Toxic::StatusCode { .. } => "status_code",
            Toxic::ModifyBody { .. } => "modify_body",
            Toxic::Header { .. } => "header",
            Toxic::ResetPeer { .. } => "reset_peer",
        }
    }
}

// ── Process kill / disk fill ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSpec {
    /// Signal name, e.g. `SIGKILL`.
    pub signal: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFillSpec {
    pub mebibytes: u64,
    pub block_kib: u64,
    /// Directory inside the container root that receives the fill file.
    pub path: String,
}
