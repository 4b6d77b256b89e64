//! Pure composition of fault parameters into commands and rule plans.
//!
//! Nothing here runs anything; the injectors execute what these produce.

use std::time::Duration;

use fray_common::fault::{
    DiskFillSpec, HeaderStream, NetworkRuleKind, NetworkRuleSpec, PortFilter, RedirectSpec,
    StressKind, StressSpec, Toxic,
};
use fray_netns::iptables::DropRule;
use fray_netns::netem::{BYPASS_BAND, FilterMatch, NetemConfig, SHAPED_BAND};

/// Name of the proxy created inside the target namespace.
pub const PROXY_NAME: &str = "fray";

/// File written by disk fill, inside the configured directory.
pub const DISK_FILL_FILE: &str = "fray-diskfill";

// ── Stress ──────────────────────────────────────────────────────────

/// `stress-ng` flags for the workload, bounded by `duration`.
pub fn stressor_args(spec: &StressSpec, duration: Duration) -> Vec<String> {
    let workers = spec.workers.max(1).to_string();
    let mut args = vec![
        "stress-ng".to_string(),
        "--timeout".to_string(),
        format!("{}s", duration.as_secs().max(1)),
    ];
    match spec.kind {
        StressKind::Cpu => {
            args.extend(["--cpu".to_string(), workers]);
            args.extend(["--cpu-load".to_string(), spec.intensity.min(100).to_string()]);
        }
        StressKind::Memory => {
            args.extend(["--vm".to_string(), workers]);
            args.extend(["--vm-bytes".to_string(), format!("{}M", spec.intensity)]);
        }
        StressKind::Io => {
            let percent = if spec.intensity == 0 {
                10
            } else {
                spec.intensity.min(100)
            };
            args.extend(["--io".to_string(), workers.clone()]);
            args.extend(["--hdd".to_string(), workers]);
            args.extend(["--hdd-bytes".to_string(), format!("{percent}%")]);
            if let Some(path) = spec.volume_path.as_deref().filter(|p| !p.is_empty()) {
                args.extend(["--temp-path".to_string(), path.to_string()]);
            }
        }
    }
    args
}

/// Full workload argv: the stressor wrapped in `nsutil` so it sees the
/// target's PID namespace (and, for io, its mount namespace).
pub fn stress_argv(spec: &StressSpec, target_pid: u32, duration: Duration) -> Vec<String> {
    let mut argv = vec![
        "nsutil".to_string(),
        "-t".to_string(),
        target_pid.to_string(),
        "-p".to_string(),
    ];
    if spec.kind == StressKind::Io {
        argv.push("-m".to_string());
    }
    argv.push("--".to_string());
    argv.extend(stressor_args(spec, duration));
    argv
}

// ── Network rules ───────────────────────────────────────────────────

/// How a network fault is installed.
#[derive(Debug, Clone, PartialEq)]
pub enum RulePlan {
    /// Shape the whole interface with a root netem qdisc.
    RootNetem(NetemConfig),
    /// `prio` root with netem on band 3 and these `(band, match)` filters.
    Classful {
        netem: NetemConfig,
        filters: Vec<(u8, FilterMatch)>,
    },
    /// Drop traffic to and from each peer.
    Drop(Vec<DropRule>),
}

fn netem_for(kind: &NetworkRuleKind) -> NetemConfig {
    let mut cfg = NetemConfig::default();
    match *kind {
        NetworkRuleKind::Latency {
            latency_ms,
            jitter_ms,
        } => {
            cfg.delay_ms = Some(latency_ms);
            cfg.jitter_ms = Some(jitter_ms);
        }
        NetworkRuleKind::Loss { percent } => cfg.loss_percent = Some(percent),
        NetworkRuleKind::Duplication { percent } => cfg.duplicate_percent = Some(percent),
        NetworkRuleKind::Corruption { percent } => cfg.corrupt_percent = Some(percent),
        NetworkRuleKind::Rate { kbit } => cfg.rate_kbit = Some(kbit),
        NetworkRuleKind::Partition => cfg.loss_percent = Some(100.0),
    }
    cfg
}

fn port_filters(filter: &PortFilter, dest: bool, out: &mut Vec<(u8, FilterMatch)>) {
    let band = if filter.exclude { BYPASS_BAND } else { SHAPED_BAND };
    for port in &filter.ports {
        let m = if dest {
            FilterMatch::DestinationPort(*port)
        } else {
            FilterMatch::SourcePort(*port)
        };
        out.push((band, m));
    }
}

/// Plan the rules for a network fault.
///
/// A partition with destinations becomes `DROP` rules; without, a root
/// `loss 100%`. Shaping with no filter is a root netem. With whitelisted
/// (excluded) ports, those ports go to the bypass band and everything else
/// is caught into the shaped band; destination IPs are not used then.
/// Otherwise each IP and port is steered into the shaped band.
pub fn network_plan(spec: &NetworkRuleSpec) -> RulePlan {
    let filter = &spec.filter;
    if spec.kind == NetworkRuleKind::Partition && !filter.destination_ips.is_empty() {
        return RulePlan::Drop(
            filter
                .destination_ips
                .iter()
                .flat_map(|ip| DropRule::pair(ip))
                .collect(),
        );
    }

    let netem = netem_for(&spec.kind);
    if filter.is_empty() {
        return RulePlan::RootNetem(netem);
    }

    let mut filters = Vec::new();
    if filter.destination_ports.exclude || filter.source_ports.exclude {
        let whitelist_dports = PortFilter {
            ports: if filter.destination_ports.exclude {
                filter.destination_ports.ports.clone()
            } else {
                Vec::new()
            },
            exclude: true,
        };
        let whitelist_sports = PortFilter {
            ports: if filter.source_ports.exclude {
                filter.source_ports.ports.clone()
            } else {
                Vec::new()
            },
            exclude: true,
        };
        port_filters(&whitelist_dports, true, &mut filters);
        port_filters(&whitelist_sports, false, &mut filters);
        filters.push((SHAPED_BAND, FilterMatch::Any));
    } else {
        for ip in &filter.destination_ips {
            filters.push((SHAPED_BAND, FilterMatch::Destination(ip.clone())));
        }
        port_filters(&filter.source_ports, false, &mut filters);
        port_filters(&filter.destination_ports, true, &mut filters);
    }
    RulePlan::Classful { netem, filters }
}

// ── HTTP proxy ──────────────────────────────────────────────────────

/// `toxiproxy-cli create` arguments.
pub fn proxy_create_args(spec: &RedirectSpec) -> Vec<String> {
    vec![
        "create".into(),
        "-l".into(),
        format!("0.0.0.0:{}", spec.listen_port),
        "-u".into(),
        format!("{}:{}", spec.target_host, spec.target_port),
        PROXY_NAME.into(),
    ]
}

fn attr(args: &mut Vec<String>, key: &str, value: impl std::fmt::Display) {
    args.push("-a".into());
    args.push(format!("{key}={value}"));
}

/// `toxiproxy-cli toxic add` arguments for one toxic.
pub fn toxic_args(toxic: &Toxic, toxicity: u8) -> Vec<String> {
    let mut args = vec![
        "toxic".to_string(),
        "add".to_string(),
        "-t".to_string(),
        toxic.type_name().to_string(),
    ];
    match toxic {
        Toxic::Latency { latency_ms } => attr(&mut args, "latency", latency_ms),
        Toxic::StatusCode {
            code,
            modify_body,
            body,
            content_type,
            content_encoding,
        } => {
            attr(&mut args, "status_code", code);
            attr(&mut args, "modify_response_body", u8::from(*modify_body));
            attr(&mut args, "response_body", body);
            attr(&mut args, "content_type", content_type);
            attr(&mut args, "content_encoding", content_encoding);
        }
        Toxic::ModifyBody {
            body,
            content_type,
            content_encoding,
        } => {
            attr(&mut args, "body", body);
            attr(&mut args, "content_type", content_type);
            attr(&mut args, "content_encoding", content_encoding);
        }
        Toxic::Header {
            stream,
            headers,
            mode,
        } => {
            args.push(match stream {
                HeaderStream::Upstream => "--upstream".into(),
                HeaderStream::Downstream => "--downstream".into(),
            });
            attr(&mut args, "headers", headers);
            attr(&mut args, "mode", mode);
        }
        Toxic::ResetPeer { timeout_ms } => attr(&mut args, "timeout", timeout_ms),
    }
    args.push("--toxicity".into());
    args.push(format!("{:.2}", f32::from(toxicity.min(100)) / 100.0));
    args.push(PROXY_NAME.into());
    args
}

// ── Disk fill ───────────────────────────────────────────────────────

/// `dd` arguments writing `spec.mebibytes` into `path`.
pub fn disk_fill_args(spec: &DiskFillSpec, path: &str) -> Vec<String> {
    let bs = spec.block_kib.max(1);
    let count = (spec.mebibytes * 1024).div_ceil(bs);
    vec![
        "if=/dev/urandom".into(),
        format!("of={path}"),
        format!("bs={bs}K"),
        format!("count={count}"),
    ]
}
