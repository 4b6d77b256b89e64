//! `tc` argument builders for netem shaping.
//!
//! Two layouts are produced:
//!
//! - **root**: `tc qdisc replace dev IF root netem …` shapes everything.
//! - **classful**: a `prio` root with netem hung on band 3 and u32 filters
//!   steering selected traffic into that band. Whitelisted ports are
//!   steered into the untouched band 2 ahead of a catch-all into band 3.

/// Network impairment parameters applied via `tc netem`.
///
/// Only non-`None` parameters are passed to netem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetemConfig {
    pub delay_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub loss_percent: Option<f32>,
    pub duplicate_percent: Option<f32>,
    pub corrupt_percent: Option<f32>,
    /// Bandwidth cap. Also bounds the netem queue, see [`Self::effective_limit`].
    pub rate_kbit: Option<u64>,
}

impl NetemConfig {
    /// Queue limit in packets when rate-limited: twice the bandwidth-delay
    /// product, never below 20. Unbounded queues would hold excess packets
    /// for the whole episode.
    pub fn effective_limit(&self) -> Option<u32> {
        let rate = self.rate_kbit?;
        let rtt_ms = self.delay_ms.unwrap_or(20) as u64 * 2;
        let bdp_bytes = rate * 1000 / 8 * rtt_ms / 1000;
        let bdp_packets = (bdp_bytes / 1400) as u32;
        Some(std::cmp::max(bdp_packets * 2, 20))
    }
}

/// Appends the set netem parameters to an arg list, `limit` first.
pub fn append_netem_params(config: &NetemConfig, args: &mut Vec<String>) {
    if let Some(lim) = config.effective_limit() {
        args.push("limit".into());
        args.push(lim.to_string());
    }

    if let Some(delay) = config.delay_ms {
        args.push("delay".into());
        args.push(format!("{}ms", delay));

        if let Some(jitter) = config.jitter_ms
            && jitter > 0
        {
            args.push(format!("{jitter}ms"));
        }
    }

    if let Some(loss) = config.loss_percent {
        args.push("loss".into());
        args.push(format!("{}%", loss));
    }

    if let Some(dup) = config.duplicate_percent {
        args.push("duplicate".into());
        args.push(format!("{}%", dup));
    }

    if let Some(corrupt) = config.corrupt_percent {
        args.push("corrupt".into());
        args.push(format!("{}%", corrupt));
    }

    if let Some(rate) = config.rate_kbit {
        args.push("rate".into());
        args.push(format!("{}kbit", rate));
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `qdisc replace dev IF root netem …`
pub fn root_netem_args(interface: &str, config: &NetemConfig) -> Vec<String> {
    let mut args = strings(&["qdisc", "replace", "dev", interface, "root", "netem"]);
    append_netem_params(config, &mut args);
    args
}

/// `qdisc replace dev IF root handle 1: prio`
pub fn prio_root_args(interface: &str) -> Vec<String> {
    strings(&["qdisc", "replace", "dev", interface, "root", "handle", "1:", "prio"])
}

/// `qdisc replace dev IF parent 1:3 netem …`
pub fn band_netem_args(interface: &str, config: &NetemConfig) -> Vec<String> {
    let mut args = strings(&["qdisc", "replace", "dev", interface, "parent", "1:3", "netem"]);
    append_netem_params(config, &mut args);
    args
}

/// `qdisc delete dev IF root`; removes whichever root layout is installed.
pub fn delete_root_args(interface: &str) -> Vec<String> {
    strings(&["qdisc", "delete", "dev", interface, "root"])
}

/// What a u32 filter matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMatch {
    /// Destination address or CIDR; IPv6 when it contains a `:`.
    Destination(String),
    DestinationPort(u16),
    SourcePort(u16),
    /// Every IPv4 packet.
    Any,
}

/// Band the shaped traffic lands in.
pub const SHAPED_BAND: u8 = 3;
/// Band that bypasses netem.
pub const BYPASS_BAND: u8 = 2;

/// `filter add dev IF protocol ip parent 1:0 prio B u32 match … flowid 1:B`
pub fn filter_args(interface: &str, band: u8, matcher: &FilterMatch) -> Vec<String> {
    let ipv6 = matches!(matcher, FilterMatch::Destination(ip) if ip.contains(':'));
    let mut args = strings(&[
        "filter",
        "add",
        "dev",
        interface,
        "protocol",
        if ipv6 { "ipv6" } else { "ip" },
        "parent",
        "1:0",
        "prio",
    ]);
    args.push(band.to_string());
    args.push("u32".into());
    args.push("match".into());
    match matcher {
        FilterMatch::Destination(ip) => {
            args.push(if ipv6 { "ip6" } else { "ip" }.into());
            args.push("dst".into());
            args.push(ip.clone());
        }
        FilterMatch::DestinationPort(port) => {
            args.extend(strings(&["ip", "dport", &port.to_string(), "0xffff"]));
        }
        FilterMatch::SourcePort(port) => {
            args.extend(strings(&["ip", "sport", &port.to_string(), "0xffff"]));
        }
        FilterMatch::Any => {
            args.extend(strings(&["ip", "dst", "0.0.0.0/0"]));
        }
    }
    args.push("flowid".into());
    args.push(format!("1:{band}"));
    args
}

/// Whether `tc` stderr means the root qdisc was already gone. A vanished
/// interface counts: its qdiscs went with it.
pub fn is_already_absent(stderr: &str) -> bool {
    stderr.contains("Cannot delete qdisc with handle of zero")
        || stderr.contains("RTNETLINK answers: No such file or directory")
        || stderr.contains("Cannot find device")
}
