//! Helper configuration.
//!
//! [`HelperConfigInput`] is the loose, all-optional shape read from TOML or
//! from a flat key-value map (the environment handed over by the
//! orchestrator). [`HelperConfigInput::resolve`] validates it into a
//! [`HelperConfig`] with every default applied.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use fray_common::fault::{
    DiskFillSpec, FaultKind, HeaderStream, KillSpec, NetworkRuleKind, NetworkRuleSpec,
    PortFilter, RedirectSpec, StressKind, StressSpec, Toxic, TrafficFilter,
};
use fray_common::{FaultError, FaultSpec, RuntimeKind, Target};

use crate::controller::{ControllerConfig, ExecutionMode, RetryPolicy};

pub const DEFAULT_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_INTERFACE: &str = "eth0";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HelperConfigInput {
    /// `pod:namespace:container;…`
    pub targets: String,
    pub duration_secs: Option<u64>,
    pub interval_secs: Option<u64>,
    pub sequence: Option<String>,
    pub runtime: RuntimeConfigInput,
    pub result: ResultConfigInput,
    pub retry: RetryConfigInput,
    pub probe: ProbeConfigInput,
    pub host: HostConfigInput,
    pub fault: FaultConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfigInput {
    pub kind: Option<String>,
    pub socket_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultConfigInput {
    pub name: String,
    pub chaos_namespace: String,
    /// JSON-lines file that receives every annotation.
    pub sink: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfigInput {
    pub attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProbeConfigInput {
    pub address: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfigInput {
    pub proc_root: Option<String>,
    pub cgroup_root: Option<String>,
}

/// Fault parameters. Only the ones relevant to `kind` are read.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FaultConfigInput {
    pub kind: String,

    // stress
    pub cpu_cores: Option<u32>,
    pub cpu_load: Option<u32>,
    pub memory_consumption_mib: Option<u32>,
    pub workers: Option<u32>,
    pub filesystem_utilization_percentage: Option<u32>,
    pub volume_mount_path: Option<String>,

    // network rules
    pub interface: Option<String>,
    pub latency_ms: Option<u32>,
    pub jitter_ms: Option<u32>,
    pub packet_loss_percentage: Option<f32>,
    pub packet_duplication_percentage: Option<f32>,
    pub packet_corruption_percentage: Option<f32>,
    pub bandwidth_kbit: Option<u64>,
    pub destination_ips: Option<String>,
    pub destination_ports: Option<String>,
    pub source_ports: Option<String>,

    // http
    pub proxy_port: Option<u16>,
    pub target_service_port: Option<u16>,
    pub target_host: Option<String>,
    pub toxicity: Option<u8>,
    pub status_code: Option<u16>,
    pub modify_response_body: Option<bool>,
    pub response_body: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers_map: Option<String>,
    pub header_mode: Option<String>,
    pub header_stream: Option<String>,
    pub reset_timeout_ms: Option<u32>,

    // kill
    pub signal: Option<String>,

    // disk fill
    pub fill_mib: Option<u64>,
    pub block_size_kib: Option<u64>,
    pub fill_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub address: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HelperConfig {
    pub targets: Vec<Target>,
    pub fault: FaultSpec,
    pub runtime: RuntimeKind,
    pub socket_path: String,
    pub controller: ControllerConfig,
    pub probe: Option<ProbeConfig>,
    pub result_sink: Option<PathBuf>,
    pub proc_root: PathBuf,
    pub cgroup_root: PathBuf,
}

// ── Flat key-value input ────────────────────────────────────────────

fn text(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn num<T: FromStr>(map: &HashMap<String, String>, key: &str) -> Result<Option<T>, FaultError> {
    match text(map, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| FaultError::InvalidConfig(format!("{key}: invalid value '{raw}'"))),
        None => Ok(None),
    }
}

impl HelperConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, FaultError> {
        toml::from_str(input)
            .map_err(|e| FaultError::InvalidConfig(format!("invalid config TOML: {e}")))
    }

    /// Build the input from the orchestrator's flat key-value map.
    pub fn from_env_map(map: &HashMap<String, String>) -> Result<Self, FaultError> {
        Ok(Self {
            targets: text(map, "TARGETS").unwrap_or_default(),
            duration_secs: num(map, "TOTAL_CHAOS_DURATION")?,
            interval_secs: num(map, "CHAOS_INTERVAL")?,
            sequence: text(map, "SEQUENCE"),
            runtime: RuntimeConfigInput {
                kind: text(map, "CONTAINER_RUNTIME"),
                socket_path: text(map, "SOCKET_PATH"),
            },
            result: ResultConfigInput {
                name: text(map, "RESULT_NAME").unwrap_or_default(),
                chaos_namespace: text(map, "CHAOS_NAMESPACE").unwrap_or_default(),
                sink: text(map, "RESULT_SINK"),
            },
            retry: RetryConfigInput {
                attempts: num(map, "REVERT_ATTEMPTS")?,
                backoff_ms: num(map, "REVERT_BACKOFF_MS")?,
            },
            probe: ProbeConfigInput {
                address: text(map, "PROBE_ADDRESS"),
                timeout_ms: num(map, "PROBE_TIMEOUT_MS")?,
            },
            host: HostConfigInput {
                proc_root: text(map, "PROC_ROOT"),
                cgroup_root: text(map, "CGROUP_ROOT"),
            },
            fault: FaultConfigInput {
                kind: text(map, "FAULT").unwrap_or_default(),
                cpu_cores: num(map, "CPU_CORES")?,
                cpu_load: num(map, "CPU_LOAD")?,
                memory_consumption_mib: num(map, "MEMORY_CONSUMPTION")?,
                workers: num(map, "NUMBER_OF_WORKERS")?,
                filesystem_utilization_percentage: num(map, "FILESYSTEM_UTILIZATION_PERCENTAGE")?,
                volume_mount_path: text(map, "VOLUME_MOUNT_PATH"),
                interface: text(map, "NETWORK_INTERFACE"),
                latency_ms: num(map, "NETWORK_LATENCY")?,
                jitter_ms: num(map, "JITTER")?,
                packet_loss_percentage: num(map, "NETWORK_PACKET_LOSS_PERCENTAGE")?,
                packet_duplication_percentage: num(map, "NETWORK_PACKET_DUPLICATION_PERCENTAGE")?,
                packet_corruption_percentage: num(map, "NETWORK_PACKET_CORRUPTION_PERCENTAGE")?,
                bandwidth_kbit: num(map, "NETWORK_BANDWIDTH_KBIT")?,
                destination_ips: text(map, "DESTINATION_IPS"),
                destination_ports: text(map, "DESTINATION_PORTS"),
                source_ports: text(map, "SOURCE_PORTS"),
                proxy_port: num(map, "PROXY_PORT")?,
                target_service_port: num(map, "TARGET_SERVICE_PORT")?,
                target_host: text(map, "TARGET_HOST"),
                toxicity: num(map, "TOXICITY")?,
                status_code: num(map, "STATUS_CODE")?,
                modify_response_body: num(map, "MODIFY_RESPONSE_BODY")?,
                response_body: text(map, "RESPONSE_BODY"),
                content_type: text(map, "CONTENT_TYPE"),
                content_encoding: text(map, "CONTENT_ENCODING"),
                headers_map: text(map, "HEADERS_MAP"),
                header_mode: text(map, "HEADER_MODE"),
                header_stream: text(map, "HEADERS_STREAM"),
                reset_timeout_ms: num(map, "RESET_TIMEOUT")?,
                signal: text(map, "SIGNAL"),
                fill_mib: match num(map, "FILL_MIB")? {
                    Some(v) => Some(v),
                    None => num(map, "EPHEMERAL_STORAGE_MEBIBYTES")?,
                },
                block_size_kib: num(map, "DATA_BLOCK_SIZE")?,
                fill_path: text(map, "FILL_PATH"),
            },
        })
    }

    pub fn resolve(self) -> Result<HelperConfig, FaultError> {
        let targets = Target::parse_list(&self.targets)?;

        let duration = match self.duration_secs {
            Some(0) => {
                return Err(FaultError::InvalidConfig("chaos duration must be positive".into()));
            }
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_DURATION,
        };
        let hold_interval = self
            .interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs);

        let mut fault = FaultSpec::new(self.fault.resolve()?, duration);
        if let Some(interval) = hold_interval {
            fault = fault.with_interval(interval);
        }

        let runtime = match self.runtime.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => RuntimeKind::Containerd,
        };
        let socket_path = self
            .runtime
            .socket_path
            .unwrap_or_else(|| runtime.default_socket().to_string());

        let mode = match self.sequence.as_deref() {
            Some(s) => s.parse()?,
            None => ExecutionMode::default(),
        };
        let default_retry = RetryPolicy::default();
        let retry = RetryPolicy {
            attempts: self.retry.attempts.unwrap_or(default_retry.attempts).max(1),
            backoff: self
                .retry
                .backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(default_retry.backoff),
        };

        let controller = ControllerConfig {
            duration,
            hold_interval,
            mode,
            retry,
            result_id: self.result.name,
            chaos_namespace: self.result.chaos_namespace,
        };

        let probe = self.probe.address.map(|address| ProbeConfig {
            address,
            timeout: self
                .probe
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        });

        Ok(HelperConfig {
            targets,
            fault,
            runtime,
            socket_path,
            controller,
            probe,
            result_sink: self.result.sink.map(PathBuf::from),
            proc_root: PathBuf::from(self.host.proc_root.as_deref().unwrap_or("/proc")),
            cgroup_root: PathBuf::from(self.host.cgroup_root.as_deref().unwrap_or("/sys/fs/cgroup")),
        })
    }
}

fn percent(value: Option<f32>, default: f32, what: &str) -> Result<f32, FaultError> {
    let v = value.unwrap_or(default);
    if !(0.0..=100.0).contains(&v) {
        return Err(FaultError::InvalidConfig(format!("{what} must be within 0..=100, got {v}")));
    }
    Ok(v)
}

impl FaultConfigInput {
    fn filter(&self) -> Result<TrafficFilter, FaultError> {
        let ports = |raw: &Option<String>| -> Result<PortFilter, FaultError> {
            raw.as_deref()
                .map_or(Ok(PortFilter::default()), str::parse::<PortFilter>)
        };
        Ok(TrafficFilter {
            destination_ips: self
                .destination_ips
                .as_deref()
                .map(TrafficFilter::parse_ips)
                .unwrap_or_default(),
            destination_ports: ports(&self.destination_ports)?,
            source_ports: ports(&self.source_ports)?,
        })
    }

    fn interface(&self) -> String {
        self.interface
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string())
    }

    fn network(&self, kind: NetworkRuleKind) -> Result<FaultKind, FaultError> {
        Ok(FaultKind::NetworkRule(NetworkRuleSpec {
            kind,
            interface: self.interface(),
            filter: self.filter()?,
        }))
    }

    fn http(&self, toxic: Toxic) -> Result<FaultKind, FaultError> {
        let toxicity = self.toxicity.unwrap_or(100);
        if toxicity > 100 {
            return Err(FaultError::InvalidConfig(format!(
                "toxicity must be within 0..=100, got {toxicity}"
            )));
        }
        Ok(FaultKind::TrafficRedirect(RedirectSpec {
            interface: self.interface(),
            listen_port: self.proxy_port.unwrap_or(20000),
            target_host: self
                .target_host
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            target_port: self.target_service_port.unwrap_or(80),
            toxicity,
            toxics: vec![toxic],
        }))
    }

    fn body_fields(&self) -> (String, String, String) {
        (
            self.response_body.clone().unwrap_or_default(),
            self.content_type
                .clone()
                .unwrap_or_else(|| "text/plain".to_string()),
            self.content_encoding.clone().unwrap_or_default(),
        )
    }

    fn stress(&self, kind: StressKind, workers: u32, intensity: u32) -> FaultKind {
        FaultKind::ResourceStress(StressSpec {
            kind,
            workers,
            intensity,
            volume_path: self.volume_mount_path.clone(),
        })
    }

    pub fn resolve(&self) -> Result<FaultKind, FaultError> {
        match self.kind.trim() {
            "cpu" => Ok(self.stress(
                StressKind::Cpu,
                self.cpu_cores.unwrap_or(1),
                self.cpu_load.unwrap_or(100).min(100),
            )),
            "memory" => Ok(self.stress(
                StressKind::Memory,
                self.workers.unwrap_or(1),
                self.memory_consumption_mib.unwrap_or(500),
            )),
            "io" => Ok(self.stress(
                StressKind::Io,
                self.workers.unwrap_or(4),
                self.filesystem_utilization_percentage.unwrap_or(10).min(100),
            )),
            "network-latency" => self.network(NetworkRuleKind::Latency {
                latency_ms: self.latency_ms.unwrap_or(2000),
                jitter_ms: self.jitter_ms.unwrap_or(0),
            }),
            "network-loss" => self.network(NetworkRuleKind::Loss {
                percent: percent(self.packet_loss_percentage, 100.0, "packet loss")?,
            }),
            "network-duplication" => self.network(NetworkRuleKind::Duplication {
                percent: percent(self.packet_duplication_percentage, 100.0, "packet duplication")?,
            }),
            "network-corruption" => self.network(NetworkRuleKind::Corruption {
                percent: percent(self.packet_corruption_percentage, 100.0, "packet corruption")?,
            }),
            "network-rate" => match self.bandwidth_kbit {
                Some(kbit) if kbit > 0 => self.network(NetworkRuleKind::Rate { kbit }),
                _ => Err(FaultError::InvalidConfig(
                    "network-rate needs a positive bandwidth".into(),
                )),
            },
            "network-partition" => self.network(NetworkRuleKind::Partition),
            "http-latency" => self.http(Toxic::Latency {
                latency_ms: self.latency_ms.unwrap_or(2000),
            }),
            "http-status-code" => {
                let code = self.status_code.unwrap_or(500);
                if !(200..=599).contains(&code) {
                    return Err(FaultError::InvalidConfig(format!(
                        "status code {code} out of range"
                    )));
                }
                let (body, content_type, content_encoding) = self.body_fields();
                self.http(Toxic::StatusCode {
                    code,
                    modify_body: self.modify_response_body.unwrap_or(true),
                    body,
                    content_type,
                    content_encoding,
                })
            }
            "http-modify-body" => {
                let (body, content_type, content_encoding) = self.body_fields();
                self.http(Toxic::ModifyBody {
                    body,
                    content_type,
                    content_encoding,
                })
            }
            "http-header" => {
                let stream = match self.header_stream.as_deref().unwrap_or("response") {
                    "request" | "upstream" => HeaderStream::Upstream,
                    "response" | "downstream" => HeaderStream::Downstream,
                    other => {
                        return Err(FaultError::InvalidConfig(format!(
                            "unknown header stream '{other}'"
                        )));
                    }
                };
                self.http(Toxic::Header {
                    stream,
                    headers: self.headers_map.clone().unwrap_or_else(|| "{}".to_string()),
                    mode: self.header_mode.clone().unwrap_or_else(|| "add".to_string()),
                })
            }
            "http-reset-peer" => self.http(Toxic::ResetPeer {
                timeout_ms: self.reset_timeout_ms.unwrap_or(0),
            }),
            "container-kill" => Ok(FaultKind::ProcessKill(KillSpec {
                signal: self.signal.clone().unwrap_or_else(|| "SIGKILL".to_string()),
            })),
            "disk-fill" => match self.fill_mib {
                Some(mebibytes) if mebibytes > 0 => Ok(FaultKind::DiskFill(DiskFillSpec {
                    mebibytes,
                    block_kib: self.block_size_kib.unwrap_or(256).max(1),
                    path: self.fill_path.clone().unwrap_or_else(|| "/".to_string()),
                })),
                _ => Err(FaultError::InvalidConfig(
                    "disk-fill needs a positive fill size".into(),
                )),
            },
            "" => Err(FaultError::InvalidConfig("no fault kind given".into())),
            other => Err(FaultError::InvalidConfig(format!("unknown fault kind '{other}'"))),
        }
    }
}
