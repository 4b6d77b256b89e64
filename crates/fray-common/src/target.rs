//! Logical target identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FaultError;

/// A container addressed by its orchestrator identity.
///
/// This is what target discovery hands the helper. OS-level handles (PID,
/// cgroup, network namespace) are resolved later by the locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl Target {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    /// Parse a `pod:namespace:container;pod:namespace:container` list.
    ///
    /// Empty segments (trailing `;`) are ignored. Any segment without
    /// exactly three non-empty fields is rejected.
    pub fn parse_list(input: &str) -> Result<Vec<Target>, FaultError> {
        let mut out = Vec::new();
        for segment in input.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let fields: Vec<&str> = segment.split(':').map(str::trim).collect();
            if fields.len() != 3 || fields.iter().any(|f| f.is_empty()) {
                return Err(FaultError::InvalidConfig(format!(
                    "unsupported target format: '{segment}'"
                )));
            }
            out.push(Target::new(fields[1], fields[0], fields[2]));
        }
        if out.is_empty() {
            return Err(FaultError::InvalidConfig(
                "no target found, provide at least one target".into(),
            ));
        }
        Ok(out)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Container runtime flavour on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Containerd,
    Crio,
}

impl RuntimeKind {
    /// Default runtime socket for this flavour.
    pub fn default_socket(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "/run/docker.sock",
            RuntimeKind::Containerd => "/run/containerd/containerd.sock",
            RuntimeKind::Crio => "/run/crio/crio.sock",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Containerd => write!(f, "containerd"),
            RuntimeKind::Crio => write!(f, "crio"),
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "docker" => Ok(RuntimeKind::Docker),
            "containerd" => Ok(RuntimeKind::Containerd),
            "crio" | "cri-o" => Ok(RuntimeKind::Crio),
            other => Err(FaultError::UnsupportedRuntime(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_list() {
        let targets = Target::parse_list("web-0:shop:nginx;db-1:shop:postgres;").unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], Target::new("shop", "web-0", "nginx"));
        assert_eq!(targets[1].container, "postgres");
    }

    #[test]
    fn reject_malformed_target() {
        let err = Target::parse_list("web-0:shop").unwrap_err();
        assert!(matches!(err, FaultError::InvalidConfig(_)));
        assert!(Target::parse_list(" ; ").is_err());
        assert!(Target::parse_list("a::c").is_err());
    }

    #[test]
    fn runtime_kind_round_trips_through_display() {
        for kind in [RuntimeKind::Docker, RuntimeKind::Containerd, RuntimeKind::Crio] {
            assert_eq!(kind.to_string().parse::<RuntimeKind>().unwrap(), kind);
        }
        assert!(matches!(
            "rkt".parse::<RuntimeKind>(),
            Err(FaultError::UnsupportedRuntime(_))
        ));
    }
}
