//! Parsers for the `/proc/<pid>` files the helper reads.
//!
//! All functions here are pure over file contents so they can be tested
//! without a live process; the callers do the reading.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcfsError {
    #[error("invalid cgroup entry: {0:?}")]
    InvalidCgroupEntry(String),
    #[error("no unified (0::) entry in cgroup file")]
    NoUnifiedEntry,
    #[error("no cgroup mount found for subsystem {0}")]
    NoMountFor(String),
    #[error("malformed stat line: {0:?}")]
    MalformedStat(String),
}

/// Parse `/proc/<pid>/cgroup` into a controller → path map.
///
/// Each line is `hierarchy-ID:controller-list:path`. A controller list like
/// `cpu,cpuacct` yields one entry per controller. The unified hierarchy line
/// (`0::/path`) has an empty list and contributes nothing here; see
/// [`unified_path`].
pub fn parse_cgroup_file(content: &str) -> Result<BTreeMap<String, String>, ProcfsError> {
    let mut out = BTreeMap::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() < 3 {
            return Err(ProcfsError::InvalidCgroupEntry(line.to_string()));
        }
        for subsystem in parts[1].split(',').filter(|s| !s.is_empty()) {
            out.insert(subsystem.to_string(), parts[2].to_string());
        }
    }
    Ok(out)
}

/// The cgroup v2 group path from a `0::/path` line.
pub fn unified_path(content: &str) -> Result<String, ProcfsError> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("0::"))
        .map(|p| p.trim().to_string())
        .ok_or(ProcfsError::NoUnifiedEntry)
}

/// Mount root (field 4) of the cgroup mount whose super options include
/// `subsystem`, from `/proc/<pid>/mountinfo`.
pub fn cgroup_mount_root(mountinfo: &str, subsystem: &str) -> Option<String> {
    for line in mountinfo.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(options) = fields.last() else {
            continue;
        };
        if fields.len() < 5 {
            continue;
        }
        if options.split(',').any(|opt| opt == subsystem) {
            return Some(fields[3].to_string());
        }
    }
    None
}

/// Make each subsystem path relative to the mount root the process sees.
///
/// A container with its own cgroup namespace sees its cgroup mounted at
/// `/`, with the mount root naming the real path; then the path in
/// `/proc/<pid>/cgroup` equals the root and the root itself is the answer.
/// Subsystems without a cgroup mount are dropped.
pub fn rebase_on_mounts(
    paths: &BTreeMap<String, String>,
    mountinfo: &str,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (subsystem, path) in paths {
        let Some(root) = cgroup_mount_root(mountinfo, subsystem) else {
            tracing::debug!(subsystem = %subsystem, "no cgroup mount for subsystem, skipping");
            continue;
        };
        let rel = relative_to(Path::new(&root), Path::new(path));
        let rebased = match rel {
            Some(rel) if rel.as_os_str().is_empty() => PathBuf::from(&root),
            Some(rel) => Path::new("/").join(rel),
            None => PathBuf::from(path),
        };
        out.insert(subsystem.clone(), rebased.to_string_lossy().into_owned());
    }
    out
}

fn relative_to(base: &Path, path: &Path) -> Option<PathBuf> {
    let base: Vec<Component> = base.components().collect();
    let path: Vec<Component> = path.components().collect();
    if path.len() < base.len() || path[..base.len()] != base[..] {
        return None;
    }
    Some(path[base.len()..].iter().collect())
}

/// Subsystems probed, in order, when looking for the container's v1 path.
pub const V1_SUBSYSTEMS: &[&str] = &[
    "cpu",
    "memory",
    "systemd",
    "net_cls",
    "net_prio",
    "freezer",
    "blkio",
    "perf_event",
    "devices",
    "cpuset",
    "cpuacct",
    "pids",
    "hugetlb",
];

/// First subsystem path (in [`V1_SUBSYSTEMS`] order) containing the
/// container ID. `systemd` also matches a `name=systemd` entry.
pub fn find_container_path(paths: &BTreeMap<String, String>, container_id: &str) -> Option<String> {
    for subsystem in V1_SUBSYSTEMS {
        let path = paths
            .get(*subsystem)
            .or_else(|| paths.get(&format!("name={subsystem}")));
        if let Some(path) = path
            && path.contains(container_id)
        {
            return Some(path.clone());
        }
    }
    None
}

/// Process state letter from `/proc/<pid>/stat` (`R`, `S`, `T`, `Z`, ...).
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so the state is read after the last `)`.
pub fn stat_state(stat: &str) -> Result<char, ProcfsError> {
    let after = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| ProcfsError::MalformedStat(stat.to_string()))?;
    after
        .split_whitespace()
        .next()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| ProcfsError::MalformedStat(stat.to_string()))
}
