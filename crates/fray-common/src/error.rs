//! Error taxonomy for locating targets, injecting faults and reverting them.

use std::time::Duration;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FaultError {
    #[error("target {target} unavailable: {reason}")]
    TargetUnavailable { target: String, reason: String },
    #[error("unsupported container runtime: {0}")]
    UnsupportedRuntime(String),
    #[error("could not extract pid for container {container_id}: {reason}")]
    PidExtractionFailed {
        container_id: String,
        reason: String,
    },
    #[error("could not join pid {pid} to cgroup: {reason}")]
    CgroupJoinFailed { pid: u32, reason: String },
    #[error("failed to spawn fault process: {0}")]
    ProcessSpawnFailed(String),
    #[error("failed to apply {rule}: {reason}")]
    RuleApplyFailed { rule: String, reason: String },
    #[error("failed to remove {rule}: {reason}")]
    RuleRemoveFailed { rule: String, reason: String },
    #[error("revert of {target} failed after {attempts} attempts: {last}")]
    RevertExhausted {
        target: String,
        attempts: u32,
        last: Box<FaultError>,
    },
    #[error("`{command}` exited with {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("[{}]", join_errors(.0))]
    Aggregate(Vec<FaultError>),
}

fn join_errors(errors: &[FaultError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Which stage of the pipeline produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Target resolution; nothing was mutated.
    Locator,
    /// Installing a fault.
    Injector,
    /// Undoing a fault; retried and aggregated.
    Revert,
    /// The lifecycle controller gave up.
    Controller,
    Config,
    Io,
}

impl FaultError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FaultError::TargetUnavailable { .. }
            | FaultError::UnsupportedRuntime(_)
            | FaultError::PidExtractionFailed { .. } => ErrorClass::Locator,
            FaultError::CgroupJoinFailed { .. }
            | FaultError::ProcessSpawnFailed(_)
            | FaultError::RuleApplyFailed { .. }
            | FaultError::CommandFailed { .. }
            | FaultError::Timeout { .. } => ErrorClass::Injector,
            FaultError::RuleRemoveFailed { .. } | FaultError::Aggregate(_) => ErrorClass::Revert,
            FaultError::RevertExhausted { .. } => ErrorClass::Controller,
            FaultError::InvalidConfig(_) => ErrorClass::Config,
            FaultError::Io(_) => ErrorClass::Io,
        }
    }

    /// Whether kernel state may have been changed before this error surfaced.
    ///
    /// Locator errors and failed spawns/joins leave nothing behind. A failed
    /// rule installation may have applied part of its commands.
    pub fn mutated(&self) -> bool {
        match self {
            FaultError::RuleApplyFailed { .. } => true,
            FaultError::Aggregate(errors) => errors.iter().any(FaultError::mutated),
            _ => false,
        }
    }

    /// Collapse revert-time errors into one.
    ///
    /// Returns `None` for an empty list and the error itself for a list of
    /// one. Nested aggregates are flattened.
    pub fn aggregate(errors: Vec<FaultError>) -> Option<FaultError> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                FaultError::Aggregate(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(FaultError::Aggregate(flat)),
        }
    }
}
