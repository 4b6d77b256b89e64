//! Result reporting at the injected and reverted checkpoints.
//!
//! Annotating is idempotent and its failure is never fatal: the controller
//! logs it and carries on with teardown.

use std::future::Future;
use std::path::PathBuf;

use serde::Serialize;
use tokio::io::AsyncWriteExt;

use fray_common::{FaultError, Phase, Target};

/// Kind of object the helper faults.
pub const TARGET_KIND: &str = "pod";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub result_id: String,
    pub namespace: String,
    pub phase: Phase,
    pub target_kind: String,
    pub target_name: String,
}

impl Annotation {
    pub fn new(result_id: &str, namespace: &str, phase: Phase, target: &Target) -> Self {
        Self {
            result_id: result_id.to_string(),
            namespace: namespace.to_string(),
            phase,
            target_kind: TARGET_KIND.to_string(),
            target_name: target.pod.clone(),
        }
    }
}

pub trait ResultReporter: Send + Sync {
    fn annotate(&self, annotation: &Annotation)
    -> impl Future<Output = Result<(), FaultError>> + Send;
}

/// Logs annotations and optionally appends them as JSON lines to a file.
#[derive(Debug, Clone, Default)]
pub struct LogReporter {
    sink: Option<PathBuf>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink = Some(path.into());
        self
    }
}

impl ResultReporter for LogReporter {
    async fn annotate(&self, annotation: &Annotation) -> Result<(), FaultError> {
        tracing::info!(
            result = %annotation.result_id,
            namespace = %annotation.namespace,
            phase = annotation.phase.as_str(),
            kind = %annotation.target_kind,
            name = %annotation.target_name,
            "result annotated"
        );
        let Some(path) = &self.sink else {
            return Ok(());
        };
        let mut line = serde_json::to_string(annotation)
            .map_err(|e| FaultError::InvalidConfig(format!("annotation encoding: {e}")))?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
