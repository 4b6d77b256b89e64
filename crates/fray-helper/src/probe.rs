//! Mid-injection health probes.

use std::future::Future;
use std::time::Duration;

use fray_common::FaultError;

use crate::locator::ResolvedTarget;

pub trait HealthProbe: Send + Sync {
    fn check(&self, target: &ResolvedTarget)
    -> impl Future<Output = Result<(), FaultError>> + Send;
}

/// No probe configured; always healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl HealthProbe for NoProbe {
    async fn check(&self, _target: &ResolvedTarget) -> Result<(), FaultError> {
        Ok(())
    }
}

/// Checks that a TCP endpoint accepts connections.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    /// `address` may be a bare `host:port` or a URL such as `http://svc:8080/healthz`.
    pub fn new(address: &str, timeout: Duration) -> Self {
        Self {
            address: extract_host(address),
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl HealthProbe for TcpProbe {
    async fn check(&self, _target: &ResolvedTarget) -> Result<(), FaultError> {
        if self.address.is_empty() {
            return Err(FaultError::InvalidConfig("empty probe address".into()));
        }
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(&self.address)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FaultError::Timeout {
                operation: format!("connect {}", self.address),
                after: self.timeout,
            }),
        }
    }
}

/// Extract `host:port` from a URL, dropping scheme and path.
fn extract_host(url: &str) -> String {
    let stripped = url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_start_matches("tcp://");
    stripped.split('/').next().unwrap_or("").to_string()
}
