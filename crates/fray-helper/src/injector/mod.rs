//! Fault injectors.
//!
//! An injector turns a resolved target into an opaque per-episode handle
//! and installs, pulses and reverts the fault through it. The controller is
//! generic over [`Injector`] and owns every handle exclusively.
//!
//! Handles track partial progress: `inject` records each mutation as it is
//! made, so `revert` after a failed `inject` undoes exactly what was done,
//! and a second `revert` finds nothing left to undo.

pub mod disk;
pub mod kill;
pub mod network;
pub mod proxy;
pub mod stress;

use std::future::Future;

use fray_common::{FaultError, Target};

use crate::locator::ResolvedTarget;

pub use disk::DiskFillInjector;
pub use kill::ProcessKillInjector;
pub use network::NetworkRuleInjector;
pub use proxy::TrafficRedirectInjector;
pub use stress::StressInjector;

/// Common surface of every per-episode handle.
pub trait InjectionHandle: Send {
    fn target(&self) -> &Target;
}

pub trait Injector: Send + Sync {
    type Handle: InjectionHandle;

    /// Build the handle for one episode. Performs no mutation.
    fn prepare(&self, target: &ResolvedTarget) -> Result<Self::Handle, FaultError>;

    /// Install the fault.
    fn inject(&self, handle: &mut Self::Handle)
    -> impl Future<Output = Result<(), FaultError>> + Send;

    /// Undo whatever `inject` installed. Idempotent.
    fn revert(&self, handle: &mut Self::Handle)
    -> impl Future<Output = Result<(), FaultError>> + Send;

    /// Called every hold interval while the fault is held.
    fn pulse(
        &self,
        _handle: &mut Self::Handle,
    ) -> impl Future<Output = Result<(), FaultError>> + Send {
        async { Ok(()) }
    }

    /// Resolves if the injected workload ends on its own during the hold,
    /// with a description of how. Faults without a workload never resolve.
    fn exited(&self, _handle: &mut Self::Handle) -> impl Future<Output = String> + Send {
        std::future::pending()
    }
}
