//! Shared types for the fray fault-injection helper.
//!
//! This crate contains:
//! - **Targets**: logical `{namespace, pod, container}` identities
//! - **Fault specs**: the tagged union of every fault class the helper injects
//! - **Lifecycle**: per-episode states and result-record phases
//! - **Errors**: the injection error taxonomy and revert-time aggregation
//! - **ID generation**: prefixed UUIDv7 episode identifiers

pub mod error;
pub mod fault;
pub mod ids;
pub mod lifecycle;
pub mod target;

pub use error::{ErrorClass, FaultError};
pub use fault::FaultSpec;
pub use lifecycle::{LifecycleState, Phase};
pub use target::{RuntimeKind, Target};
