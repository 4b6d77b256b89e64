//! Kernel-command plumbing for the fray helper.
//!
//! Provides the [`CommandRunner`](runner::CommandRunner) capability that every
//! shell-out goes through, PID-based network namespace entry, and pure
//! argument builders for `tc netem` and `iptables` rules.

pub mod iptables;
pub mod namespace;
pub mod netem;
pub mod runner;

#[doc(hidden)]
pub mod test_util;

pub use namespace::NsExec;
pub use runner::{CommandOutput, CommandRunner, RecordingRunner, SystemRunner};
