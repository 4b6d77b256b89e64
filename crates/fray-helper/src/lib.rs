//! In-target fault injection engine.
//!
//! Resolves a container to its OS handles, installs a fault through kernel
//! primitives (cgroups, network namespaces, a traffic proxy), holds it while
//! listening for abort, and reverts it exactly once on every exit path.
//!
//! - [`locator`]: runtime inspection to PID, sandbox PID and cgroup
//! - [`cgroup`] / [`workload`]: stopped spawn, cgroup join, resume, group kill
//! - [`injector`]: stress, network rules, HTTP proxy, container kill, disk fill
//! - [`compose`]: pure construction of commands and rule plans
//! - [`controller`]: the per-episode lifecycle state machine
//! - [`abort`], [`reporter`], [`probe`], [`config`]: collaborators at the edges

pub mod abort;
pub mod cgroup;
pub mod compose;
pub mod config;
pub mod controller;
pub mod injector;
pub mod locator;
pub mod probe;
pub mod procfs;
pub mod reporter;
pub mod workload;
