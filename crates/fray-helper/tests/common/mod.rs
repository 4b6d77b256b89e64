//! A throwaway network namespace for tests that drive real tools.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use fray_common::Target;
use fray_helper::cgroup::CgroupManager;
use fray_helper::locator::ResolvedTarget;
use fray_netns::test_util::check_privileges;
use fray_netns::{NsExec, SystemRunner};

/// A `sleep` holding its own network namespace, killed on drop.
pub struct Sandbox {
    child: Child,
}

impl Sandbox {
    /// `None` when the host lacks the privileges to create namespaces.
    pub fn start() -> Option<Sandbox> {
        if !check_privileges() {
            eprintln!("Skipping test: requires netns privileges");
            return None;
        }
        let child = Command::new("unshare")
            .args(["--net", "sleep", "30"])
            .spawn()
            .expect("spawn unshare");
        let sandbox = Sandbox { child };
        let own = std::fs::read_link("/proc/self/ns/net").unwrap();
        for _ in 0..200 {
            if sandbox.netns().is_some_and(|ns| ns != own) {
                return Some(sandbox);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("sandbox never entered its own namespace");
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn netns(&self) -> Option<PathBuf> {
        netns_of(self.pid())
    }

    pub fn resolved(&self) -> ResolvedTarget {
        ResolvedTarget {
            target: Target::new("sandbox", "live", "sleep"),
            container_id: "live".into(),
            pid: self.pid(),
            sandbox_pid: None,
            cgroup: CgroupManager::V2 {
                root: PathBuf::from("/sys/fs/cgroup"),
                group: "/".into(),
            },
            netns_path: PathBuf::from(format!("/proc/{}/ns/net", self.pid())),
        }
    }

    pub async fn qdiscs(&self) -> String {
        let args: Vec<String> = ["qdisc", "show", "dev", "lo"].map(String::from).to_vec();
        NsExec::new(SystemRunner, self.pid())
            .exec_checked("tc", &args)
            .await
            .unwrap()
            .stdout
    }

    pub fn is_running(&self) -> bool {
        alive(self.pid())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn netns_of(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/ns/net")).ok()
}

pub fn alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Poll until `pid` is gone, giving up after two seconds.
pub async fn wait_gone(pid: u32) -> bool {
    for _ in 0..100 {
        if !alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
