use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we can create a throwaway network namespace and run `tc`
/// inside it. Returns `false` if the test environment cannot support
/// kernel-level rule tests.
pub fn check_privileges() -> bool {
    match Command::new("unshare")
        .args(["--net", "tc", "qdisc", "show", "dev", "lo"])
        .output()
    {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// Generates a unique name with the given prefix.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel.
pub fn unique_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("{}_{:x}_{}", prefix, pid % 0xFFFF, seq)
}

/// Creates a fresh empty directory under the system temp dir.
pub fn scratch_dir(prefix: &str) -> std::io::Result<PathBuf> {
    let dir = std::env::temp_dir().join(unique_name(prefix));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
