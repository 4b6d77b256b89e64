//! Prefixed ID generation.
//!
//! Episode and run IDs use a `prefix_` followed by a UUIDv7 (time-ordered),
//! so log lines from consecutive episodes sort by creation time and are
//! instantly identifiable by type.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate an episode ID: `epi_<uuid7>`
pub fn episode_id() -> String {
    prefixed_id("epi")
}

/// Generate a run ID: `run_<uuid7>`
pub fn run_id() -> String {
    prefixed_id("run")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_correct_prefix() {
        assert!(episode_id().starts_with("epi_"));
        assert!(run_id().starts_with("run_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = episode_id();
        let b = episode_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_sortable_by_time() {
        let a = episode_id();
        let b = episode_id();
        assert!(b > a, "Expected {b} > {a}");
    }
}
