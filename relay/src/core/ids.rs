//! Identifier generation and the deterministic id -> branch mapping.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use rand::Rng;
use regex::Regex;

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("id pattern should be valid")
});

/// Prefix shared by every task branch.
pub const BRANCH_PREFIX: &str = "task/";

/// Generate a fresh 8-character lowercase hex id.
pub fn new_id() -> String {
    let value: u32 = rand::thread_rng().r#gen();
    format!("{value:08x}")
}

/// Reject ids that could escape the state directories or form odd refs.
pub fn validate_id(id: &str) -> Result<()> {
    if ID_RE.is_match(id) {
        return Ok(());
    }
    Err(anyhow!(
        "invalid id '{id}' (expected lowercase alphanumerics, '-' or '_')"
    ))
}

/// Branch owned by a task's workspace.
pub fn branch_name(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..32 {
            let id = new_id();
            assert_eq!(id.len(), 8);
            validate_id(&id).expect("valid id");
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id("Upper").is_err());
    }

    #[test]
    fn branch_is_derived_from_id() {
        assert_eq!(branch_name("abc123"), "task/abc123");
    }
}
