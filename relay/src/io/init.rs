//! `.relay/` scaffolding for a repository.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RelayConfig, write_config};
use crate::io::git::Git;
use crate::io::mirror::ensure_mirror_dirs;
use crate::io::paths::RelayPaths;
use crate::io::records::write_atomic;

/// Everything under `.relay/` is local state, never committed.
const RELAY_GITIGNORE: &str = "*\n";

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config with the defaults.
    pub force: bool,
}

/// Create `.relay/` in the git repository at `root`.
///
/// Fails if a config already exists unless `options.force` is set. Records
/// and sidecars are never touched.
pub fn init_relay(root: &Path, options: &InitOptions) -> Result<RelayPaths> {
    let git = Git::new(root, Duration::from_secs(30));
    let inside = git.run(&["rev-parse", "--is-inside-work-tree"])?;
    if !inside.success() || inside.stdout_lossy().trim() != "true" {
        return Err(anyhow!(
            "relay init: {} is not a git working tree",
            root.display()
        ));
    }

    let paths = RelayPaths::new(root);
    let config_path = paths.config_path();
    if config_path.exists() && !options.force {
        return Err(anyhow!(
            "relay init: {} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }

    let state_dir = paths.state_dir();
    fs::create_dir_all(&state_dir)
        .with_context(|| format!("create directory {}", state_dir.display()))?;
    write_atomic(&paths.gitignore_path(), RELAY_GITIGNORE)?;
    write_config(&config_path, &RelayConfig::default())?;
    ensure_mirror_dirs(&paths)?;
    Ok(paths)
}
