//! Orchestrator configuration stored under `.relay/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::records::write_atomic;

/// Placeholder in `agent.command` replaced by the rendered prompt.
pub const PROMPT_PLACEHOLDER: &str = "{prompt}";

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Branch every task branch is integrated into.
    pub integration_branch: String,

    /// Remote fetched from and pushed to when `push_to_remote` is set.
    pub remote: String,

    pub push_to_remote: bool,

    /// Upper bound on concurrently running worker pipelines.
    pub max_parallel_workers: usize,

    /// Dispatcher tick interval.
    pub poll_interval_ms: u64,

    pub agent: AgentConfig,
    pub ports: PortConfig,
    pub workspace: WorkspaceConfig,
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Argv of the agent executable; `{prompt}` is substituted.
    pub command: Vec<String>,

    /// Extra arguments appended for the read-only planning run.
    pub plan_args: Vec<String>,

    /// Wall-clock budget for one agent run.
    pub timeout_secs: u64,

    /// Wait between the graceful stop signal and the forced kill.
    pub grace_period_ms: u64,

    /// Bytes of agent stderr kept for diagnostics.
    pub stderr_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortConfig {
    pub enabled: bool,
    /// First port of the pool (inclusive).
    pub start: u16,
    /// Last port of the pool (inclusive).
    pub end: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Repo-relative files symlinked into every workspace.
    pub shared_files: Vec<String>,
    /// Repo-relative files copied privately into each workspace.
    pub isolated_files: Vec<String>,
    /// Also delete `task/<id>` on the remote during cleanup.
    pub delete_remote_branches: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort the merge and fail the task immediately.
    #[default]
    Abort,
    /// Count a content conflict as a retryable attempt.
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    /// Shell command run in the merged workspace; empty skips verification.
    pub verify_command: String,
    /// Attempts of the full fetch/merge/verify/rebase/push sequence.
    pub max_attempts: u32,
    pub conflict_policy: ConflictPolicy,
    pub verify_timeout_secs: u64,
    /// Per-call bound for git invocations.
    pub git_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "-p",
                PROMPT_PLACEHOLDER,
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            plan_args: Vec::new(),
            timeout_secs: 10 * 60,
            grace_period_ms: 5_000,
            stderr_limit_bytes: 64 * 1024,
        }
    }
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: 9200,
            end: 9299,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            shared_files: Vec::new(),
            isolated_files: vec!["CLAUDE.md".to_string(), "PROGRESS.md".to_string()],
            delete_remote_branches: false,
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            verify_command: String::new(),
            max_attempts: 3,
            conflict_policy: ConflictPolicy::Abort,
            verify_timeout_secs: 5 * 60,
            git_timeout_secs: 60,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            integration_branch: "main".to_string(),
            remote: "origin".to_string(),
            push_to_remote: false,
            max_parallel_workers: 3,
            poll_interval_ms: 2_000,
            agent: AgentConfig::default(),
            ports: PortConfig::default(),
            workspace: WorkspaceConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.integration_branch.trim().is_empty() {
            return Err(anyhow!("integration_branch must not be empty"));
        }
        if self.push_to_remote && self.remote.trim().is_empty() {
            return Err(anyhow!("remote must be set when push_to_remote = true"));
        }
        if self.max_parallel_workers == 0 {
            return Err(anyhow!("max_parallel_workers must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.stderr_limit_bytes == 0 {
            return Err(anyhow!("agent.stderr_limit_bytes must be > 0"));
        }
        if self.ports.enabled {
            if self.ports.start > self.ports.end {
                return Err(anyhow!("ports.start must be <= ports.end"));
            }
            let width = usize::from(self.ports.end - self.ports.start) + 1;
            if width < self.max_parallel_workers {
                return Err(anyhow!(
                    "port range {}-{} holds {width} ports, fewer than max_parallel_workers = {}",
                    self.ports.start,
                    self.ports.end,
                    self.max_parallel_workers
                ));
            }
        }
        for file in self
            .workspace
            .shared_files
            .iter()
            .chain(&self.workspace.isolated_files)
        {
            let path = Path::new(file);
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(anyhow!(
                    "workspace file '{file}' must be a relative path inside the repository"
                ));
            }
        }
        if self.merge.max_attempts == 0 {
            return Err(anyhow!("merge.max_attempts must be > 0"));
        }
        if self.merge.verify_timeout_secs == 0 || self.merge.git_timeout_secs == 0 {
            return Err(anyhow!("merge timeouts must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.agent.grace_period_ms)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.merge.git_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.merge.verify_timeout_secs)
    }

    /// Remote used for fetch and push, when pushing is enabled.
    pub fn active_remote(&self) -> Option<&str> {
        self.push_to_remote.then_some(self.remote.as_str())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RelayConfig::default()`.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        let cfg = RelayConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RelayConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RelayConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RelayConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RelayConfig::default();
        cfg.merge.conflict_policy = ConflictPolicy::Retry;
        cfg.workspace.shared_files = vec!["notes.md".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_parallel_workers = 1\n[merge]\nverify_command = \"true\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_parallel_workers, 1);
        assert_eq!(cfg.merge.verify_command, "true");
        assert_eq!(cfg.merge.max_attempts, 3);
        assert_eq!(cfg.ports.start, 9200);
    }

    #[test]
    fn rejects_port_range_narrower_than_pool() {
        let mut cfg = RelayConfig::default();
        cfg.ports.start = 9200;
        cfg.ports.end = 9201;
        cfg.max_parallel_workers = 3;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("fewer than max_parallel_workers"));

        cfg.ports.enabled = false;
        cfg.validate().expect("disabled pool is not checked");
    }

    #[test]
    fn rejects_zero_attempts_and_empty_command() {
        let mut cfg = RelayConfig::default();
        cfg.merge.max_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.agent.command.clear();
        assert!(cfg.validate().is_err());
    }
}
