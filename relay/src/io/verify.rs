//! Post-merge verification command.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Bytes of verification output kept for diagnostics.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    /// Merged workspace the command runs in.
    pub workdir: PathBuf,
    /// Shell command line; empty means no verification.
    pub command: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Pass,
    Fail { output: String },
    Skipped,
}

pub trait VerifyRunner: Send + Sync {
    fn run(&self, request: &VerifyRequest) -> Result<VerifyOutcome>;
}

/// Runs the command through `sh -c`.
pub struct ShellVerifier;

impl VerifyRunner for ShellVerifier {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &VerifyRequest) -> Result<VerifyOutcome> {
        if request.command.trim().is_empty() {
            return Ok(VerifyOutcome::Skipped);
        }
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run verify command '{}'", request.command))?;

        if output.success() {
            debug!("verification passed");
            return Ok(VerifyOutcome::Pass);
        }
        warn!(
            exit_code = ?output.status.code(),
            timed_out = output.timed_out,
            "verification failed"
        );
        Ok(VerifyOutcome::Fail {
            output: output.diagnostics("verify"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str) -> VerifyRequest {
        VerifyRequest {
            workdir: std::env::temp_dir(),
            command: command.to_string(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    #[test]
    fn empty_command_is_skipped() {
        assert_eq!(
            ShellVerifier.run(&request("  ")).expect("run"),
            VerifyOutcome::Skipped
        );
    }

    #[test]
    fn failing_command_captures_output() {
        let outcome = ShellVerifier
            .run(&request("echo 'test_parse FAILED'; exit 1"))
            .expect("run");
        match outcome {
            VerifyOutcome::Fail { output } => assert!(output.contains("test_parse FAILED")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            ShellVerifier.run(&request("true")).expect("run"),
            VerifyOutcome::Pass
        );
    }
}
